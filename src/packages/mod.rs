//! Package acquisition
//!
//! The package source interface consumed by the lifecycle manager, the
//! records kept about offered packages, and archive extraction.

pub mod extractor;
pub mod local;

pub use extractor::{extract, ExtractionSummary};
pub use local::LocalPackageSource;

use crate::error::{Error, Result};
use crate::framework::FrameworkVersion;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;

/// Package metadata as reported by a package source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    /// Package identifier
    pub id: String,
    /// Declared version
    pub version: String,
    /// Package authors
    #[serde(default)]
    pub authors: Vec<String>,
    /// Human readable description
    #[serde(default)]
    pub description: String,
}

/// A package offered for installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    /// Whether the package is currently loaded
    pub installed: bool,
    /// Set when the source no longer offers the package
    pub stale: bool,
}

impl PackageRecord {
    pub fn from_metadata(metadata: &PackageMetadata, installed: bool) -> Self {
        Self {
            name: metadata.id.clone(),
            version: metadata.version.clone(),
            author: metadata.authors.join(", "),
            description: metadata.description.clone(),
            installed,
            stale: false,
        }
    }
}

/// Check that `id` can name a scratch directory or cache file.
///
/// Ids are used as a single path component, so separators, `.`/`..`,
/// drive prefixes and control characters are rejected.
pub fn validate_package_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && !id.contains("..")
        && !id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidPackageId(id.to_string()))
    }
}

/// Order package versions by their numeric components (`1.9.0` < `1.10.0`).
///
/// Versions without a numeric part fall back to string order.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (FrameworkVersion::parse(a), FrameworkVersion::parse(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

/// Source of package archives
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// Search packages whose id or description matches `term`
    async fn search(&self, term: &str, limit: usize) -> Result<Vec<PackageMetadata>>;

    /// Acquire the archive of `id`/`version`; fails with `PackageNotFound`
    async fn download(&self, id: &str, version: &str) -> Result<PathBuf>;

    /// Authorship gate deciding whether `id` may be installed at all
    async fn verify_authorship(&self, id: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_metadata() {
        let metadata = PackageMetadata {
            id: "Acme.Connectors".to_string(),
            version: "1.2.0".to_string(),
            authors: vec!["acme".to_string(), "contrib".to_string()],
            description: "Database connectors".to_string(),
        };
        let record = PackageRecord::from_metadata(&metadata, false);
        assert_eq!(record.name, "Acme.Connectors");
        assert_eq!(record.author, "acme, contrib");
        assert!(!record.installed);
        assert!(!record.stale);
    }

    #[test]
    fn test_package_id_validation() {
        assert!(validate_package_id("Acme.Connectors").is_ok());
        assert!(validate_package_id("acme-tools_2").is_ok());

        for bad in ["", ".", "..", "../../escaped", "/tmp/abs", "a/b", "a\\b", "C:evil", "a..b"] {
            assert!(
                matches!(validate_package_id(bad), Err(Error::InvalidPackageId(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_version_ordering_is_numeric() {
        assert_eq!(compare_versions("1.9.0", "1.10.0"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0", "1.10.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("nightly", "stable"), Ordering::Less);
    }
}
