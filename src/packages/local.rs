//! Local directory package feed
//!
//! A feed is a directory of `*.nupkg` zip archives. Each archive carries a
//! `package.toml` manifest at its root:
//!
//! ```toml
//! [package]
//! id = "Acme.Connectors"
//! version = "1.2.0"
//! authors = ["acme"]
//! description = "Database connectors"
//! ```

use super::{compare_versions, validate_package_id, PackageMetadata, PackageSource};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Manifest file name inside a package archive
pub const MANIFEST_FILE: &str = "package.toml";

/// Package archive file extension
pub const PACKAGE_EXTENSION: &str = "nupkg";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackageManifest {
    package: PackageMetadata,
}

/// Package source reading archives from a local directory
#[derive(Debug, Clone)]
pub struct LocalPackageSource {
    feed_dir: PathBuf,
    cache_dir: PathBuf,
    trusted_authors: Vec<String>,
}

impl LocalPackageSource {
    pub fn new(feed_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            feed_dir: feed_dir.into(),
            cache_dir: cache_dir.into(),
            trusted_authors: Vec::new(),
        }
    }

    /// Restrict installation to packages by one of `authors`
    pub fn with_trusted_authors(mut self, authors: Vec<String>) -> Self {
        self.trusted_authors = authors;
        self
    }

    pub fn from_config(config: &crate::config::SourceConfig) -> Self {
        Self::new(&config.feed_dir, &config.cache_dir)
            .with_trusted_authors(config.trusted_authors.clone())
    }

    pub fn feed_dir(&self) -> &Path {
        &self.feed_dir
    }

    /// Read every archive of the feed; unreadable archives are skipped
    async fn scan(&self) -> Result<Vec<(PathBuf, PackageMetadata)>> {
        let feed_dir = self.feed_dir.clone();
        tokio::task::spawn_blocking(move || scan_feed(&feed_dir))
            .await
            .map_err(|e| Error::Manifest(format!("feed scan task failed: {}", e)))?
    }

    fn is_trusted(&self, metadata: &PackageMetadata) -> bool {
        if self.trusted_authors.is_empty() {
            return true;
        }
        metadata.authors.iter().any(|author| {
            self.trusted_authors
                .iter()
                .any(|trusted| trusted.eq_ignore_ascii_case(author))
        })
    }
}

#[async_trait]
impl PackageSource for LocalPackageSource {
    async fn search(&self, term: &str, limit: usize) -> Result<Vec<PackageMetadata>> {
        let needle = term.to_lowercase();
        let mut found: Vec<PackageMetadata> = self
            .scan()
            .await?
            .into_iter()
            .map(|(_, metadata)| metadata)
            .filter(|m| {
                needle.is_empty()
                    || m.id.to_lowercase().contains(&needle)
                    || m.description.to_lowercase().contains(&needle)
            })
            .collect();
        found.sort_by(|a, b| {
            a.id.cmp(&b.id)
                .then_with(|| compare_versions(&a.version, &b.version))
        });
        found.truncate(limit);
        debug!("Search '{}' matched {} package(s)", term, found.len());
        Ok(found)
    }

    async fn download(&self, id: &str, version: &str) -> Result<PathBuf> {
        let (archive, metadata) = self
            .scan()
            .await?
            .into_iter()
            .find(|(_, m)| m.id.eq_ignore_ascii_case(id) && m.version == version)
            .ok_or_else(|| Error::PackageNotFound(format!("{} {}", id, version)))?;
        // The manifest id names the cache file
        validate_package_id(&metadata.id)?;

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let target = self.cache_dir.join(format!(
            "{}.{}.{}",
            metadata.id, metadata.version, PACKAGE_EXTENSION
        ));
        tokio::fs::copy(&archive, &target).await?;

        info!("Acquired {} {} into {:?}", metadata.id, metadata.version, target);
        Ok(target)
    }

    async fn verify_authorship(&self, id: &str) -> Result<bool> {
        let packages = self.scan().await?;
        let metadata = packages
            .iter()
            .map(|(_, m)| m)
            .filter(|m| m.id.eq_ignore_ascii_case(id))
            .max_by(|a, b| compare_versions(&a.version, &b.version))
            .ok_or_else(|| Error::PackageNotFound(id.to_string()))?;

        let trusted = self.is_trusted(metadata);
        if !trusted {
            warn!(
                "Package {} by {:?} is not from a trusted author",
                id, metadata.authors
            );
        }
        Ok(trusted)
    }
}

fn scan_feed(feed_dir: &Path) -> Result<Vec<(PathBuf, PackageMetadata)>> {
    let mut packages = Vec::new();
    if !feed_dir.exists() {
        debug!("Package feed does not exist: {:?}", feed_dir);
        return Ok(packages);
    }

    for entry in std::fs::read_dir(feed_dir)? {
        let path = entry?.path();
        let is_package = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(PACKAGE_EXTENSION))
            .unwrap_or(false);
        if !is_package {
            continue;
        }
        match read_manifest(&path) {
            Ok(metadata) => packages.push((path, metadata)),
            Err(e) => warn!("Skipping unreadable package {:?}: {}", path, e),
        }
    }
    packages.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(packages)
}

/// Read the manifest of a package archive
pub fn read_manifest(archive: &Path) -> Result<PackageMetadata> {
    let file = File::open(archive)?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| Error::Manifest(format!("{}", e)))?;
    let mut entry = zip
        .by_name(MANIFEST_FILE)
        .map_err(|_| Error::Manifest(format!("{} missing", MANIFEST_FILE)))?;

    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    let manifest: PackageManifest =
        toml::from_str(&content).map_err(|e| Error::Manifest(e.to_string()))?;
    Ok(manifest.package)
}
