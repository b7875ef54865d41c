//! Framework Compatibility Resolution
//!
//! Picks the target-framework folder of a package that best matches the
//! running host. Folder names carry a version token (`net6.0`, `abi2`,
//! `netstandard2.1`); the highest version not exceeding the runtime's own
//! version wins.

use crate::error::{Error, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Comparable version parsed out of a framework folder name
#[derive(Debug, Clone, Eq)]
pub struct FrameworkVersion(Vec<u64>);

impl FrameworkVersion {
    /// Parse the first `\d+(\.\d+)*` run in `name`
    pub fn parse(name: &str) -> Option<Self> {
        static TOKEN: OnceLock<Regex> = OnceLock::new();
        let token = TOKEN.get_or_init(|| Regex::new(r"\d+(?:\.\d+)*").expect("valid regex"));

        let found = token.find(name)?;
        let parts = found
            .as_str()
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .ok()?;
        Some(Self(parts))
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }
}

impl Ord for FrameworkVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Missing components compare as zero, so `6` == `6.0`
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for FrameworkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FrameworkVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl std::fmt::Display for FrameworkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// The selected framework folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkChoice {
    /// Folder name under the binaries root
    pub folder: String,
    /// Parsed version of the folder, if it carries one
    pub version: Option<FrameworkVersion>,
    /// True when no candidate was compatible and the first one was taken
    pub fallback: bool,
}

/// Select the best candidate folder for `runtime_framework`.
///
/// Returns `Ok(None)` only for an empty candidate list. With `strict` set,
/// the first-candidate fallback is replaced by `NoCompatibleFramework`.
pub fn resolve(
    runtime_framework: &str,
    candidates: &[String],
    strict: bool,
) -> Result<Option<FrameworkChoice>> {
    let runtime = FrameworkVersion::parse(runtime_framework)
        .ok_or_else(|| Error::UnparsableFrameworkVersion(runtime_framework.to_string()))?;

    if candidates.is_empty() {
        return Ok(None);
    }

    let mut best: Option<(&String, FrameworkVersion)> = None;
    for candidate in candidates {
        let Some(version) = FrameworkVersion::parse(candidate) else {
            debug!("Skipping framework folder without version: {}", candidate);
            continue;
        };
        if version > runtime {
            continue;
        }
        let better = match &best {
            Some((_, current)) => version > *current,
            None => true,
        };
        if better {
            best = Some((candidate, version));
        }
    }

    if let Some((folder, version)) = best {
        debug!(
            "Resolved framework folder '{}' for runtime {}",
            folder, runtime_framework
        );
        return Ok(Some(FrameworkChoice {
            folder: folder.clone(),
            version: Some(version),
            fallback: false,
        }));
    }

    if strict {
        return Err(Error::NoCompatibleFramework {
            runtime: runtime_framework.to_string(),
            candidates: candidates.to_vec(),
        });
    }

    let first = &candidates[0];
    warn!(
        "No framework folder compatible with {}; falling back to '{}'",
        runtime_framework, first
    );
    Ok(Some(FrameworkChoice {
        folder: first.clone(),
        version: FrameworkVersion::parse(first),
        fallback: true,
    }))
}

/// List sub-directory names of a binaries root, sorted by name
pub fn list_framework_folders(binaries_root: &Path) -> Result<Vec<String>> {
    let mut folders = Vec::new();
    for entry in std::fs::read_dir(binaries_root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                folders.push(name.to_string());
            }
        }
    }
    folders.sort();
    Ok(folders)
}
