//! Package Extractor
//!
//! Unpacks a package archive into a scratch directory, keeping the archive's
//! internal folder layout. Partial output is left in place on failure; the
//! scratch directory is removed by the cleanup scheduler.

use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What an extraction produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub destination: PathBuf,
    pub files: usize,
    pub directories: usize,
}

/// Extract `archive` under `destination` on the blocking pool
pub async fn extract(archive: &Path, destination: &Path) -> Result<ExtractionSummary> {
    let archive = archive.to_path_buf();
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &destination))
        .await
        .map_err(|e| Error::ExtractionError(format!("extraction task failed: {}", e)))?
}

/// Synchronous extraction
pub fn extract_blocking(archive: &Path, destination: &Path) -> Result<ExtractionSummary> {
    debug!("Extracting {:?} into {:?}", archive, destination);

    let file = File::open(archive).map_err(|e| {
        Error::ExtractionError(format!("cannot open {}: {}", archive.display(), e))
    })?;
    let mut zip = zip::ZipArchive::new(file)?;

    fs::create_dir_all(destination).map_err(|e| io_failure(destination, e))?;

    let mut summary = ExtractionSummary {
        destination: destination.to_path_buf(),
        files: 0,
        directories: 0,
    };

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            Error::ExtractionError(format!("unsafe entry path in archive: {}", entry.name()))
        })?;
        let out_path = destination.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| io_failure(&out_path, e))?;
            summary.directories += 1;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_failure(parent, e))?;
        }

        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&out_path)
            .map_err(|e| io_failure(&out_path, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| io_failure(&out_path, e))?;
        summary.files += 1;
    }

    debug!(
        "Extracted {} file(s), {} director(ies) into {:?}",
        summary.files, summary.directories, destination
    );
    Ok(summary)
}

fn io_failure(path: &Path, e: io::Error) -> Error {
    Error::ExtractionError(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(*name, SimpleFileOptions::default())
                    .unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn test_extract_preserves_layout() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.nupkg");
        write_archive(
            &archive,
            &[
                ("package.toml", b"[package]\nid = \"a\"\nversion = \"1.0\"\n"),
                ("lib/", b""),
                ("lib/net6.0/a.so", b"binary"),
                ("content/readme.txt", b"hello"),
            ],
        );

        let dest = dir.path().join("scratch");
        let summary = extract(&archive, &dest).await.unwrap();
        assert_eq!(summary.files, 3);
        assert_eq!(summary.directories, 1);
        assert_eq!(
            std::fs::read(dest.join("lib/net6.0/a.so")).unwrap(),
            b"binary"
        );
        assert!(dest.join("content/readme.txt").exists());
    }

    #[tokio::test]
    async fn test_collision_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.nupkg");
        write_archive(&archive, &[("lib/net6.0/a.so", b"new")]);

        let dest = dir.path().join("scratch");
        std::fs::create_dir_all(dest.join("lib/net6.0")).unwrap();
        std::fs::write(dest.join("lib/net6.0/a.so"), b"old").unwrap();

        let result = extract(&archive, &dest).await;
        assert!(matches!(result, Err(Error::ExtractionError(_))));
        assert_eq!(std::fs::read(dest.join("lib/net6.0/a.so")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.nupkg");
        std::fs::write(&archive, b"definitely not zip").unwrap();

        let result = extract(&archive, &dir.path().join("scratch")).await;
        assert!(matches!(result, Err(Error::ExtractionError(_))));
    }

    #[tokio::test]
    async fn test_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract(&dir.path().join("absent.nupkg"), &dir.path().join("s")).await;
        assert!(matches!(result, Err(Error::ExtractionError(_))));
    }
}
