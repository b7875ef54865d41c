//! Error types for the package lifecycle manager.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for package lifecycle operations
#[derive(Debug, Error)]
pub enum Error {
    /// The package already has a context mapping (or a load is in flight)
    #[error("Package already loaded: {0}")]
    AlreadyLoaded(String),

    /// The package id cannot be used to name files on disk
    #[error("Invalid package id: {0:?}")]
    InvalidPackageId(String),

    /// Unload of a package that has no context mapping
    #[error("Package not loaded: {0}")]
    NotLoaded(String),

    /// Another load or unload of the same package is still running
    #[error("Operation already in progress for package: {0}")]
    OperationInProgress(String),

    /// The extracted package has no binaries root directory
    #[error("Package has no binaries root '{root}' under {}", .scratch.display())]
    MissingBinariesRoot { root: String, scratch: PathBuf },

    /// No framework folder could be selected
    #[error("No compatible framework for runtime '{runtime}' (candidates: {candidates:?})")]
    NoCompatibleFramework {
        runtime: String,
        candidates: Vec<String>,
    },

    /// The runtime's own framework identifier carries no version token
    #[error("Unparsable framework version: {0}")]
    UnparsableFrameworkVersion(String),

    /// Archive extraction failed
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// The isolation boundary refused or failed to load modules
    #[error("Boundary load failure: {0}")]
    BoundaryLoadFailure(String),

    /// The isolation boundary refused or failed to unload a context
    #[error("Boundary unload failure: {0}")]
    BoundaryUnloadFailure(String),

    /// A single plugin type could not be constructed or initialized
    #[error("Plugin activation error ({type_name}): {reason}")]
    PluginActivationError { type_name: String, reason: String },

    /// The package failed the authorship gate
    #[error("Unauthorized source: {0}")]
    UnauthorizedSource(String),

    /// The package source does not know the package/version
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    /// Package manifest could not be read
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Structural precondition failures are raised before any side effect.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::AlreadyLoaded(_)
                | Error::NotLoaded(_)
                | Error::OperationInProgress(_)
                | Error::InvalidPackageId(_)
        )
    }

    pub(crate) fn activation(type_name: impl Into<String>, reason: impl ToString) -> Self {
        Error::PluginActivationError {
            type_name: type_name.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::ExtractionError(e.to_string())
    }
}
