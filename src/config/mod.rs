//! Configuration
//!
//! Defaults, an optional `nugget-rs.toml` and `NUGGET_` environment
//! variables are layered by [`ConfigLoader`].

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::{CleanupConfig, LoggingConfig, ManagerConfig, SourceConfig};
