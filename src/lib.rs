//! # nugget-rs
//!
//! Runtime lifecycle management for package-delivered plugins.
//!
//! A package archive is extracted into a scratch directory, the framework
//! folder best matching the running host is selected, its binary modules are
//! loaded into a reclaimable isolation context and every plugin type found
//! there is activated. Unloading stops the plugins and releases the context;
//! scratch directories are removed in the background.
//!
//! ```rust,no_run
//! use nugget_rs::config::ConfigLoader;
//! use nugget_rs::isolation::NativeBoundary;
//! use nugget_rs::packages::LocalPackageSource;
//! use nugget_rs::LifecycleManager;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ConfigLoader::new().load_from_env().build()?;
//! let source = Arc::new(LocalPackageSource::from_config(&config.source));
//! let manager = LifecycleManager::new(config, Arc::new(NativeBoundary::new()), source);
//!
//! let module = manager.install_and_load("Acme.Connectors", "1.2.0").await?;
//! for plugin in manager.plugins().await {
//!     println!("{} v{} in {}", plugin.name, plugin.version, module.context_id);
//! }
//! manager.unload("Acme.Connectors").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod framework;
pub mod isolation;
pub mod lifecycle;
pub mod logging;
pub mod packages;
pub mod plugins;

pub use config::{ConfigLoader, ManagerConfig};
pub use error::{Error, Result};
pub use lifecycle::{LifecycleEvent, LifecycleManager, LoadedModule};
pub use plugins::{ActivatedPlugin, Plugin, PluginFault};
