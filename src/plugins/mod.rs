//! Plugin Contract and Discovery
//!
//! This module defines the capability contract every activatable plugin
//! implements, the registration surface a binary module uses to announce its
//! types, and the discoverer that activates plugins inside an isolation
//! context.
//!
//! # Examples
//!
//! ## Writing a plugin module
//!
//! ```rust
//! use nugget_rs::plugins::{Plugin, PluginFault, PluginRegistrar};
//!
//! struct Greeter;
//!
//! impl Plugin for Greeter {
//!     fn id(&self) -> &str { "greeter" }
//!     fn name(&self) -> &str { "Greeter" }
//!     fn version(&self) -> &str { "1.0.0" }
//!     fn initialize(&mut self) -> Result<(), PluginFault> { Ok(()) }
//!     fn start(&mut self) -> Result<(), PluginFault> { Ok(()) }
//!     fn stop(&mut self) -> Result<(), PluginFault> { Ok(()) }
//! }
//!
//! fn register(registrar: &mut dyn PluginRegistrar) {
//!     registrar.register_plugin("greeter::Greeter", |_args| Ok(Box::new(Greeter)));
//! }
//!
//! nugget_rs::export_plugins!(register);
//! ```

pub mod discovery;
pub mod types;

pub use discovery::{DiscoveryReport, PluginDiscoverer};
pub use types::*;

/// Plugin API version. Native modules built against another version are
/// refused by the native boundary.
pub const PLUGIN_API_VERSION: &str = "2.0";

/// Version of the host crate a native module was compiled against
pub const HOST_CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Arguments handed to plugin constructors
pub type PluginArgs = serde_json::Value;

/// Failure reported by a plugin constructor or lifecycle hook
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct PluginFault {
    message: String,
}

impl PluginFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Plugin capability contract: identify, initialize, start, stop
pub trait Plugin: Send + Sync {
    /// Stable plugin identifier
    fn id(&self) -> &str;

    /// Display name
    fn name(&self) -> &str;

    /// Plugin version
    fn version(&self) -> &str;

    /// Human readable description
    fn description(&self) -> &str {
        ""
    }

    /// Capability tokens this plugin provides (used by capability lookups)
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Prepare the plugin. Only plugins that initialize are activated.
    fn initialize(&mut self) -> Result<(), PluginFault>;

    /// Begin work
    fn start(&mut self) -> Result<(), PluginFault>;

    /// Stop work before the owning context is unloaded
    fn stop(&mut self) -> Result<(), PluginFault>;
}

/// Exported by every native plugin module under [`api::DECLARATION_SYMBOL`]
pub struct PluginDeclaration {
    pub api_version: &'static str,
    pub host_version: &'static str,
    pub register: fn(&mut dyn PluginRegistrar),
}

/// Export the plugin declaration of a native module
#[macro_export]
macro_rules! export_plugins {
    ($register:expr) => {
        #[doc(hidden)]
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static nugget_plugin_declaration: $crate::plugins::PluginDeclaration =
            $crate::plugins::PluginDeclaration {
                api_version: $crate::plugins::PLUGIN_API_VERSION,
                host_version: $crate::plugins::HOST_CRATE_VERSION,
                register: $register,
            };
    };
}

/// Plugin API compatibility check
pub fn check_plugin_api_compatibility(api_version: &str, host_version: &str) -> Result<(), String> {
    if api_version != PLUGIN_API_VERSION {
        return Err(format!(
            "Module built with plugin API {} but runtime uses {}",
            api_version, PLUGIN_API_VERSION
        ));
    }
    if host_version != HOST_CRATE_VERSION {
        return Err(format!(
            "Module built against nugget-rs {} but runtime is {}",
            host_version, HOST_CRATE_VERSION
        ));
    }
    Ok(())
}
