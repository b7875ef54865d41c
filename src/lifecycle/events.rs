//! Lifecycle events published by the manager.

use super::registry::LoadedModule;
use serde::{Deserialize, Serialize};

/// Event delivered to lifecycle subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// A package was loaded and its plugins activated
    Loaded(LoadedModule),
    /// A package was unloaded
    Unloaded { package_id: String },
    /// A lifecycle operation failed
    Error { package_id: String, cause: String },
    /// A plugin type of a loading package could not be activated
    PluginActivationFailed {
        package_id: String,
        type_name: String,
        cause: String,
    },
}

impl LifecycleEvent {
    pub fn package_id(&self) -> &str {
        match self {
            LifecycleEvent::Loaded(module) => &module.package_id,
            LifecycleEvent::Unloaded { package_id }
            | LifecycleEvent::Error { package_id, .. }
            | LifecycleEvent::PluginActivationFailed { package_id, .. } => package_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LifecycleEvent::Error { .. })
    }
}
