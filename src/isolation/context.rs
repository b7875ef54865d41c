//! Context bookkeeping shared by the boundary implementations.

use super::{ContextInfo, ModuleHandle};
use crate::plugins::{PluginFactory, RegisteredType, TypeDescriptor};
use chrono::{DateTime, Utc};

/// A module loaded into a context, with whatever keeps its code alive
pub(crate) struct ContextModule<R> {
    pub handle: ModuleHandle,
    pub types: Vec<RegisteredType>,
    pub resource: R,
}

/// One isolation context
pub(crate) struct IsolatedContext<R> {
    pub context_id: String,
    pub loaded_at: DateTime<Utc>,
    pub modules: Vec<ContextModule<R>>,
}

impl<R> IsolatedContext<R> {
    pub fn new(context_id: &str, modules: Vec<ContextModule<R>>) -> Self {
        Self {
            context_id: context_id.to_string(),
            loaded_at: Utc::now(),
            modules,
        }
    }

    pub fn handles(&self) -> Vec<ModuleHandle> {
        self.modules.iter().map(|m| m.handle.clone()).collect()
    }

    pub fn info(&self) -> ContextInfo {
        ContextInfo {
            context_id: self.context_id.clone(),
            modules: self.handles(),
            loaded_at: self.loaded_at,
        }
    }

    /// Types of a module, `None` if the module is not part of this context
    pub fn types_of(&self, module: &ModuleHandle) -> Option<Vec<TypeDescriptor>> {
        self.modules
            .iter()
            .find(|m| m.handle.name == module.name && m.handle.path == module.path)
            .map(|m| m.types.iter().map(|t| t.descriptor.clone()).collect())
    }

    /// Look up a type token. Resolution only ever sees this context's modules.
    pub fn find_type(&self, type_name: &str) -> Option<(&RegisteredType, &R)> {
        self.modules.iter().find_map(|m| {
            m.types
                .iter()
                .find(|t| t.descriptor.type_name == type_name)
                .map(|t| (t, &m.resource))
        })
    }
}

/// Run a factory, turning a panic into an error message
pub(crate) fn run_factory(
    factory: &PluginFactory,
    args: &crate::plugins::PluginArgs,
) -> Result<Box<dyn crate::plugins::Plugin>, String> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| factory(args))) {
        Ok(Ok(instance)) => Ok(instance),
        Ok(Err(fault)) => Err(fault.to_string()),
        Err(panic) => Err(format!("constructor panicked: {}", panic_message(&*panic))),
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
