//! Plugin Type Definitions
//!
//! Common types shared by the isolation boundaries and the discoverer.

use super::{Plugin, PluginArgs, PluginFault};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Plugin ABI constants
pub mod api {
    /// Symbol name of the static `PluginDeclaration` in native modules
    pub const DECLARATION_SYMBOL: &[u8] = b"nugget_plugin_declaration\0";
}

/// Constructor of a plugin type, executed inside its isolation context
pub type PluginFactory =
    Arc<dyn Fn(&PluginArgs) -> Result<Box<dyn Plugin>, PluginFault> + Send + Sync>;

/// Shared handle to a running plugin instance
pub type PluginHandle = Arc<Mutex<Box<dyn Plugin>>>;

/// Shape of a type announced by a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    /// Constructible type
    Concrete,
    /// Base type that cannot be constructed on its own
    Abstract,
    /// Contract-only declaration
    Interface,
}

/// Type information a module contributes to its context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Fully qualified type token, unique within a context
    pub type_name: String,
    pub kind: TypeKind,
    /// Whether the type satisfies the [`Plugin`] contract
    pub implements_plugin: bool,
}

impl TypeDescriptor {
    pub fn new(type_name: impl Into<String>, kind: TypeKind, implements_plugin: bool) -> Self {
        Self {
            type_name: type_name.into(),
            kind,
            implements_plugin,
        }
    }

    /// A concrete type implementing the plugin contract
    pub fn plugin(type_name: impl Into<String>) -> Self {
        Self::new(type_name, TypeKind::Concrete, true)
    }

    /// Whether the discoverer should try to activate this type
    pub fn is_activatable(&self) -> bool {
        self.kind == TypeKind::Concrete && self.implements_plugin
    }
}

/// Registration surface handed to a module's `register` function
pub trait PluginRegistrar {
    /// Announce a type; `factory` is `None` for types that cannot be built
    fn register(&mut self, descriptor: TypeDescriptor, factory: Option<PluginFactory>);

    /// Announce a concrete plugin type with a plain constructor
    fn register_plugin(
        &mut self,
        type_name: &str,
        factory: fn(&PluginArgs) -> Result<Box<dyn Plugin>, PluginFault>,
    ) {
        let factory: PluginFactory = Arc::new(factory);
        self.register(TypeDescriptor::plugin(type_name), Some(factory));
    }
}

/// A type announced by a module together with its constructor
#[derive(Clone)]
pub struct RegisteredType {
    pub descriptor: TypeDescriptor,
    pub factory: Option<PluginFactory>,
}

impl std::fmt::Debug for RegisteredType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredType")
            .field("descriptor", &self.descriptor)
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

/// Registrar that collects every announced type
#[derive(Debug, Default)]
pub struct TypeCollector {
    types: Vec<RegisteredType>,
}

impl TypeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_types(self) -> Vec<RegisteredType> {
        self.types
    }
}

impl PluginRegistrar for TypeCollector {
    fn register(&mut self, descriptor: TypeDescriptor, factory: Option<PluginFactory>) {
        if let Some(existing) = self
            .types
            .iter_mut()
            .find(|t| t.descriptor.type_name == descriptor.type_name)
        {
            tracing::warn!(
                "Type '{}' registered twice; keeping the latest registration",
                descriptor.type_name
            );
            *existing = RegisteredType {
                descriptor,
                factory,
            };
            return;
        }
        self.types.push(RegisteredType {
            descriptor,
            factory,
        });
    }
}

/// A plugin instance activated inside an isolation context
#[derive(Clone)]
pub struct ActivatedPlugin {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    /// Owning isolation context
    pub context_id: String,
    /// Type token the instance was built from
    pub type_name: String,
    pub capabilities: Vec<String>,
    pub instance: PluginHandle,
}

impl ActivatedPlugin {
    /// Registry key: `{context_id}::{plugin_id}`
    pub fn registry_key(&self) -> String {
        registry_key(&self.context_id, &self.id)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

impl std::fmt::Debug for ActivatedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivatedPlugin")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("context_id", &self.context_id)
            .field("type_name", &self.type_name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Build the registry key of a plugin owned by `context_id`
pub fn registry_key(context_id: &str, plugin_id: &str) -> String {
    format!("{}{}", context_prefix(context_id), plugin_id)
}

/// Key prefix shared by every plugin of a context
pub fn context_prefix(context_id: &str) -> String {
    format!("{}::", context_id)
}
