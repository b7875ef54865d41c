//! In-process isolation boundary
//!
//! Modules are registered up front under their file stem together with the
//! types they provide. Loading a folder maps every file whose stem is
//! registered to a module of a fresh context; each context gets its own copy
//! of the registrations, so type resolution never crosses contexts.

use super::context::{run_factory, ContextModule, IsolatedContext};
use super::{
    BoundaryEvent, ContextInfo, IsolationBoundary, LoadedModules, ModuleHandle,
    BOUNDARY_EVENT_CAPACITY,
};
use crate::error::{Error, Result};
use crate::plugins::{Plugin, PluginArgs, PluginRegistrar, RegisteredType, TypeCollector, TypeDescriptor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Boundary for statically linked plugin modules
pub struct InProcessBoundary {
    catalog: HashMap<String, Vec<RegisteredType>>,
    contexts: RwLock<HashMap<String, IsolatedContext<()>>>,
    events: broadcast::Sender<BoundaryEvent>,
}

impl InProcessBoundary {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BOUNDARY_EVENT_CAPACITY);
        Self {
            catalog: HashMap::new(),
            contexts: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register the module `name` (matched against file stems)
    pub fn with_module<F>(mut self, name: impl Into<String>, register: F) -> Self
    where
        F: FnOnce(&mut dyn PluginRegistrar),
    {
        let mut collector = TypeCollector::new();
        register(&mut collector);
        self.catalog.insert(name.into(), collector.into_types());
        self
    }

    /// Names of the registered modules
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalog.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InProcessBoundary {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IsolationBoundary for InProcessBoundary {
    async fn load_modules(&self, folder: &Path, context_id: &str) -> Result<LoadedModules> {
        if self.contexts.read().await.contains_key(context_id) {
            return Err(Error::BoundaryLoadFailure(format!(
                "context '{}' already exists",
                context_id
            )));
        }

        let mut entries = tokio::fs::read_dir(folder).await.map_err(|e| {
            Error::BoundaryLoadFailure(format!("cannot read {}: {}", folder.display(), e))
        })?;

        let mut modules = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.catalog.get(stem) {
                Some(types) => modules.push(ContextModule {
                    handle: ModuleHandle {
                        name: stem.to_string(),
                        path: path.clone(),
                        context_id: context_id.to_string(),
                    },
                    types: types.clone(),
                    resource: (),
                }),
                None => debug!("No registered module for {:?}; skipping", path),
            }
        }
        modules.sort_by(|a, b| a.handle.name.cmp(&b.handle.name));

        let context = IsolatedContext::new(context_id, modules);
        let handles = context.handles();

        {
            let mut contexts = self.contexts.write().await;
            if contexts.contains_key(context_id) {
                return Err(Error::BoundaryLoadFailure(format!(
                    "context '{}' already exists",
                    context_id
                )));
            }
            contexts.insert(context_id.to_string(), context);
        }

        info!(
            "Loaded {} module(s) into context {}",
            handles.len(),
            context_id
        );
        let _ = self.events.send(BoundaryEvent::ContextLoaded {
            context_id: context_id.to_string(),
            module_count: handles.len(),
        });

        Ok(LoadedModules {
            context_id: context_id.to_string(),
            modules: handles,
        })
    }

    async fn unload_context(&self, context_id: &str) -> Result<bool> {
        let removed = self.contexts.write().await.remove(context_id);
        match removed {
            Some(_) => {
                info!("Unloaded context {}", context_id);
                let _ = self.events.send(BoundaryEvent::ContextUnloaded {
                    context_id: context_id.to_string(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn enumerate_types(
        &self,
        context_id: &str,
        module: &ModuleHandle,
    ) -> Result<Vec<TypeDescriptor>> {
        let contexts = self.contexts.read().await;
        let context = contexts.get(context_id).ok_or_else(|| {
            Error::BoundaryLoadFailure(format!("unknown context '{}'", context_id))
        })?;
        context.types_of(module).ok_or_else(|| {
            Error::BoundaryLoadFailure(format!(
                "module '{}' is not part of context '{}'",
                module.name, context_id
            ))
        })
    }

    async fn create_instance(
        &self,
        context_id: &str,
        type_name: &str,
        args: &PluginArgs,
    ) -> Result<Box<dyn Plugin>> {
        let factory = {
            let contexts = self.contexts.read().await;
            let context = contexts.get(context_id).ok_or_else(|| {
                Error::activation(type_name, format!("unknown context '{}'", context_id))
            })?;
            let (registered, _) = context
                .find_type(type_name)
                .ok_or_else(|| Error::activation(type_name, "type not found in context"))?;
            registered
                .factory
                .clone()
                .ok_or_else(|| Error::activation(type_name, "type has no constructor"))?
        };

        run_factory(&factory, args).map_err(|reason| Error::activation(type_name, reason))
    }

    async fn active_contexts(&self) -> Vec<ContextInfo> {
        let contexts = self.contexts.read().await;
        let mut infos: Vec<ContextInfo> = contexts.values().map(|c| c.info()).collect();
        infos.sort_by(|a, b| a.context_id.cmp(&b.context_id));
        infos
    }

    fn subscribe(&self) -> broadcast::Receiver<BoundaryEvent> {
        self.events.subscribe()
    }
}
