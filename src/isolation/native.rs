//! Native isolation boundary
//!
//! Provides context-scoped loading of shared libraries using libloading.
//!
//! Every file with the platform's dynamic library extension in the module
//! folder is opened. Libraries exporting `nugget_plugin_declaration` announce
//! their types through the declaration's `register` function; libraries
//! without it are kept loaded as dependencies of the context.
//!
//! Instances created from a library hold a reference to it, so a library is
//! closed only when its context is unloaded *and* the last instance is gone.

use super::context::{panic_message, run_factory, ContextModule, IsolatedContext};
use super::{
    BoundaryEvent, ContextInfo, IsolationBoundary, LoadedModules, ModuleHandle,
    BOUNDARY_EVENT_CAPACITY,
};
use crate::error::{Error, Result};
use crate::plugins::{
    api, check_plugin_api_compatibility, Plugin, PluginArgs, PluginDeclaration, PluginFault,
    RegisteredType, TypeCollector, TypeDescriptor,
};
use async_trait::async_trait;
use libloading::{Library, Symbol};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Boundary backed by dynamically loaded shared libraries
pub struct NativeBoundary {
    contexts: RwLock<HashMap<String, IsolatedContext<Arc<Library>>>>,
    /// Libraries of unloaded contexts that may still be referenced by instances
    retired: Mutex<Vec<(String, Weak<Library>)>>,
    events: broadcast::Sender<BoundaryEvent>,
}

impl NativeBoundary {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BOUNDARY_EVENT_CAPACITY);
        Self {
            contexts: RwLock::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Whether `path` carries the platform's dynamic library extension
    pub fn is_module_file(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(std::env::consts::DLL_EXTENSION))
            .unwrap_or(false)
    }

    /// Number of retired libraries still held open by live instances
    pub fn retired_library_count(&self) -> usize {
        self.retired
            .lock()
            .map(|retired| retired.iter().filter(|(_, w)| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    fn open_module(path: &Path, context_id: &str) -> Result<ContextModule<Arc<Library>>> {
        let name = module_name(path);
        debug!("Opening native module {:?} for context {}", path, context_id);

        let library = unsafe { Library::new(path) }.map_err(|e| {
            Error::BoundaryLoadFailure(format!("failed to open {}: {}", path.display(), e))
        })?;

        let declared = unsafe {
            library
                .get::<*const PluginDeclaration>(api::DECLARATION_SYMBOL)
                .ok()
                .map(|symbol: Symbol<*const PluginDeclaration>| *symbol)
        };

        let types = match declared {
            Some(declaration) if !declaration.is_null() => {
                declared_types(unsafe { &*declaration }, path)?
            }
            _ => {
                debug!(
                    "{:?} exports no plugin declaration; loaded as dependency",
                    path
                );
                Vec::new()
            }
        };

        Ok(ContextModule {
            handle: ModuleHandle {
                name,
                path: path.to_path_buf(),
                context_id: context_id.to_string(),
            },
            types,
            resource: Arc::new(library),
        })
    }
}

impl Default for NativeBoundary {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IsolationBoundary for NativeBoundary {
    async fn load_modules(&self, folder: &Path, context_id: &str) -> Result<LoadedModules> {
        if self.contexts.read().await.contains_key(context_id) {
            return Err(Error::BoundaryLoadFailure(format!(
                "context '{}' already exists",
                context_id
            )));
        }

        let mut paths: Vec<PathBuf> = Vec::new();
        let mut entries = tokio::fs::read_dir(folder).await.map_err(|e| {
            Error::BoundaryLoadFailure(format!("cannot read {}: {}", folder.display(), e))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && Self::is_module_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        // A failure drops every library opened so far
        let mut modules = Vec::with_capacity(paths.len());
        for path in &paths {
            modules.push(Self::open_module(path, context_id)?);
        }
        if modules.is_empty() {
            warn!("No native modules found in {:?}", folder);
        }

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
            "Loaded {} native module(s) into context {}",
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
        let Some(context) = self.contexts.write().await.remove(context_id) else {
            return Ok(false);
        };

        let mut weak_refs = Vec::with_capacity(context.modules.len());
        for module in context.modules {
            weak_refs.push((module.handle.name.clone(), Arc::downgrade(&module.resource)));
        }
        if let Ok(mut retired) = self.retired.lock() {
            retired.extend(weak_refs);
        }

        info!("Unloaded native context {}", context_id);
        let _ = self.events.send(BoundaryEvent::ContextUnloaded {
            context_id: context_id.to_string(),
        });
        Ok(true)
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
        let (factory, library) = {
            let contexts = self.contexts.read().await;
            let context = contexts.get(context_id).ok_or_else(|| {
                Error::activation(type_name, format!("unknown context '{}'", context_id))
            })?;
            let (registered, library) = context
                .find_type(type_name)
                .ok_or_else(|| Error::activation(type_name, "type not found in context"))?;
            let factory = registered
                .factory
                .clone()
                .ok_or_else(|| Error::activation(type_name, "type has no constructor"))?;
            (factory, Arc::clone(library))
        };

        let plugin =
            run_factory(&factory, args).map_err(|reason| Error::activation(type_name, reason))?;
        Ok(Box::new(NativeInstance {
            plugin,
            _library: library,
        }))
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

    fn release_hint(&self) {
        let Ok(mut retired) = self.retired.lock() else {
            return;
        };
        retired.retain(|(_, weak)| weak.strong_count() > 0);
        if !retired.is_empty() {
            let names: Vec<&str> = retired.iter().map(|(name, _)| name.as_str()).collect();
            debug!(
                "{} retired native module(s) still referenced: {:?}",
                retired.len(),
                names
            );
        }
    }
}

/// Plugin created from a native module; keeps the library open.
///
/// Field order matters: the plugin is dropped before the library.
struct NativeInstance {
    plugin: Box<dyn Plugin>,
    _library: Arc<Library>,
}

impl Plugin for NativeInstance {
    fn id(&self) -> &str {
        self.plugin.id()
    }

    fn name(&self) -> &str {
        self.plugin.name()
    }

    fn version(&self) -> &str {
        self.plugin.version()
    }

    fn description(&self) -> &str {
        self.plugin.description()
    }

    fn capabilities(&self) -> Vec<String> {
        self.plugin.capabilities()
    }

    fn initialize(&mut self) -> std::result::Result<(), PluginFault> {
        self.plugin.initialize()
    }

    fn start(&mut self) -> std::result::Result<(), PluginFault> {
        self.plugin.start()
    }

    fn stop(&mut self) -> std::result::Result<(), PluginFault> {
        self.plugin.stop()
    }
}

/// Check a module's declaration and collect the types its `register` announces
fn declared_types(declaration: &PluginDeclaration, origin: &Path) -> Result<Vec<RegisteredType>> {
    check_plugin_api_compatibility(declaration.api_version, declaration.host_version).map_err(
        |reason| Error::BoundaryLoadFailure(format!("{}: {}", origin.display(), reason)),
    )?;

    let mut collector = TypeCollector::new();
    let register = declaration.register;
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| register(&mut collector))).map_err(
        |panic| {
            Error::BoundaryLoadFailure(format!(
                "{}: registration panicked: {}",
                origin.display(),
                panic_message(&*panic)
            ))
        },
    )?;
    Ok(collector.into_types())
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{PluginRegistrar, HOST_CRATE_VERSION, PLUGIN_API_VERSION};

    struct Echo {
        started: bool,
    }

    impl Plugin for Echo {
        fn id(&self) -> &str {
            "echo"
        }
        fn name(&self) -> &str {
            "Echo"
        }
        fn version(&self) -> &str {
            "0.1.0"
        }
        fn initialize(&mut self) -> std::result::Result<(), PluginFault> {
            Ok(())
        }
        fn start(&mut self) -> std::result::Result<(), PluginFault> {
            self.started = true;
            Ok(())
        }
        fn stop(&mut self) -> std::result::Result<(), PluginFault> {
            if self.started {
                Ok(())
            } else {
                Err(PluginFault::new("not running"))
            }
        }
    }

    fn register_echo(r: &mut dyn PluginRegistrar) {
        r.register_plugin("native::Echo", |_| Ok(Box::new(Echo { started: false })));
        r.register(
            TypeDescriptor::new("native::Helper", crate::plugins::TypeKind::Abstract, false),
            None,
        );
    }

    fn register_panics(_: &mut dyn PluginRegistrar) {
        panic!("static initializer failed");
    }

    fn declaration(
        api_version: &'static str,
        register: fn(&mut dyn PluginRegistrar),
    ) -> PluginDeclaration {
        PluginDeclaration {
            api_version,
            host_version: HOST_CRATE_VERSION,
            register,
        }
    }

    #[test]
    fn test_declaration_registers_types() {
        let types = declared_types(
            &declaration(PLUGIN_API_VERSION, register_echo),
            Path::new("echo.so"),
        )
        .unwrap();
        assert_eq!(types.len(), 2);
        assert_eq!(types[0].descriptor.type_name, "native::Echo");
        assert!(types[0].descriptor.is_activatable());
        assert!(!types[1].descriptor.is_activatable());
        assert!(types[1].factory.is_none());

        let factory = types[0].factory.clone().unwrap();
        let plugin = run_factory(&factory, &PluginArgs::Null).unwrap();
        assert_eq!(plugin.id(), "echo");
    }

    #[test]
    fn test_declaration_with_other_api_is_refused() {
        let result = declared_types(&declaration("1.0", register_echo), Path::new("old.so"));
        match result {
            Err(Error::BoundaryLoadFailure(reason)) => {
                assert!(reason.contains("old.so"));
                assert!(reason.contains("1.0"));
            }
            other => panic!("expected BoundaryLoadFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_panicking_registration_fails_load() {
        let result = declared_types(
            &declaration(PLUGIN_API_VERSION, register_panics),
            Path::new("bad.so"),
        );
        match result {
            Err(Error::BoundaryLoadFailure(reason)) => {
                assert!(reason.contains("static initializer failed"))
            }
            other => panic!("expected BoundaryLoadFailure, got {:?}", other),
        }
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_native_instance_forwards_hooks_and_holds_library() {
        let library = Arc::new(unsafe { Library::new("libc.so.6") }.unwrap());
        let weak = Arc::downgrade(&library);

        let mut instance = NativeInstance {
            plugin: Box::new(Echo { started: false }),
            _library: library,
        };
        assert_eq!(instance.id(), "echo");
        assert_eq!(instance.name(), "Echo");
        assert!(instance.stop().is_err());
        instance.start().unwrap();
        instance.stop().unwrap();

        assert_eq!(weak.strong_count(), 1);
        drop(instance);
        assert_eq!(weak.strong_count(), 0);
    }

    #[test]
    fn test_module_file_detection() {
        let ext = std::env::consts::DLL_EXTENSION;
        assert!(NativeBoundary::is_module_file(Path::new(&format!(
            "plugins.{}",
            ext
        ))));
        assert!(!NativeBoundary::is_module_file(Path::new("plugins.txt")));
        assert!(!NativeBoundary::is_module_file(Path::new("plugins")));
    }

    #[tokio::test]
    async fn test_folder_without_modules_loads_empty_context() {
        let boundary = NativeBoundary::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.md"), "docs").unwrap();

        let loaded = boundary.load_modules(dir.path(), "ctx-empty").await.unwrap();
        assert!(loaded.modules.is_empty());
        assert_eq!(boundary.active_contexts().await.len(), 1);
        assert!(boundary.unload_context("ctx-empty").await.unwrap());
        assert_eq!(boundary.retired_library_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_library_fails_load() {
        let boundary = NativeBoundary::new();
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir
            .path()
            .join(format!("broken.{}", std::env::consts::DLL_EXTENSION));
        std::fs::write(&bogus, b"not a shared library").unwrap();

        let result = boundary.load_modules(dir.path(), "ctx-broken").await;
        assert!(matches!(result, Err(Error::BoundaryLoadFailure(_))));
        assert!(boundary.active_contexts().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_folder_fails_load() {
        let boundary = NativeBoundary::new();
        let result = boundary
            .load_modules(Path::new("/nonexistent/nugget-rs/modules"), "ctx")
            .await;
        assert!(matches!(result, Err(Error::BoundaryLoadFailure(_))));
    }
}
