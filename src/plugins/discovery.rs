//! Plugin Discoverer
//!
//! Scans the modules of a loaded context for types that satisfy the plugin
//! contract and activates one instance of each through the isolation
//! boundary.
//!
//! # Examples
//!
//! ```rust
//! use nugget_rs::isolation::{InProcessBoundary, IsolationBoundary};
//! use nugget_rs::plugins::{PluginArgs, PluginDiscoverer};
//! use std::sync::Arc;
//!
//! # async fn run(folder: &std::path::Path) -> nugget_rs::Result<()> {
//! let boundary: Arc<dyn IsolationBoundary> = Arc::new(InProcessBoundary::new());
//! let loaded = boundary.load_modules(folder, "ctx-demo").await?;
//!
//! let discoverer = PluginDiscoverer::new(Arc::clone(&boundary));
//! let report = discoverer
//!     .discover(&loaded.modules, &loaded.context_id, &PluginArgs::Null)
//!     .await;
//! for (type_name, error) in &report.failures {
//!     eprintln!("{} was skipped: {}", type_name, error);
//! }
//! # Ok(())
//! # }
//! ```

use super::{ActivatedPlugin, Plugin, PluginArgs, PluginFault};
use crate::error::Error;
use crate::isolation::context::panic_message;
use crate::isolation::{IsolationBoundary, ModuleHandle};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of a discovery pass
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Plugins that were constructed, initialized and started
    pub plugins: Vec<ActivatedPlugin>,
    /// Types that were skipped, with the activation error
    pub failures: Vec<(String, Error)>,
}

impl DiscoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Activates plugins inside an isolation context
pub struct PluginDiscoverer {
    boundary: Arc<dyn IsolationBoundary>,
}

impl PluginDiscoverer {
    pub fn new(boundary: Arc<dyn IsolationBoundary>) -> Self {
        Self { boundary }
    }

    /// Discover and activate every plugin type of `modules`.
    ///
    /// A failing type never aborts the pass; it is logged and reported in
    /// [`DiscoveryReport::failures`].
    pub async fn discover(
        &self,
        modules: &[ModuleHandle],
        context_id: &str,
        args: &PluginArgs,
    ) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut seen_ids = HashSet::new();

        for module in modules {
            let types = match self.boundary.enumerate_types(context_id, module).await {
                Ok(types) => types,
                Err(e) => {
                    warn!("Cannot enumerate types of module {}: {}", module.name, e);
                    report
                        .failures
                        .push((module.name.clone(), Error::activation(&module.name, e)));
                    continue;
                }
            };

            let candidates: Vec<_> = types.into_iter().filter(|t| t.is_activatable()).collect();
            debug!(
                "Module {} offers {} plugin type(s)",
                module.name,
                candidates.len()
            );

            for descriptor in candidates {
                let type_name = descriptor.type_name;
                match self.activate(context_id, &type_name, args).await {
                    Ok(plugin) => {
                        if !seen_ids.insert(plugin.id.clone()) {
                            let error = Error::activation(
                                &type_name,
                                format!("duplicate plugin id '{}' in context", plugin.id),
                            );
                            warn!("Skipping plugin: {}", error);
                            stop_quietly(&plugin).await;
                            report.failures.push((type_name, error));
                            continue;
                        }
                        info!(
                            "Activated plugin {} v{} ({}) in {}",
                            plugin.id, plugin.version, type_name, context_id
                        );
                        report.plugins.push(plugin);
                    }
                    Err(error) => {
                        warn!("Skipping plugin: {}", error);
                        report.failures.push((type_name, error));
                    }
                }
            }
        }

        debug!(
            "Discovery in {} activated {} plugin(s), {} failure(s)",
            context_id,
            report.plugins.len(),
            report.failures.len()
        );
        report
    }

    async fn activate(
        &self,
        context_id: &str,
        type_name: &str,
        args: &PluginArgs,
    ) -> Result<ActivatedPlugin, Error> {
        let mut instance = self
            .boundary
            .create_instance(context_id, type_name, args)
            .await?;

        run_hook(&mut instance, "initialize", |p| p.initialize())
            .map_err(|reason| Error::activation(type_name, reason))?;
        run_hook(&mut instance, "start", |p| p.start())
            .map_err(|reason| Error::activation(type_name, reason))?;

        Ok(ActivatedPlugin {
            id: instance.id().to_string(),
            name: instance.name().to_string(),
            version: instance.version().to_string(),
            description: instance.description().to_string(),
            context_id: context_id.to_string(),
            type_name: type_name.to_string(),
            capabilities: instance.capabilities(),
            instance: Arc::new(Mutex::new(instance)),
        })
    }
}

/// Run a lifecycle hook, turning a fault or a panic into a message
pub(crate) fn run_hook<F>(
    plugin: &mut Box<dyn Plugin>,
    hook: &str,
    call: F,
) -> Result<(), String>
where
    F: FnOnce(&mut dyn Plugin) -> Result<(), PluginFault>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| call(plugin.as_mut()))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(fault)) => Err(format!("{} failed: {}", hook, fault)),
        Err(panic) => Err(format!("{} panicked: {}", hook, panic_message(&*panic))),
    }
}

async fn stop_quietly(plugin: &ActivatedPlugin) {
    let mut instance = plugin.instance.lock().await;
    if let Err(reason) = run_hook(&mut instance, "stop", |p| p.stop()) {
        warn!("Plugin {}: {}", plugin.id, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::InProcessBoundary;
    use crate::plugins::{PluginRegistrar, TypeDescriptor, TypeKind};

    #[derive(Default)]
    struct Probe {
        id: &'static str,
        fail_init: bool,
        fail_start: bool,
        panic_init: bool,
    }

    impl Plugin for Probe {
        fn id(&self) -> &str {
            self.id
        }
        fn name(&self) -> &str {
            "Probe"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn capabilities(&self) -> Vec<String> {
            vec!["sample".to_string()]
        }
        fn initialize(&mut self) -> Result<(), PluginFault> {
            if self.panic_init {
                panic!("init blew up");
            }
            if self.fail_init {
                return Err(PluginFault::new("no database"));
            }
            Ok(())
        }
        fn start(&mut self) -> Result<(), PluginFault> {
            if self.fail_start {
                return Err(PluginFault::new("port in use"));
            }
            Ok(())
        }
        fn stop(&mut self) -> Result<(), PluginFault> {
            Ok(())
        }
    }

    fn register(r: &mut dyn PluginRegistrar) {
        r.register_plugin("sample::Good", |_| {
            Ok(Box::new(Probe {
                id: "good",
                ..Default::default()
            }))
        });
        r.register_plugin("sample::BadInit", |_| {
            Ok(Box::new(Probe {
                id: "bad-init",
                fail_init: true,
                ..Default::default()
            }))
        });
        r.register_plugin("sample::BadStart", |_| {
            Ok(Box::new(Probe {
                id: "bad-start",
                fail_start: true,
                ..Default::default()
            }))
        });
        r.register_plugin("sample::Panics", |_| {
            Ok(Box::new(Probe {
                id: "panics",
                panic_init: true,
                ..Default::default()
            }))
        });
        r.register_plugin("sample::NoCtor", |_| Err(PluginFault::new("missing argument")));
        r.register_plugin("sample::Duplicate", |_| {
            Ok(Box::new(Probe {
                id: "good",
                ..Default::default()
            }))
        });
        r.register(
            TypeDescriptor::new("sample::Contract", TypeKind::Interface, true),
            None,
        );
        r.register(
            TypeDescriptor::new("sample::Helper", TypeKind::Concrete, false),
            None,
        );
    }

    async fn loaded() -> (tempfile::TempDir, Arc<dyn IsolationBoundary>, Vec<ModuleHandle>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("samples.so"), b"").unwrap();
        let boundary: Arc<dyn IsolationBoundary> =
            Arc::new(InProcessBoundary::new().with_module("samples", register));
        let modules = boundary
            .load_modules(dir.path(), "ctx-sample")
            .await
            .unwrap()
            .modules;
        (dir, boundary, modules)
    }

    #[tokio::test]
    async fn test_failing_types_are_skipped() {
        let (_dir, boundary, modules) = loaded().await;
        let discoverer = PluginDiscoverer::new(boundary);

        let report = discoverer
            .discover(&modules, "ctx-sample", &PluginArgs::Null)
            .await;

        assert_eq!(report.plugins.len(), 1);
        let plugin = &report.plugins[0];
        assert_eq!(plugin.id, "good");
        assert_eq!(plugin.context_id, "ctx-sample");
        assert_eq!(plugin.registry_key(), "ctx-sample::good");
        assert!(plugin.has_capability("sample"));

        let mut failed: Vec<&str> = report.failures.iter().map(|(t, _)| t.as_str()).collect();
        failed.sort();
        assert_eq!(
            failed,
            vec![
                "sample::BadInit",
                "sample::BadStart",
                "sample::Duplicate",
                "sample::NoCtor",
                "sample::Panics"
            ]
        );
        assert!(report
            .failures
            .iter()
            .all(|(_, e)| matches!(e, Error::PluginActivationError { .. })));
    }

    #[tokio::test]
    async fn test_unknown_context_reports_module_failure() {
        let (_dir, boundary, modules) = loaded().await;
        let discoverer = PluginDiscoverer::new(boundary);

        let report = discoverer
            .discover(&modules, "ctx-other", &PluginArgs::Null)
            .await;
        assert!(report.plugins.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "samples");
    }

    #[test]
    fn test_run_hook_catches_panic() {
        let mut plugin: Box<dyn Plugin> = Box::new(Probe {
            id: "panics",
            panic_init: true,
            ..Default::default()
        });
        let result = run_hook(&mut plugin, "initialize", |p| p.initialize());
        assert!(result.unwrap_err().contains("init blew up"));
    }
}
