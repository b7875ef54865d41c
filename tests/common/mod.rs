//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use nugget_rs::config::{CleanupConfig, ManagerConfig};
use nugget_rs::isolation::{
    BoundaryEvent, ContextInfo, InProcessBoundary, IsolationBoundary, LoadedModules, ModuleHandle,
};
use nugget_rs::packages::{PackageMetadata, PackageSource};
use nugget_rs::plugins::{
    Plugin, PluginArgs, PluginFactory, PluginFault, PluginRegistrar, TypeDescriptor,
};
use nugget_rs::{Error, LifecycleEvent, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use zip::write::SimpleFileOptions;

/// Plugin used by the fixture modules
pub struct FixturePlugin {
    id: &'static str,
    capabilities: &'static [&'static str],
}

impl FixturePlugin {
    pub fn boxed(id: &'static str, capabilities: &'static [&'static str]) -> Box<dyn Plugin> {
        Box::new(Self { id, capabilities })
    }
}

impl Plugin for FixturePlugin {
    fn id(&self) -> &str {
        self.id
    }
    fn name(&self) -> &str {
        self.id
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn description(&self) -> &str {
        "fixture plugin"
    }
    fn capabilities(&self) -> Vec<String> {
        self.capabilities.iter().map(|c| c.to_string()).collect()
    }
    fn initialize(&mut self) -> std::result::Result<(), PluginFault> {
        Ok(())
    }
    fn start(&mut self) -> std::result::Result<(), PluginFault> {
        Ok(())
    }
    fn stop(&mut self) -> std::result::Result<(), PluginFault> {
        Ok(())
    }
}

/// One working plugin, one failing constructor and a non-plugin helper type
pub fn register_connectors(r: &mut dyn PluginRegistrar) {
    r.register_plugin("connectors::Postgres", |_| {
        Ok(FixturePlugin::boxed("postgres", &["database"]))
    });
    r.register_plugin("connectors::Broken", |_| {
        Err(PluginFault::new("missing connection string"))
    });
    r.register(TypeDescriptor::new(
        "connectors::Pool",
        nugget_rs::plugins::TypeKind::Concrete,
        false,
    ), None);
}

pub fn register_tools(r: &mut dyn PluginRegistrar) {
    r.register_plugin("tools::Linter", |_| Ok(FixturePlugin::boxed("linter", &["lint"])));
}

/// Hook calls observed by a `TrackedPlugin`
#[derive(Debug, Default)]
pub struct HookCounts {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// Fail every start after the first one
    pub refuse_restart: AtomicBool,
}

impl HookCounts {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

pub struct TrackedPlugin {
    id: &'static str,
    counts: Arc<HookCounts>,
}

impl Plugin for TrackedPlugin {
    fn id(&self) -> &str {
        self.id
    }
    fn name(&self) -> &str {
        self.id
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn initialize(&mut self) -> std::result::Result<(), PluginFault> {
        Ok(())
    }
    fn start(&mut self) -> std::result::Result<(), PluginFault> {
        let previous = self.counts.starts.fetch_add(1, Ordering::SeqCst);
        if previous > 0 && self.counts.refuse_restart.load(Ordering::SeqCst) {
            return Err(PluginFault::new("cannot start twice"));
        }
        Ok(())
    }
    fn stop(&mut self) -> std::result::Result<(), PluginFault> {
        self.counts.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Boundary with a `tracked` module exposing one `TrackedPlugin` per entry
pub fn tracked_boundary(plugins: Vec<(&'static str, Arc<HookCounts>)>) -> InProcessBoundary {
    InProcessBoundary::new().with_module("tracked", move |r| {
        for (id, counts) in plugins {
            let factory: PluginFactory = Arc::new(move |_: &PluginArgs| {
                Ok::<Box<dyn Plugin>, PluginFault>(Box::new(TrackedPlugin {
                    id,
                    counts: Arc::clone(&counts),
                }))
            });
            r.register(TypeDescriptor::plugin(format!("tracked::{}", id)), Some(factory));
        }
    })
}

pub fn in_process_boundary() -> InProcessBoundary {
    InProcessBoundary::new()
        .with_module("connectors", register_connectors)
        .with_module("tools", register_tools)
}

/// Write a package archive containing `package.toml` and `files`
pub fn write_package(dir: &Path, id: &str, version: &str, author: &str, files: &[&str]) -> PathBuf {
    let path = dir.join(format!("{}.{}.nupkg", id, version));
    let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
    writer
        .start_file("package.toml", SimpleFileOptions::default())
        .unwrap();
    write!(
        writer,
        "[package]\nid = \"{}\"\nversion = \"{}\"\nauthors = [\"{}\"]\ndescription = \"Fixture package {}\"\n",
        id, version, author, id
    )
    .unwrap();
    for file in files {
        writer.start_file(*file, SimpleFileOptions::default()).unwrap();
        writer.write_all(b"module").unwrap();
    }
    writer.finish().unwrap();
    path
}

/// Package with an ABI 1.0 and an ABI 2.0 build of the connectors module
pub fn connectors_package(dir: &Path, id: &str) -> PathBuf {
    write_package(
        dir,
        id,
        "1.0.0",
        "acme",
        &["lib/abi1.0/connectors.so", "lib/abi2.0/connectors.so", "content/readme.txt"],
    )
}

pub fn test_config(scratch_root: &Path) -> ManagerConfig {
    ManagerConfig {
        runtime_framework: "abi2.0".to_string(),
        scratch_root: scratch_root.to_path_buf(),
        cleanup: CleanupConfig {
            max_attempts: 5,
            pause_ms: 1,
            lock_backoff_ms: 1,
        },
        ..ManagerConfig::default()
    }
}

/// Drain every event already published
pub fn drain(events: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Boundary whose unload can be made to fail
pub struct FlakyBoundary {
    inner: InProcessBoundary,
    pub fail_unload: AtomicBool,
}

impl FlakyBoundary {
    pub fn new(inner: InProcessBoundary) -> Self {
        Self {
            inner,
            fail_unload: AtomicBool::new(false),
        }
    }

    pub fn set_fail_unload(&self, fail: bool) {
        self.fail_unload.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl IsolationBoundary for FlakyBoundary {
    async fn load_modules(&self, folder: &Path, context_id: &str) -> Result<LoadedModules> {
        self.inner.load_modules(folder, context_id).await
    }

    async fn unload_context(&self, context_id: &str) -> Result<bool> {
        if self.fail_unload.load(Ordering::SeqCst) {
            return Err(Error::BoundaryUnloadFailure(format!(
                "context '{}' is busy",
                context_id
            )));
        }
        self.inner.unload_context(context_id).await
    }

    async fn enumerate_types(
        &self,
        context_id: &str,
        module: &ModuleHandle,
    ) -> Result<Vec<TypeDescriptor>> {
        self.inner.enumerate_types(context_id, module).await
    }

    async fn create_instance(
        &self,
        context_id: &str,
        type_name: &str,
        args: &PluginArgs,
    ) -> Result<Box<dyn Plugin>> {
        self.inner.create_instance(context_id, type_name, args).await
    }

    async fn active_contexts(&self) -> Vec<ContextInfo> {
        self.inner.active_contexts().await
    }

    fn subscribe(&self) -> broadcast::Receiver<BoundaryEvent> {
        self.inner.subscribe()
    }
}

/// Source wrapper counting downloads
pub struct CountingSource<S> {
    inner: S,
    pub downloads: AtomicUsize,
}

impl<S> CountingSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: PackageSource> PackageSource for CountingSource<S> {
    async fn search(&self, term: &str, limit: usize) -> Result<Vec<PackageMetadata>> {
        self.inner.search(term, limit).await
    }

    async fn download(&self, id: &str, version: &str) -> Result<PathBuf> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.inner.download(id, version).await
    }

    async fn verify_authorship(&self, id: &str) -> Result<bool> {
        self.inner.verify_authorship(id).await
    }
}

/// Source that offers nothing
pub struct EmptySource;

#[async_trait]
impl PackageSource for EmptySource {
    async fn search(&self, _term: &str, _limit: usize) -> Result<Vec<PackageMetadata>> {
        Ok(Vec::new())
    }

    async fn download(&self, id: &str, version: &str) -> Result<PathBuf> {
        Err(Error::PackageNotFound(format!("{} {}", id, version)))
    }

    async fn verify_authorship(&self, _id: &str) -> Result<bool> {
        Ok(true)
    }
}
