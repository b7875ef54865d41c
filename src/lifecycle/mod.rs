//! パッケージライフサイクル管理
//!
//! パッケージの取得、展開、フレームワーク選択、隔離ロード、プラグインの
//! 有効化、アンロードを管理し、対応表とプラグインレジストリを一貫した状態に保つ。

pub mod cleanup;
pub mod events;
pub mod registry;

pub use cleanup::{CleanupOutcome, CleanupReport, CleanupScheduler, FsRemover, ScratchRemover};
pub use events::LifecycleEvent;
pub use registry::{ContextMapping, LoadedModule, LoadedModuleSnapshot};

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::framework;
use crate::isolation::{BoundaryEvent, IsolationBoundary};
use crate::packages::{self, PackageRecord, PackageSource};
use crate::plugins::discovery::run_hook;
use crate::plugins::{ActivatedPlugin, PluginDiscoverer};
use chrono::Utc;
use registry::Registry;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// ライフサイクルマネージャー
///
/// 全ての操作は `&self` で呼び出せる。レジストリのロックは展開、境界呼び出し、
/// プラグインのフック実行の間は保持しない。
///
/// 生成時に境界イベントの監視タスクを起動するため、tokio ランタイム内で
/// 生成する必要がある。
pub struct LifecycleManager {
    /// 設定
    config: ManagerConfig,
    /// 隔離境界
    boundary: Arc<dyn IsolationBoundary>,
    /// パッケージソース
    source: Arc<dyn PackageSource>,
    /// プラグイン探索
    discoverer: PluginDiscoverer,
    /// スクラッチディレクトリ削除
    cleanup: CleanupScheduler,
    /// 対応表・モジュール・プラグイン・パッケージ記録
    registry: Arc<Mutex<Registry>>,
    /// ライフサイクルイベント配信
    events: broadcast::Sender<LifecycleEvent>,
    /// 境界イベント監視タスク
    watcher: JoinHandle<()>,
}

impl LifecycleManager {
    /// 新しいマネージャーを作成
    pub fn new(
        config: ManagerConfig,
        boundary: Arc<dyn IsolationBoundary>,
        source: Arc<dyn PackageSource>,
    ) -> Self {
        let capacity = config.event_capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (cleanup_reports, _) = broadcast::channel(capacity);
        let registry = Arc::new(Mutex::new(Registry::default()));

        let cleanup = CleanupScheduler::new(
            config.cleanup.clone(),
            Arc::clone(&boundary),
            cleanup_reports,
        );
        let watcher = spawn_boundary_watcher(boundary.subscribe(), Arc::clone(&registry));

        info!(
            "Lifecycle manager ready (runtime framework: {}, scratch root: {:?})",
            config.runtime_framework, config.scratch_root
        );

        Self {
            discoverer: PluginDiscoverer::new(Arc::clone(&boundary)),
            config,
            boundary,
            source,
            cleanup,
            registry,
            events,
            watcher,
        }
    }

    /// スクラッチディレクトリの削除処理を差し替える
    pub fn with_scratch_remover(mut self, remover: Arc<dyn ScratchRemover>) -> Self {
        self.cleanup = self.cleanup.clone().with_remover(remover);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// ライフサイクルイベントを購読
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// クリーンアップ結果を購読
    pub fn subscribe_cleanup(&self) -> broadcast::Receiver<CleanupReport> {
        self.cleanup.subscribe()
    }

    /// 作成者確認とダウンロードを行ってからロード
    ///
    /// 取得前にIDを予約するため、同じIDの並行インストールは
    /// ダウンロードの前に `AlreadyLoaded` で拒否される。
    pub async fn install_and_load(&self, package_id: &str, version: &str) -> Result<LoadedModule> {
        packages::validate_package_id(package_id)?;
        self.registry.lock().await.reserve_load(package_id)?;

        let archive = match self.acquire(package_id, version).await {
            Ok(archive) => archive,
            Err(e) => {
                self.registry.lock().await.release(package_id);
                error!("Failed to acquire {} {}: {}", package_id, version, e);
                self.emit_error(package_id, &e);
                return Err(e);
            }
        };

        self.registry
            .lock()
            .await
            .ensure_package(package_id, version);
        self.load_with_reservation(&archive, package_id).await
    }

    /// ソースが提供しなくなったパッケージは記録を stale にする
    async fn acquire(&self, package_id: &str, version: &str) -> Result<PathBuf> {
        let result = self.verify_and_download(package_id, version).await;
        if let Err(Error::PackageNotFound(_)) = &result {
            self.registry.lock().await.mark_stale(package_id);
        }
        result
    }

    async fn verify_and_download(&self, package_id: &str, version: &str) -> Result<PathBuf> {
        if !self.source.verify_authorship(package_id).await? {
            return Err(Error::UnauthorizedSource(package_id.to_string()));
        }
        self.source.download(package_id, version).await
    }

    /// アーカイブからパッケージをロード
    ///
    /// 途中で失敗した場合は予約を解除し、`Error` イベントを配信してから
    /// エラーを返す。対応表には何も残らない。
    pub async fn load(&self, archive_path: &Path, package_id: &str) -> Result<LoadedModule> {
        packages::validate_package_id(package_id)?;
        self.registry.lock().await.reserve_load(package_id)?;
        self.load_with_reservation(archive_path, package_id).await
    }

    /// 予約済みのIDでロードし、失敗時は予約を解除する
    async fn load_with_reservation(
        &self,
        archive_path: &Path,
        package_id: &str,
    ) -> Result<LoadedModule> {
        info!("Loading package {} from {:?}", package_id, archive_path);

        let scratch = self
            .config
            .scratch_root
            .join(format!("{}-{}", package_id, Uuid::new_v4().simple()));

        let result = self.activate(archive_path, package_id, &scratch).await;
        // 展開済みのファイルは成否に関わらずバックグラウンドで削除する
        if scratch.exists() {
            let _ = self.cleanup.schedule(package_id, scratch);
        }

        match result {
            Ok(module) => {
                info!(
                    "Loaded package {} into {} ({} module(s), framework {})",
                    package_id,
                    module.context_id,
                    module.modules.len(),
                    module.framework
                );
                self.emit(LifecycleEvent::Loaded(module.clone()));
                Ok(module)
            }
            Err(e) => {
                self.registry.lock().await.release(package_id);
                error!("Failed to load package {}: {}", package_id, e);
                self.emit_error(package_id, &e);
                Err(e)
            }
        }
    }

    async fn activate(
        &self,
        archive_path: &Path,
        package_id: &str,
        scratch: &Path,
    ) -> Result<LoadedModule> {
        let summary = packages::extract(archive_path, scratch).await?;
        debug!(
            "Extracted {} file(s) of {} into {:?}",
            summary.files, package_id, scratch
        );

        let binaries_root = scratch.join(&self.config.binaries_root);
        if !binaries_root.is_dir() {
            return Err(Error::MissingBinariesRoot {
                root: self.config.binaries_root.clone(),
                scratch: scratch.to_path_buf(),
            });
        }

        let candidates = framework::list_framework_folders(&binaries_root)?;
        let choice = framework::resolve(
            &self.config.runtime_framework,
            &candidates,
            self.config.strict_framework,
        )?
        .ok_or_else(|| Error::NoCompatibleFramework {
            runtime: self.config.runtime_framework.clone(),
            candidates: candidates.clone(),
        })?;

        let context_id = format!("ctx-{}-{}", package_id, Uuid::new_v4().simple());
        let folder = binaries_root.join(&choice.folder);
        let loaded = self
            .boundary
            .load_modules(&folder, &context_id)
            .await
            .map_err(|e| match e {
                Error::BoundaryLoadFailure(_) => e,
                other => Error::BoundaryLoadFailure(other.to_string()),
            })?;

        let report = self
            .discoverer
            .discover(&loaded.modules, &context_id, &self.config.plugin_args)
            .await;
        for (type_name, cause) in &report.failures {
            self.emit(LifecycleEvent::PluginActivationFailed {
                package_id: package_id.to_string(),
                type_name: type_name.clone(),
                cause: cause.to_string(),
            });
        }

        let module = LoadedModule {
            package_id: package_id.to_string(),
            archive_path: archive_path.to_path_buf(),
            modules: loaded.modules,
            loaded_at: Utc::now(),
            active: true,
            context_id,
            framework: choice.folder,
        };
        self.registry
            .lock()
            .await
            .commit_load(module.clone(), report.plugins);
        Ok(module)
    }

    /// パッケージをアンロード
    ///
    /// 未ロードの場合は副作用なしで `NotLoaded` を返す。境界側のアンロードに
    /// 失敗した場合は対応表を残したまま `BoundaryUnloadFailure` を返す。
    /// この時、停止したプラグインは再開され、再開できなかったものは
    /// レジストリから外される。
    pub async fn unload(&self, package_id: &str) -> Result<()> {
        let (mapping, plugins) = self.registry.lock().await.reserve_unload(package_id)?;
        info!("Unloading package {} ({})", package_id, mapping.context_id);

        let mut stopped = Vec::with_capacity(plugins.len());
        for plugin in &plugins {
            if stop_plugin(plugin).await {
                stopped.push(plugin);
            }
        }

        let result = match self.boundary.unload_context(&mapping.context_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::BoundaryUnloadFailure(format!(
                "context '{}' is unknown to the boundary",
                mapping.context_id
            ))),
            Err(Error::BoundaryUnloadFailure(reason)) => {
                Err(Error::BoundaryUnloadFailure(reason))
            }
            Err(e) => Err(Error::BoundaryUnloadFailure(e.to_string())),
        };

        match result {
            Ok(()) => {
                self.registry.lock().await.commit_unload(package_id);
                info!("Unloaded package {}", package_id);
                self.emit(LifecycleEvent::Unloaded {
                    package_id: package_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                let mut dropped = Vec::new();
                for plugin in stopped {
                    if !restart_plugin(plugin).await {
                        dropped.push(plugin.registry_key());
                    }
                }
                {
                    let mut registry = self.registry.lock().await;
                    for key in &dropped {
                        registry.remove_plugin(key);
                    }
                    registry.release(package_id);
                }
                error!("Failed to unload package {}: {}", package_id, e);
                self.emit_error(package_id, &e);
                Err(e)
            }
        }
    }

    /// 境界側の状態と突き合わせたロード済みモジュール一覧
    pub async fn loaded_modules(&self) -> Vec<LoadedModuleSnapshot> {
        let active: HashSet<String> = self
            .boundary
            .active_contexts()
            .await
            .into_iter()
            .map(|c| c.context_id)
            .collect();

        let registry = self.registry.lock().await;
        for context_id in &active {
            if !registry.maps_context(context_id) {
                debug!("Boundary context {} has no package mapping; skipped", context_id);
            }
        }

        let mut snapshots: Vec<LoadedModuleSnapshot> = registry
            .modules()
            .map(|module| {
                let mut module = module.clone();
                module.active = active.contains(&module.context_id);
                LoadedModuleSnapshot {
                    plugins: registry.plugins_of(&module.context_id),
                    module,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.module.package_id.cmp(&b.module.package_id));
        snapshots
    }

    /// ロード済みモジュールの記録
    pub async fn loaded_module(&self, package_id: &str) -> Option<LoadedModule> {
        self.registry.lock().await.module(package_id).cloned()
    }

    /// 有効化済みプラグイン一覧
    pub async fn plugins(&self) -> Vec<ActivatedPlugin> {
        self.registry.lock().await.plugins().cloned().collect()
    }

    /// プラグインIDで検索
    pub async fn plugin(&self, plugin_id: &str) -> Option<ActivatedPlugin> {
        self.registry
            .lock()
            .await
            .plugins()
            .find(|p| p.id == plugin_id)
            .cloned()
    }

    /// 指定の機能を提供するプラグイン
    pub async fn plugins_with_capability(&self, capability: &str) -> Vec<ActivatedPlugin> {
        self.registry
            .lock()
            .await
            .plugins()
            .filter(|p| p.has_capability(capability))
            .cloned()
            .collect()
    }

    /// パッケージソースを検索し、記録を更新
    pub async fn search_packages(&self, term: &str, limit: usize) -> Result<Vec<PackageRecord>> {
        let found = self.source.search(term, limit).await?;
        let mut registry = self.registry.lock().await;
        let records = found.iter().map(|m| registry.upsert_package(m)).collect();
        Ok(records)
    }

    /// パッケージ記録の一覧
    pub async fn packages(&self) -> Vec<PackageRecord> {
        self.registry.lock().await.packages()
    }

    pub async fn is_loaded(&self, package_id: &str) -> bool {
        self.registry.lock().await.is_mapped(package_id)
    }

    /// 対応するコンテキストID
    pub async fn context_of(&self, package_id: &str) -> Option<String> {
        self.registry
            .lock()
            .await
            .mapping(package_id)
            .map(|m| m.context_id.clone())
    }

    /// 全パッケージをアンロードし、失敗数を返す
    pub async fn shutdown(&self) -> usize {
        let ids = self.registry.lock().await.mapped_ids();
        info!("Shutting down lifecycle manager ({} package(s))", ids.len());

        let mut failures = 0;
        for id in ids {
            if let Err(e) = self.unload(&id).await {
                warn!("Package {} could not be unloaded during shutdown: {}", id, e);
                failures += 1;
            }
        }
        failures
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, package_id: &str, cause: &Error) {
        self.emit(LifecycleEvent::Error {
            package_id: package_id.to_string(),
            cause: cause.to_string(),
        });
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        self.watcher.abort();
        if let Ok(registry) = self.registry.try_lock() {
            let remaining = registry.mapped_ids();
            if !remaining.is_empty() {
                warn!(
                    "Lifecycle manager dropped with {} package(s) still loaded: {:?}",
                    remaining.len(),
                    remaining
                );
            }
        }
    }
}

async fn stop_plugin(plugin: &ActivatedPlugin) -> bool {
    let mut instance = plugin.instance.lock().await;
    match run_hook(&mut instance, "stop", |p| p.stop()) {
        Ok(()) => {
            debug!("Stopped plugin {}", plugin.id);
            true
        }
        Err(reason) => {
            warn!("Plugin {} did not stop cleanly: {}", plugin.id, reason);
            false
        }
    }
}

async fn restart_plugin(plugin: &ActivatedPlugin) -> bool {
    let mut instance = plugin.instance.lock().await;
    match run_hook(&mut instance, "start", |p| p.start()) {
        Ok(()) => {
            debug!("Restarted plugin {} after failed unload", plugin.id);
            true
        }
        Err(reason) => {
            warn!("Plugin {} could not be restarted and is dropped: {}", plugin.id, reason);
            false
        }
    }
}

fn spawn_boundary_watcher(
    mut events: broadcast::Receiver<BoundaryEvent>,
    registry: Arc<Mutex<Registry>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BoundaryEvent::ContextLoaded {
                    context_id,
                    module_count,
                }) => debug!(
                    "Boundary loaded context {} ({} module(s))",
                    context_id, module_count
                ),
                Ok(BoundaryEvent::ContextUnloaded { context_id }) => {
                    if registry.lock().await.maps_settled_context(&context_id) {
                        warn!(
                            "Boundary unloaded context {} that is still mapped to a package",
                            context_id
                        );
                    } else {
                        debug!("Boundary unloaded context {}", context_id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} boundary event(s)", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
