//! スクラッチディレクトリのクリーンアップ
//!
//! ロード完了後、展開先のスクラッチディレクトリをバックグラウンドで削除する。
//! ロックされたファイルは回数制限付きで再試行し、結果は呼び出し元には返さず
//! ログと [`CleanupReport`] の配信でのみ通知する。

use crate::config::CleanupConfig;
use crate::isolation::IsolationBoundary;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// スクラッチディレクトリの削除処理
pub trait ScratchRemover: Send + Sync {
    /// ディレクトリを再帰的に削除
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// ファイルシステム上で削除するデフォルト実装
#[derive(Debug, Default, Clone, Copy)]
pub struct FsRemover;

impl ScratchRemover for FsRemover {
    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }
}

/// クリーンアップの最終結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupOutcome {
    /// 削除済み（既に存在しない場合を含む）
    Deleted { attempts: u32 },
    /// 再試行上限に達し、ディレクトリが残った
    Orphaned { attempts: u32 },
    /// ロック以外の失敗により中断
    Abandoned { attempts: u32, reason: String },
}

impl CleanupOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, CleanupOutcome::Deleted { .. })
    }
}

/// 購読者に配信されるクリーンアップ結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// 対象パッケージID
    pub package_id: String,
    /// 対象ディレクトリ
    pub path: PathBuf,
    /// 結果
    pub outcome: CleanupOutcome,
}

/// ロック起因の失敗かどうか
///
/// EBUSY(16) / ETXTBSY(26) と Windows の共有違反(32) / ロック違反(33) を対象とする。
pub fn is_lock_error(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::PermissionDenied {
        return true;
    }
    match error.raw_os_error() {
        #[cfg(windows)]
        Some(32) | Some(33) => true,
        #[cfg(unix)]
        Some(16) | Some(26) => true,
        _ => false,
    }
}

/// バックグラウンド削除のスケジューラ
#[derive(Clone)]
pub struct CleanupScheduler {
    config: CleanupConfig,
    boundary: Arc<dyn IsolationBoundary>,
    remover: Arc<dyn ScratchRemover>,
    reports: broadcast::Sender<CleanupReport>,
}

impl CleanupScheduler {
    pub fn new(
        config: CleanupConfig,
        boundary: Arc<dyn IsolationBoundary>,
        reports: broadcast::Sender<CleanupReport>,
    ) -> Self {
        Self {
            config,
            boundary,
            remover: Arc::new(FsRemover),
            reports,
        }
    }

    /// 削除処理を差し替える
    pub fn with_remover(mut self, remover: Arc<dyn ScratchRemover>) -> Self {
        self.remover = remover;
        self
    }

    /// 結果の購読
    pub fn subscribe(&self) -> broadcast::Receiver<CleanupReport> {
        self.reports.subscribe()
    }

    /// `path` の削除をスケジュール（待機不要）
    pub fn schedule(&self, package_id: &str, path: PathBuf) -> JoinHandle<CleanupOutcome> {
        let scheduler = self.clone();
        let package_id = package_id.to_string();
        tokio::spawn(async move {
            let outcome = scheduler.run(&path).await;
            match &outcome {
                CleanupOutcome::Deleted { attempts } => info!(
                    "Removed scratch directory {:?} after {} attempt(s)",
                    path, attempts
                ),
                CleanupOutcome::Orphaned { attempts } => warn!(
                    "Scratch directory {:?} still locked after {} attempt(s); left in place",
                    path, attempts
                ),
                CleanupOutcome::Abandoned { reason, .. } => {
                    warn!("Gave up removing scratch directory {:?}: {}", path, reason)
                }
            }
            let _ = scheduler.reports.send(CleanupReport {
                package_id,
                path,
                outcome: outcome.clone(),
            });
            outcome
        })
    }

    async fn run(&self, path: &Path) -> CleanupOutcome {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            sleep(Duration::from_millis(self.config.pause_ms)).await;
            self.boundary.release_hint();

            let remover = Arc::clone(&self.remover);
            let target = path.to_path_buf();
            let result = tokio::task::spawn_blocking(move || remover.remove(&target))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e.to_string())));

            match result {
                Ok(()) => return CleanupOutcome::Deleted { attempts: attempt },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Scratch directory {:?} already gone", path);
                    return CleanupOutcome::Deleted { attempts: attempt };
                }
                Err(e) if is_lock_error(&e) => {
                    debug!(
                        "Scratch directory {:?} locked (attempt {}/{}): {}",
                        path, attempt, max_attempts, e
                    );
                    if attempt < max_attempts {
                        sleep(Duration::from_millis(self.config.lock_backoff_ms)).await;
                    }
                }
                Err(e) => {
                    return CleanupOutcome::Abandoned {
                        attempts: attempt,
                        reason: e.to_string(),
                    }
                }
            }
        }

        CleanupOutcome::Orphaned {
            attempts: max_attempts,
        }
    }
}
