//! 隔離境界 (Isolation Boundary)
//!
//! パッケージのバイナリモジュールを独立したコンテキストにロードし、
//! 後からコンテキスト単位でアンロードするための境界を定義する。
//! プラグインの生成は必ず境界を経由し、コンテキスト内のモジュール解決で実行される。

pub(crate) mod context;
pub mod in_process;
pub mod native;

pub use in_process::InProcessBoundary;
pub use native::NativeBoundary;

use crate::error::Result;
use crate::plugins::{Plugin, PluginArgs, TypeDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// ロード済みバイナリモジュールのハンドル
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleHandle {
    /// モジュール名（ファイル名の stem）
    pub name: String,
    /// ロード元のパス
    pub path: PathBuf,
    /// 所属コンテキストID
    pub context_id: String,
}

/// `load_modules` の結果
#[derive(Debug, Clone)]
pub struct LoadedModules {
    /// コンテキストID
    pub context_id: String,
    /// ロードされたモジュール
    pub modules: Vec<ModuleHandle>,
}

/// 境界側が把握しているアクティブなコンテキスト
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInfo {
    /// コンテキストID
    pub context_id: String,
    /// コンテキスト内のモジュール
    pub modules: Vec<ModuleHandle>,
    /// ロード時刻
    pub loaded_at: DateTime<Utc>,
}

/// 境界から配信されるロード/アンロード通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryEvent {
    /// コンテキストがロードされた
    ContextLoaded {
        context_id: String,
        module_count: usize,
    },
    /// コンテキストがアンロードされた
    ContextUnloaded { context_id: String },
}

/// 隔離境界
///
/// 型の列挙と生成は明示的な登録情報に基づいて行い、境界を越えた動的な型探索は行わない。
#[async_trait]
pub trait IsolationBoundary: Send + Sync {
    /// フォルダ内のバイナリモジュールを新しいコンテキストにロード
    async fn load_modules(&self, folder: &Path, context_id: &str) -> Result<LoadedModules>;

    /// コンテキストをアンロード。未知のコンテキストの場合は `false`
    async fn unload_context(&self, context_id: &str) -> Result<bool>;

    /// モジュールが公開している型を列挙
    async fn enumerate_types(
        &self,
        context_id: &str,
        module: &ModuleHandle,
    ) -> Result<Vec<TypeDescriptor>>;

    /// コンテキスト内で型からインスタンスを生成
    async fn create_instance(
        &self,
        context_id: &str,
        type_name: &str,
        args: &PluginArgs,
    ) -> Result<Box<dyn Plugin>>;

    /// 境界が保持しているアクティブなコンテキスト一覧
    async fn active_contexts(&self) -> Vec<ContextInfo>;

    /// ロード/アンロード通知を購読
    fn subscribe(&self) -> broadcast::Receiver<BoundaryEvent>;

    /// 解放可能なリソースの解放を促すヒント（ベストエフォート）
    fn release_hint(&self) {}
}

/// 境界イベント通知用チャネルの容量
pub(crate) const BOUNDARY_EVENT_CAPACITY: usize = 64;
