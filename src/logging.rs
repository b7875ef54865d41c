use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ログファイル名
pub const LOG_FILE_NAME: &str = "nugget-rs.log";

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// ログレベル (trace, debug, info, warn, error) または EnvFilter 形式の指定
    pub level: String,
    /// ログディレクトリ
    pub log_dir: PathBuf,
    /// ファイルローテーション設定
    pub rotation: LogRotation,
    /// コンソール出力有効
    pub console_enabled: bool,
    /// ファイル出力有効
    pub file_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// 日次ローテーション
    Daily,
    /// 時間毎ローテーション
    Hourly,
    /// ローテーションなし
    Never,
}

impl LogRotation {
    /// 設定値からの変換。未知の値は日次扱い
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "hourly" => LogRotation::Hourly,
            "never" | "none" => LogRotation::Never,
            _ => LogRotation::Daily,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: default_log_dir(),
            rotation: LogRotation::Daily,
            console_enabled: true,
            file_enabled: false,
        }
    }
}

impl LogConfig {
    /// 設定ファイルのログ設定から作成
    pub fn from_logging_config(logging: &crate::config::LoggingConfig) -> Self {
        Self {
            level: logging.level.clone(),
            log_dir: logging.dir.clone().unwrap_or_else(default_log_dir),
            rotation: LogRotation::parse(&logging.rotation),
            console_enabled: logging.console,
            file_enabled: logging.file,
        }
    }

    /// カスタムログディレクトリを設定
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// ローテーション設定
    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// コンソール出力制御
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.console_enabled = enabled;
        self
    }

    /// ファイル出力制御
    pub fn with_file(mut self, enabled: bool) -> Self {
        self.file_enabled = enabled;
        self
    }
}

/// デフォルトログディレクトリ: カレントディレクトリの logs、
/// 作成できなければシステムテンプディレクトリ配下
fn default_log_dir() -> PathBuf {
    let current_log_dir = PathBuf::from("logs");
    if current_log_dir.is_dir() {
        return current_log_dir;
    }
    std::env::temp_dir().join("nugget-rs").join("logs")
}

/// ログディレクトリを確保
fn ensure_log_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }
    Ok(())
}

/// ログシステムを初期化
///
/// ファイル出力が有効な場合は `WorkerGuard` を返す。破棄するとバッファ済みの
/// ログがフラッシュされ、以降ファイルへは書き込まれない。
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = config
        .console_enabled
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(true));

    let (file_layer, guard) = if config.file_enabled {
        ensure_log_dir(&config.log_dir)?;
        let file_appender = match config.rotation {
            LogRotation::Daily => rolling::daily(&config.log_dir, LOG_FILE_NAME),
            LogRotation::Hourly => rolling::hourly(&config.log_dir, LOG_FILE_NAME),
            LogRotation::Never => rolling::never(&config.log_dir, LOG_FILE_NAME),
        };
        let (writer, guard) = non_blocking(file_appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(
        "Logging initialized (level: {}, console: {}, file: {}, dir: {})",
        config.level,
        config.console_enabled,
        config.file_enabled,
        config.log_dir.display()
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggingConfig;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_log_config_from_logging_config() {
        let logging = LoggingConfig {
            level: "nugget_rs=debug".to_string(),
            dir: Some(PathBuf::from("/var/log/nugget")),
            console: false,
            file: true,
            rotation: "Hourly".to_string(),
        };
        let config = LogConfig::from_logging_config(&logging);
        assert_eq!(config.level, "nugget_rs=debug");
        assert_eq!(config.log_dir, PathBuf::from("/var/log/nugget"));
        assert_eq!(config.rotation, LogRotation::Hourly);
        assert!(!config.console_enabled);
        assert!(config.file_enabled);
    }

    #[test]
    fn test_rotation_parse() {
        assert_eq!(LogRotation::parse("never"), LogRotation::Never);
        assert_eq!(LogRotation::parse("weekly"), LogRotation::Daily);
    }

    #[test]
    fn test_ensure_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("logs");
        ensure_log_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
