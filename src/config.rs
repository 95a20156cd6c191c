//! アプリケーション設定管理モジュール
//!
//! XDGディレクトリを使用した設定ファイルの永続化と管理を提供します。
//! APIキーは設定ファイルには保存しない（ホスト側から渡される）。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// ポーリング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    /// 非公式エンドポイントの最小ポーリング間隔（ミリ秒）
    pub unofficial_min_interval_ms: u64,
    /// 公式APIの最小ポーリング間隔（ミリ秒）
    pub official_min_interval_ms: u64,
    /// 連続失敗の上限（超えるとセッション終了）
    pub max_consecutive_failures: u32,
    /// stop要求からStoppedまでの猶予（ミリ秒）
    pub cancellation_grace_ms: u64,
    pub transient_backoff_base_ms: u64,
    pub transient_backoff_max_ms: u64,
    pub rate_limit_backoff_base_ms: u64,
    pub rate_limit_backoff_max_ms: u64,
    /// バックオフにジッタを加えるか
    pub backoff_jitter: bool,
    /// HTTPリクエストのタイムアウト（秒）
    pub http_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            unofficial_min_interval_ms: 1_500,
            official_min_interval_ms: 5_000,
            max_consecutive_failures: 8,
            cancellation_grace_ms: 800,
            transient_backoff_base_ms: 500,
            transient_backoff_max_ms: 10_000,
            rate_limit_backoff_base_ms: 2_000,
            rate_limit_backoff_max_ms: 60_000,
            backoff_jitter: true,
            http_timeout_secs: 10,
        }
    }
}

impl PollingConfig {
    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// クォータ設定（公式API）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// 1日あたりのユニット数
    pub daily_units: u64,
    /// liveChatMessages.list 1回のコスト
    pub list_cost: u64,
    /// videos.list 1回のコスト
    pub resolve_cost: u64,
    /// クォータウィンドウの長さ（時間）
    pub window_hours: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_units: 10_000,
            list_cost: 5,
            resolve_cost: 1,
            window_hours: 24,
        }
    }
}

/// 重複排除設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    /// 保持するイベントIDの上限
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// 永続化設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// データベースファイル（Noneの場合はXDGデフォルト使用）
    pub database_path: Option<PathBuf>,
    /// 1バッチの書き込み期限（ミリ秒）
    pub batch_deadline_ms: u64,
    /// SQLiteのbusy_timeout（ミリ秒）
    pub busy_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            batch_deadline_ms: 2_000,
            busy_timeout_ms: 5_000,
        }
    }
}

impl PersistenceConfig {
    pub fn batch_deadline(&self) -> Duration {
        Duration::from_millis(self.batch_deadline_ms)
    }
}

/// 配信サーバー設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// 希望ポート
    pub port: u16,
    /// 希望ポートが使用中の場合に試すポート数
    pub port_search_span: u16,
    /// クライアント1件あたりの送信タイムアウト（ミリ秒）
    pub client_send_timeout_ms: u64,
    /// クライアントごとの送信キューの深さ（バッチ単位）
    pub client_queue_depth: usize,
    /// カーソルなしで接続したクライアントに送る直近イベント数
    pub initial_replay: usize,
    /// カーソル指定時に再送する最大件数
    pub max_replay: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            port_search_span: 10,
            client_send_timeout_ms: 250,
            client_queue_depth: 64,
            initial_replay: 50,
            max_replay: 500,
        }
    }
}

impl ServerConfig {
    pub fn client_send_timeout(&self) -> Duration {
        Duration::from_millis(self.client_send_timeout_ms)
    }
}

/// ログ設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
    /// ログファイル名の接頭辞
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: false,
            file_prefix: "chat-relay".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub polling: PollingConfig,
    pub quota: QuotaConfig,
    pub dedup: DedupConfig,
    pub persistence: PersistenceConfig,
    pub server: ServerConfig,
    pub log: LogConfig,
}

/// XDGのプロジェクトディレクトリ
pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "sifyfy", "chat-relay").context("Failed to get project directories")
}

/// 設定管理マネージャー
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// XDGの設定ディレクトリを使う設定マネージャーを作成
    pub fn new() -> Result<Self> {
        let config_path = project_dirs()?.config_dir().join("config.toml");
        debug!("Config file path: {}", config_path.display());
        Self::with_path(config_path)
    }

    /// 任意のパスを使う設定マネージャーを作成
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        // 設定ディレクトリを作成（存在しない場合）
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        Ok(Self { config_path })
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// 設定を読み込み
    pub fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Config file not found, using default settings: {}",
                self.config_path.display()
            );
            return Ok(AppConfig::default());
        }

        let config_content = fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read config file: {}", self.config_path.display())
        })?;

        let config: AppConfig = toml::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse config file: {}",
                self.config_path.display()
            )
        })?;

        info!(
            "✅ Configuration loaded from: {}",
            self.config_path.display()
        );

        Ok(config)
    }

    /// 設定を保存
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let config_content =
            toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.config_path, config_content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;

        info!("💾 Configuration saved to: {}", self.config_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.quota.daily_units, 10_000);
        assert_eq!(config.quota.list_cost, 5);
        assert_eq!(config.dedup.capacity, 10_000);
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.polling.official_min_interval_ms, 5_000);
        assert_eq!(config.persistence.batch_deadline(), Duration::from_secs(2));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.toml")).unwrap();
        assert_eq!(manager.load_config().unwrap(), AppConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("nested/config.toml")).unwrap();

        let mut config = AppConfig::default();
        config.server.port = 9000;
        config.dedup.capacity = 42;
        config.log.enable_file_logging = true;
        manager.save_config(&config).unwrap();

        let loaded = manager.load_config().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server]\nport = 9100\n").unwrap();

        let manager = ConfigManager::with_path(path).unwrap();
        let loaded = manager.load_config().unwrap();
        assert_eq!(loaded.server.port, 9100);
        assert_eq!(loaded.server.max_replay, 500);
        assert_eq!(loaded.quota, QuotaConfig::default());
    }
}
