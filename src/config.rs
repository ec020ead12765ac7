//! アプリケーション設定管理モジュール
//!
//! XDGディレクトリを使用した設定ファイルの読み込みと保存を提供します。
//! タイムアウト秒数や有害度スコアの増減幅などのポリシー定数は設定に含めない。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::moderation::ExemptionPolicy;

/// ボット設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// ボットのログイン名（自分の発言を除外するために使う）
    pub login: String,
    /// Helix APIのクライアントID
    pub client_id: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            login: "citadel_ai_moderator".to_string(),
            client_id: None,
        }
    }
}

/// モデレーション設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    /// 組み込みリストに追加する禁止語
    pub extra_banned_words: Vec<String>,
    /// プラットフォーム呼び出しのタイムアウト（ミリ秒）
    pub action_timeout_ms: u64,
    /// モデレーション対象外とするロール
    pub exemptions: ExemptionPolicy,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            extra_banned_words: Vec::new(),
            action_timeout_ms: 5000,
            exemptions: ExemptionPolicy::default(),
        }
    }
}

impl ModerationConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// 再接続設定（指数バックオフ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// 初期待機時間（ミリ秒）
    pub initial_delay_ms: u64,
    /// 最大待機時間（ミリ秒）
    pub max_delay_ms: u64,
    /// 指数バックオフの倍率
    pub multiplier: f64,
    /// 連続失敗の上限
    pub max_attempts: u32,
    /// ジッターの幅（0.2なら±20%）
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: 10,
            jitter: 0.2,
        }
    }
}

/// テレメトリ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// WebSocketサーバーのホスト
    pub websocket_host: String,
    /// WebSocketサーバーの希望ポート
    pub websocket_port: u16,
    /// オブザーバーごとのバッファサイズ
    pub channel_capacity: usize,
    /// 統計スナップショットの送信間隔（秒）
    pub stats_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            websocket_host: "127.0.0.1".to_string(),
            websocket_port: 8765,
            channel_capacity: 256,
            stats_interval_secs: 5,
        }
    }
}

impl TelemetryConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

/// ログ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
    /// JSON形式で出力する
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: false,
            json: false,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "citadel", "citadel").context("Failed to get project directories")
}

/// XDGデフォルトのログディレクトリ
pub fn default_log_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_local_dir().join("logs"))
}

/// 設定管理マネージャー
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// XDGディレクトリの設定ファイルを使う設定マネージャーを作成
    pub fn new() -> Result<Self> {
        let config_path = project_dirs()?.config_dir().join("config.toml");
        debug!("Config file path: {}", config_path.display());
        Ok(Self { config_path })
    }

    /// 任意のパスの設定ファイルを使う
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 設定を読み込み
    ///
    /// ファイルが存在しない場合はデフォルト設定を返す。
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
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

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
