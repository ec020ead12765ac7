//! チャット接続アダプター
//!
//! チャンネルごとに1本の外部チャット接続を持ち、プラットフォームのイベントを
//! `ChatMessage` に変換して流す。接続が切れた場合は同じ資格情報で再接続する。

pub mod irc;
pub mod memory;
pub mod twitch;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::config::ReconnectConfig;
use crate::error::ConnectError;
use crate::moderation::{ChannelName, ChatMessage};

pub use memory::{ChatFeed, InMemoryConnector, InboundChat};
pub use twitch::TwitchConnector;

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// 接続から流れてくるイベント
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// チャットメッセージ（ボット自身の発言は含まない）
    Message(ChatMessage),
    /// 接続状態の変化
    Status {
        state: ConnectionState,
        reason: Option<String>,
    },
}

impl ConnectionEvent {
    pub fn status(state: ConnectionState, reason: Option<String>) -> Self {
        Self::Status { state, reason }
    }
}

/// ボットの資格情報
#[derive(Clone)]
pub struct Credentials {
    /// ボットのログイン名
    pub bot_login: String,
    access_token: String,
}

impl Credentials {
    pub fn new(bot_login: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            bot_login: bot_login.into().to_lowercase(),
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        self.access_token.trim_start_matches("oauth:")
    }

    /// ボット自身の発言かどうか
    pub fn is_own_message(&self, username: &str) -> bool {
        username.eq_ignore_ascii_case(&self.bot_login)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bot_login", &self.bot_login)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// チャット接続のファクトリー
#[async_trait]
pub trait ChatConnector: Send + Sync {
    /// チャンネルに接続する
    ///
    /// 認証失敗はここでエラーとして返す。
    async fn connect(
        &self,
        channel: &ChannelName,
        credentials: &Credentials,
    ) -> Result<Box<dyn ChatConnection>, ConnectError>;
}

/// 確立済みのチャット接続
#[async_trait]
pub trait ChatConnection: Send {
    /// 次のイベントを待つ。`None` は接続が完全に終了したことを示す
    async fn next_event(&mut self) -> Option<ConnectionEvent>;

    /// 再接続せずに接続を閉じる
    async fn disconnect(&mut self);
}

/// セッション内で一意なメッセージIDの採番器
///
/// プラットフォームがIDを付与しない場合に使う。
#[derive(Debug)]
pub struct MessageIdGenerator {
    prefix: Uuid,
    next: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self {
            prefix: Uuid::new_v4(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, seq)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// 再接続用の指数バックオフ
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// 次の待機時間を返す。試行回数の上限に達したら `None`
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }

        let base = self.config.initial_delay_ms as f64
            * self.config.multiplier.max(1.0).powi(self.attempt as i32);
        let capped = base.min(self.config.max_delay_ms as f64);
        self.attempt += 1;

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };

        Some(Duration::from_millis((capped * factor) as u64))
    }

    /// 再接続に成功したら呼ぶ
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
