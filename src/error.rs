//! エラー型の定義
//!
//! 接続・アクション実行・セッション制御の各層ごとにエラーを分ける。

use thiserror::Error;

use crate::moderation::ChannelName;
use crate::session::SessionStatus;

/// チャット接続時のエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// 認証失敗（トークン不正など）。再接続しても回復しない
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// チャットサーバーに到達できない
    #[error("Chat server unreachable: {reason}")]
    Unreachable { reason: String },

    /// プロトコル上の異常
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// 接続が既に閉じられている
    #[error("Connection closed")]
    Closed,
}

impl ConnectError {
    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// 再試行しても意味がないエラーかどうか
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// モデレーションAPI呼び出しのエラー
#[derive(Error, Debug)]
pub enum ActionError {
    /// プラットフォームがリクエストを拒否した
    #[error("Platform rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// リクエストがタイムアウトした
    #[error("Platform call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// HTTP通信エラー
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 対象ユーザーが見つからない
    #[error("Unknown user: {username}")]
    UnknownUser { username: String },

    /// 呼び出し中にパニックが発生した
    #[error("Platform call aborted: {reason}")]
    Aborted { reason: String },
}

/// セッション制御のエラー
#[derive(Error, Debug)]
pub enum SessionError {
    /// 同じチャンネルのセッションが既に稼働中
    #[error("A session for channel '{channel}' is already active")]
    AlreadyActive { channel: ChannelName },

    /// セッションが存在しない
    #[error("No session for channel '{channel}'")]
    NotFound { channel: ChannelName },

    /// チャット接続に失敗した（セッションはActiveに到達しない）
    #[error("Failed to connect to channel '{channel}': {source}")]
    ConnectFailed {
        channel: ChannelName,
        #[source]
        source: ConnectError,
    },

    /// 現在の状態からは遷移できない
    #[error("Invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// セッションのメッセージループが既に終了している
    #[error("Session for channel '{channel}' is no longer running")]
    NotRunning { channel: ChannelName },
}
