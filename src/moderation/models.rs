//! モデレーションのデータモデル
//!
//! チャットメッセージ、判定結果（Verdict）、モデレーションアクションを定義する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// BannedContent判定時のタイムアウト秒数
pub const BANNED_CONTENT_TIMEOUT_SECS: u32 = 600;
/// Spam判定時のタイムアウト秒数
pub const SPAM_TIMEOUT_SECS: u32 = 300;

/// BannedContentの重大度
pub const BANNED_CONTENT_SEVERITY: f64 = 1.0;
/// Spamの重大度
pub const SPAM_SEVERITY: f64 = 0.5;

/// チャンネル名
///
/// 先頭の `#` を取り除き、小文字に正規化して保持する。
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let name = raw.as_ref().trim().trim_start_matches('#').to_lowercase();
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// IRCのJOIN/PART用の表記（`#channel`）
    pub fn irc_name(&self) -> String {
        format!("#{}", self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// 送信者の権限フラグ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderFlags {
    pub is_moderator: bool,
    pub is_subscriber: bool,
}

/// 受信したチャットメッセージ（1行）
///
/// 作成後は変更しない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// メッセージID（プラットフォーム付与、なければセッション内で一意に採番）
    pub id: String,
    /// IDがプラットフォーム付与かどうか。採番IDに対して削除APIは呼ばない
    pub platform_id: bool,
    pub channel: ChannelName,
    pub username: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub sender: SenderFlags,
    pub badges: BTreeSet<String>,
}

impl ChatMessage {
    /// 削除APIに渡せるIDを返す
    pub fn deletable_id(&self) -> Option<&str> {
        self.platform_id.then_some(self.id.as_str())
    }

    pub fn has_badge(&self, badge: &str) -> bool {
        self.badges.contains(badge)
    }
}

/// スパム判定のシグナル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpamSignal {
    ExcessiveCaps,
    ExcessiveRepetition,
}

/// 判定カテゴリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictCategory {
    Clean,
    BannedContent,
    Spam,
}

/// 1メッセージに対する判定結果
///
/// カテゴリは必ず1つ。BannedContentとSpamの両方に該当する場合はBannedContent。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum ModerationVerdict {
    Clean,
    BannedContent { term: String },
    Spam { signal: SpamSignal },
}

impl ModerationVerdict {
    pub fn category(&self) -> VerdictCategory {
        match self {
            Self::Clean => VerdictCategory::Clean,
            Self::BannedContent { .. } => VerdictCategory::BannedContent,
            Self::Spam { .. } => VerdictCategory::Spam,
        }
    }

    /// 判定の重大度（BannedContent > Spam）。0より大きい判定は有害度スコアを一定量上げる
    pub fn severity(&self) -> f64 {
        match self {
            Self::Clean => 0.0,
            Self::BannedContent { .. } => BANNED_CONTENT_SEVERITY,
            Self::Spam { .. } => SPAM_SEVERITY,
        }
    }

    pub fn requires_action(&self) -> bool {
        !matches!(self, Self::Clean)
    }

    /// カテゴリごとに固定のタイムアウト秒数
    pub fn timeout_seconds(&self) -> Option<u32> {
        match self {
            Self::Clean => None,
            Self::BannedContent { .. } => Some(BANNED_CONTENT_TIMEOUT_SECS),
            Self::Spam { .. } => Some(SPAM_TIMEOUT_SECS),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Clean => "",
            Self::BannedContent { .. } => "Inappropriate language detected by AI moderator",
            Self::Spam { .. } => "Spam detected by AI moderator",
        }
    }
}

/// アクション種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Delete,
    Timeout,
    Ban,
}

/// プラットフォームに対して適用するモデレーションアクション
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationAction {
    pub kind: ActionKind,
    pub channel: ChannelName,
    pub target_username: String,
    pub target_message_id: Option<String>,
    /// Timeoutのみ
    pub duration_seconds: Option<u32>,
    pub reason: String,
}

impl ModerationAction {
    pub fn delete(message: &ChatMessage, message_id: &str, reason: &str) -> Self {
        Self {
            kind: ActionKind::Delete,
            channel: message.channel.clone(),
            target_username: message.username.clone(),
            target_message_id: Some(message_id.to_string()),
            duration_seconds: None,
            reason: reason.to_string(),
        }
    }

    pub fn timeout(message: &ChatMessage, duration_seconds: u32, reason: &str) -> Self {
        Self {
            kind: ActionKind::Timeout,
            channel: message.channel.clone(),
            target_username: message.username.clone(),
            target_message_id: Some(message.id.clone()),
            duration_seconds: Some(duration_seconds),
            reason: reason.to_string(),
        }
    }

    pub fn ban(channel: &ChannelName, username: &str, reason: &str) -> Self {
        Self {
            kind: ActionKind::Ban,
            channel: channel.clone(),
            target_username: username.to_string(),
            target_message_id: None,
            duration_seconds: None,
            reason: reason.to_string(),
        }
    }
}

/// アクションの最終状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ActionOutcome {
    Applied,
    Failed { reason: String },
}

impl ActionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// アクションとその結果（テレメトリ上の監査証跡）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub action: ModerationAction,
    pub outcome: ActionOutcome,
    pub completed_at: DateTime<Utc>,
}
