//! テレメトリのイベント定義
//!
//! ダッシュボードがそのまま描画できる形でシリアライズする。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::ConnectionState;
use crate::moderation::{ActionRecord, ChannelName, ChatMessage, ModerationVerdict};
use crate::platform::StreamStatus;
use crate::session::{SessionStats, SessionStatus};

/// オブザーバーへ配信するイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum TelemetryEvent {
    /// チャット1行と、その処理結果
    ///
    /// 判定がClean（または一時停止中）でも必ず流れる。
    #[serde(rename_all = "camelCase")]
    ChatEvent {
        channel: ChannelName,
        message: ChatMessage,
        /// 一時停止中は判定しないので `None`
        verdict: Option<ModerationVerdict>,
        actions: Vec<ActionRecord>,
    },

    /// モデレーションアクションの結果
    ModerationAction(ActionRecord),

    /// 統計のスナップショット
    #[serde(rename_all = "camelCase")]
    StatsSnapshot {
        channel: ChannelName,
        status: SessionStatus,
        stats: SessionStats,
        timestamp: DateTime<Utc>,
    },

    /// チャット接続の状態
    #[serde(rename_all = "camelCase")]
    ConnectionStatus {
        channel: ChannelName,
        status: ConnectionState,
        reason: Option<String>,
    },

    /// セッションの状態遷移
    #[serde(rename_all = "camelCase")]
    SessionStatus {
        channel: ChannelName,
        status: SessionStatus,
    },

    /// 配信状態
    #[serde(rename_all = "camelCase")]
    StreamStatus {
        channel: ChannelName,
        status: StreamStatus,
    },
}

impl TelemetryEvent {
    pub fn stats_snapshot(channel: &ChannelName, status: SessionStatus, stats: SessionStats) -> Self {
        Self::StatsSnapshot {
            channel: channel.clone(),
            status,
            stats,
            timestamp: Utc::now(),
        }
    }

    pub fn connection_status(
        channel: &ChannelName,
        status: ConnectionState,
        reason: Option<String>,
    ) -> Self {
        Self::ConnectionStatus {
            channel: channel.clone(),
            status,
            reason,
        }
    }

    pub fn session_status(channel: &ChannelName, status: SessionStatus) -> Self {
        Self::SessionStatus {
            channel: channel.clone(),
            status,
        }
    }

    /// イベントの対象チャンネル
    pub fn channel(&self) -> &ChannelName {
        match self {
            Self::ChatEvent { channel, .. }
            | Self::StatsSnapshot { channel, .. }
            | Self::ConnectionStatus { channel, .. }
            | Self::SessionStatus { channel, .. }
            | Self::StreamStatus { channel, .. } => channel,
            Self::ModerationAction(record) => &record.action.channel,
        }
    }
}
