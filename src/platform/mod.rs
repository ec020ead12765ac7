//! 配信プラットフォームのREST API

pub mod dry_run;
pub mod helix;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::moderation::ChannelName;

pub use dry_run::DryRunModerationApi;
pub use helix::HelixClient;

/// 配信状態
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub is_live: bool,
    pub viewer_count: u64,
    /// 経過時間（"2h 5m" / "42m"）
    pub uptime: String,
    pub title: String,
    pub category: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl StreamStatus {
    /// オフライン（または取得失敗）時の状態
    pub fn offline(title: impl Into<String>) -> Self {
        Self {
            is_live: false,
            viewer_count: 0,
            uptime: "0m".to_string(),
            title: title.into(),
            category: "N/A".to_string(),
            started_at: None,
        }
    }
}

/// 配信状態の取得元
#[async_trait]
pub trait StreamStatusProvider: Send + Sync {
    /// 取得に失敗した場合もエラーにせずオフライン扱いで返す
    async fn stream_status(&self, channel: &ChannelName) -> StreamStatus;
}

/// 経過時間を "{h}h {m}m" 形式にする（1時間未満は "{m}m"）
pub fn format_uptime(elapsed: chrono::Duration) -> String {
    let total_minutes = elapsed.num_minutes().max(0);
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
