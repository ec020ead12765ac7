//! プラットフォームを呼ばずにログだけ出すモデレーションAPI

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::error::ActionError;
use crate::moderation::{ChannelName, ModerationApi};

/// ドライラン用の実装。全ての呼び出しは成功扱い
#[derive(Debug, Default)]
pub struct DryRunModerationApi {
    calls: AtomicU64,
}

impl DryRunModerationApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// これまでに受けた呼び出し回数
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModerationApi for DryRunModerationApi {
    async fn delete_message(
        &self,
        channel: &ChannelName,
        message_id: &str,
    ) -> Result<(), ActionError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        info!("🧪 [dry-run] delete message {} in #{}", message_id, channel);
        Ok(())
    }

    async fn timeout_user(
        &self,
        channel: &ChannelName,
        username: &str,
        duration_seconds: u32,
        reason: &str,
    ) -> Result<(), ActionError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        info!(
            "🧪 [dry-run] timeout {} for {}s in #{}: {}",
            username, duration_seconds, channel, reason
        );
        Ok(())
    }

    async fn ban_user(
        &self,
        channel: &ChannelName,
        username: &str,
        reason: &str,
    ) -> Result<(), ActionError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        info!("🧪 [dry-run] ban {} in #{}: {}", username, channel, reason);
        Ok(())
    }
}
