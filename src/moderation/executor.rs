//! モデレーションアクションの実行
//!
//! 判定結果からアクションを組み立て、プラットフォームのモデレーションAPIへ送る。
//! 呼び出しは時間制限つきで、失敗はすべて `ActionOutcome::Failed` に変換される。
//! 自動リトライは行わない。

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use super::models::{
    ActionKind, ActionOutcome, ActionRecord, ChannelName, ChatMessage, ModerationAction,
    ModerationVerdict,
};
use crate::error::ActionError;

/// プラットフォーム呼び出しのデフォルトタイムアウト
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// プラットフォームのモデレーションAPI
#[async_trait]
pub trait ModerationApi: Send + Sync {
    /// メッセージを削除
    async fn delete_message(&self, channel: &ChannelName, message_id: &str)
        -> Result<(), ActionError>;

    /// ユーザーをタイムアウト
    async fn timeout_user(
        &self,
        channel: &ChannelName,
        username: &str,
        duration_secs: u32,
        reason: &str,
    ) -> Result<(), ActionError>;

    /// ユーザーをBAN
    async fn ban_user(
        &self,
        channel: &ChannelName,
        username: &str,
        reason: &str,
    ) -> Result<(), ActionError>;
}

/// 判定結果から適用すべきアクションを組み立てる
///
/// 削除（プラットフォームIDがある場合のみ）→ タイムアウトの順。
pub fn plan_actions(message: &ChatMessage, verdict: &ModerationVerdict) -> Vec<ModerationAction> {
    let Some(duration) = verdict.timeout_seconds() else {
        return Vec::new();
    };

    let reason = verdict.reason();
    let mut actions = Vec::with_capacity(2);
    if let Some(message_id) = message.deletable_id() {
        actions.push(ModerationAction::delete(message, message_id, reason));
    }
    actions.push(ModerationAction::timeout(message, duration, reason));
    actions
}

/// アクション実行器
#[derive(Clone)]
pub struct ActionExecutor {
    api: Arc<dyn ModerationApi>,
    request_timeout: Duration,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    pub fn new(api: Arc<dyn ModerationApi>) -> Self {
        Self::with_timeout(api, DEFAULT_ACTION_TIMEOUT)
    }

    pub fn with_timeout(api: Arc<dyn ModerationApi>, request_timeout: Duration) -> Self {
        Self {
            api,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// 1つのアクションを実行
    ///
    /// エラーもパニックも呼び出し元へは伝播せず、`Err` として返す。
    pub async fn execute(&self, action: &ModerationAction) -> Result<(), ActionError> {
        let call = self.dispatch(action);
        let guarded = AssertUnwindSafe(call).catch_unwind();

        match tokio::time::timeout(self.request_timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(ActionError::Aborted {
                reason: "platform call panicked".to_string(),
            }),
            Err(_elapsed) => Err(ActionError::Timeout {
                after_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }

    /// アクションを実行して結果を記録として返す
    pub async fn apply(&self, action: ModerationAction) -> ActionRecord {
        let outcome = match self.execute(&action).await {
            Ok(()) => {
                tracing::info!(
                    channel = %action.channel,
                    kind = ?action.kind,
                    user = %action.target_username,
                    "🔨 Moderation action applied"
                );
                ActionOutcome::Applied
            }
            Err(e) => {
                tracing::warn!(
                    channel = %action.channel,
                    kind = ?action.kind,
                    user = %action.target_username,
                    error = %e,
                    "❌ Moderation action failed"
                );
                ActionOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        ActionRecord {
            action,
            outcome,
            completed_at: Utc::now(),
        }
    }

    /// 複数のアクションを順番に実行する
    ///
    /// 1つの失敗が後続のアクションを止めることはない。
    pub async fn apply_all(&self, actions: Vec<ModerationAction>) -> Vec<ActionRecord> {
        let mut records = Vec::with_capacity(actions.len());
        for action in actions {
            records.push(self.apply(action).await);
        }
        records
    }

    async fn dispatch(&self, action: &ModerationAction) -> Result<(), ActionError> {
        match action.kind {
            ActionKind::Delete => {
                let message_id = action.target_message_id.as_deref().unwrap_or_default();
                self.api.delete_message(&action.channel, message_id).await
            }
            ActionKind::Timeout => {
                let duration = action.duration_seconds.unwrap_or_default();
                self.api
                    .timeout_user(
                        &action.channel,
                        &action.target_username,
                        duration,
                        &action.reason,
                    )
                    .await
            }
            ActionKind::Ban => {
                self.api
                    .ban_user(&action.channel, &action.target_username, &action.reason)
                    .await
            }
        }
    }
}
