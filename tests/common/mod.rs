//! 統合テスト共通のヘルパー

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use citadel::moderation::{ActionKind, ActionRecord};
use citadel::{
    ActionError, ActionExecutor, ChannelName, ChatMessage, Credentials, InMemoryConnector,
    ModerationApi, ModerationVerdict, ObserverHandle, RuleBasedClassifier, SessionDeps,
    SessionRegistry, TelemetryBroadcaster, TelemetryEvent,
};

pub const BOT_LOGIN: &str = "citadel_bot";

/// プラットフォームに送られた呼び出し
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub kind: ActionKind,
    pub channel: String,
    pub target: String,
    pub duration_seconds: Option<u32>,
}

/// 呼び出しを記録するだけのモデレーションAPI
#[derive(Default)]
pub struct RecordingModerationApi {
    calls: Mutex<Vec<RecordedCall>>,
    failing: Mutex<Option<ActionKind>>,
    hanging: Mutex<Option<ActionKind>>,
}

impl RecordingModerationApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 指定した種別の呼び出しを403で失敗させる
    pub fn fail_on(&self, kind: ActionKind) {
        *self.failing.lock() = Some(kind);
    }

    /// 指定した種別の呼び出しを応答させない
    pub fn hang_on(&self, kind: ActionKind) {
        *self.hanging.lock() = Some(kind);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    async fn record(
        &self,
        kind: ActionKind,
        channel: &ChannelName,
        target: &str,
        duration_seconds: Option<u32>,
    ) -> Result<(), ActionError> {
        self.calls.lock().push(RecordedCall {
            kind,
            channel: channel.to_string(),
            target: target.to_string(),
            duration_seconds,
        });

        let hang = *self.hanging.lock() == Some(kind);
        if hang {
            std::future::pending::<()>().await;
        }

        let fail = *self.failing.lock() == Some(kind);
        if fail {
            return Err(ActionError::Rejected {
                status: 403,
                body: "missing moderator scope".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ModerationApi for RecordingModerationApi {
    async fn delete_message(
        &self,
        channel: &ChannelName,
        message_id: &str,
    ) -> Result<(), ActionError> {
        self.record(ActionKind::Delete, channel, message_id, None)
            .await
    }

    async fn timeout_user(
        &self,
        channel: &ChannelName,
        username: &str,
        duration_seconds: u32,
        _reason: &str,
    ) -> Result<(), ActionError> {
        self.record(ActionKind::Timeout, channel, username, Some(duration_seconds))
            .await
    }

    async fn ban_user(
        &self,
        channel: &ChannelName,
        username: &str,
        _reason: &str,
    ) -> Result<(), ActionError> {
        self.record(ActionKind::Ban, channel, username, None)
            .await
    }
}

/// テスト用のレジストリ一式
pub struct Harness {
    pub connector: InMemoryConnector,
    pub api: Arc<RecordingModerationApi>,
    pub registry: Arc<SessionRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let connector = InMemoryConnector::new();
        let api = RecordingModerationApi::new();
        let registry = Arc::new(SessionRegistry::new(SessionDeps {
            connector: Arc::new(connector.clone()),
            classifier: Arc::new(RuleBasedClassifier::default()),
            executor: ActionExecutor::with_timeout(api.clone(), Duration::from_secs(2)),
            broadcaster: TelemetryBroadcaster::new(capacity),
            stream_status: None,
            stats_interval: Duration::from_secs(60),
        }));

        Self {
            connector,
            api,
            registry,
        }
    }
}

pub fn credentials() -> Credentials {
    Credentials::new(BOT_LOGIN, "oauth-token")
}

/// 条件を満たすイベントが来るまで待つ
pub async fn wait_for_event(
    observer: &mut ObserverHandle,
    mut predicate: impl FnMut(&TelemetryEvent) -> bool,
) -> TelemetryEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = observer.recv().await.expect("broadcaster closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for telemetry event")
}

/// 次のチャットイベントを待つ
pub async fn next_chat_event(
    observer: &mut ObserverHandle,
) -> (ChatMessage, Option<ModerationVerdict>, Vec<ActionRecord>) {
    match wait_for_event(observer, |event| {
        matches!(event, TelemetryEvent::ChatEvent { .. })
    })
    .await
    {
        TelemetryEvent::ChatEvent {
            message,
            verdict,
            actions,
            ..
        } => (message, verdict, actions),
        _ => unreachable!(),
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}
