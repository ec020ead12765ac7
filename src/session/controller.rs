//! チャンネルごとのモデレーションセッション
//!
//! 1セッションは1本のチャット接続と1つの統計を持つ。受信ループはチャンネルごとに
//! 1タスクで、メッセージは到着順に1件ずつ処理される。
//!
//! 状態遷移: `Connecting → Active ⇄ Paused → Disconnecting → Stopped`

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::stats::SessionStats;
use crate::chat::{ChatConnection, ChatConnector, ConnectionEvent, ConnectionState, Credentials};
use crate::error::SessionError;
use crate::moderation::{
    plan_actions, ActionExecutor, ActionRecord, ChannelName, ChatMessage, Classifier,
    ModerationAction, ModerationVerdict,
};
use crate::platform::StreamStatusProvider;
use crate::telemetry::{TelemetryBroadcaster, TelemetryEvent};

/// 停止時に受信ループの終了を待つ時間
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// 手動操作コマンドのバッファ
const COMMAND_BUFFER: usize = 32;

/// セッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Connecting,
    Active,
    Paused,
    Disconnecting,
    Stopped,
}

impl SessionStatus {
    /// チャンネルを占有している状態かどうか
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// セッション開始時に呼び出し元へ返す識別情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub channel: ChannelName,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// セッションが依存するコンポーネント
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn ChatConnector>,
    pub classifier: Arc<dyn Classifier>,
    pub executor: ActionExecutor,
    pub broadcaster: TelemetryBroadcaster,
    /// 設定されていれば接続直後に配信状態を1回通知する
    pub stream_status: Option<Arc<dyn StreamStatusProvider>>,
    /// 統計スナップショットの定期送信間隔
    pub stats_interval: Duration,
}

/// 受信ループと制御側で共有する状態
///
/// 統計を書き換えるのは受信ループだけ（停止時のリセットはループ終了後）。
#[derive(Debug)]
struct SessionShared {
    status: RwLock<SessionStatus>,
    stats: RwLock<SessionStats>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            status: RwLock::new(SessionStatus::Connecting),
            stats: RwLock::new(SessionStats::default()),
        }
    }

    fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }

    fn stats(&self) -> SessionStats {
        *self.stats.read()
    }

    fn update_stats(&self, f: impl FnOnce(&mut SessionStats)) -> SessionStats {
        let mut stats = self.stats.write();
        f(&mut stats);
        *stats
    }
}

/// 状態と統計を読むためのハンドル
///
/// 受信ループを止めずにいつでも読める。
#[derive(Debug, Clone)]
pub struct SessionHandle {
    reference: SessionRef,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn reference(&self) -> &SessionRef {
        &self.reference
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }
}

enum SessionCommand {
    Ban {
        username: String,
        reason: String,
        reply: oneshot::Sender<ActionRecord>,
    },
}

/// 1チャンネル分のセッション
pub struct SessionController {
    reference: SessionRef,
    shared: Arc<SessionShared>,
    broadcaster: TelemetryBroadcaster,
    shutdown: watch::Sender<bool>,
    commands: mpsc::Sender<SessionCommand>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("reference", &self.reference)
            .field("status", &self.shared.status())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// チャットに接続してセッションを開始する
    ///
    /// 接続に失敗した場合、セッションは `Active` にならずにエラーを返す。
    pub async fn start(
        channel: ChannelName,
        credentials: &Credentials,
        deps: SessionDeps,
    ) -> Result<Self, SessionError> {
        let reference = SessionRef {
            channel: channel.clone(),
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
        };
        let shared = Arc::new(SessionShared::new());
        let broadcaster = deps.broadcaster.clone();

        info!("🚀 Starting moderation session for #{}", channel);
        broadcaster.publish(TelemetryEvent::session_status(
            &channel,
            SessionStatus::Connecting,
        ));
        broadcaster.publish(TelemetryEvent::connection_status(
            &channel,
            ConnectionState::Connecting,
            None,
        ));

        let connection = match deps.connector.connect(&channel, credentials).await {
            Ok(connection) => connection,
            Err(source) => {
                warn!("❌ Failed to connect to #{}: {}", channel, source);
                shared.set_status(SessionStatus::Stopped);
                broadcaster.publish(TelemetryEvent::connection_status(
                    &channel,
                    ConnectionState::Disconnected,
                    Some(source.to_string()),
                ));
                broadcaster.publish(TelemetryEvent::session_status(
                    &channel,
                    SessionStatus::Stopped,
                ));
                return Err(SessionError::ConnectFailed { channel, source });
            }
        };

        shared.set_status(SessionStatus::Active);
        broadcaster.publish(TelemetryEvent::connection_status(
            &channel,
            ConnectionState::Connected,
            None,
        ));
        broadcaster.publish(TelemetryEvent::session_status(
            &channel,
            SessionStatus::Active,
        ));
        broadcaster.publish(TelemetryEvent::stats_snapshot(
            &channel,
            SessionStatus::Active,
            shared.stats(),
        ));

        if let Some(provider) = deps.stream_status.clone() {
            let broadcaster = broadcaster.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                let status = provider.stream_status(&channel).await;
                broadcaster.publish(TelemetryEvent::StreamStatus { channel, status });
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let stats_interval = deps.stats_interval;

        let pipeline = MessagePipeline {
            channel: channel.clone(),
            shared: shared.clone(),
            deps,
        };
        let task = tokio::spawn(run_session_loop(
            pipeline,
            connection,
            shutdown_rx,
            command_rx,
            stats_interval,
        ));

        info!("✅ Moderation session active for #{}", channel);

        Ok(Self {
            reference,
            shared,
            broadcaster,
            shutdown: shutdown_tx,
            commands: command_tx,
            task: Some(task),
        })
    }

    pub fn reference(&self) -> &SessionRef {
        &self.reference
    }

    /// 読み取り専用のハンドルを返す
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            reference: self.reference.clone(),
            shared: self.shared.clone(),
        }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.reference.channel
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// 統計のコピーを返す
    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    /// モデレーションを一時停止する（チャット接続は維持）
    pub fn pause(&self) -> Result<SessionStatus, SessionError> {
        self.transition(SessionStatus::Active, SessionStatus::Paused)
    }

    /// モデレーションを再開する
    pub fn resume(&self) -> Result<SessionStatus, SessionError> {
        self.transition(SessionStatus::Paused, SessionStatus::Active)
    }

    /// `from → to` の遷移。既に `to` なら何もしない
    fn transition(
        &self,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<SessionStatus, SessionError> {
        {
            let mut status = self.shared.status.write();
            if *status == to {
                return Ok(to);
            }
            if *status != from {
                return Err(SessionError::InvalidTransition { from: *status, to });
            }
            *status = to;
        }

        info!("⏯️ Session #{} is now {:?}", self.channel(), to);
        self.broadcaster
            .publish(TelemetryEvent::session_status(self.channel(), to));
        Ok(to)
    }

    /// ユーザーを手動でBANする
    ///
    /// 受信ループ経由で実行されるため、統計の更新はメッセージ処理と直列化される。
    pub async fn ban_user(&self, username: &str, reason: &str) -> Result<ActionRecord, SessionError> {
        let not_running = || SessionError::NotRunning {
            channel: self.channel().clone(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Ban {
                username: username.to_lowercase(),
                reason: reason.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| not_running())?;

        reply_rx.await.map_err(|_| not_running())
    }

    /// セッションを停止する
    ///
    /// チャット接続を閉じ、統計をゼロに戻してから `Stopped` を通知する。
    /// 既に停止している場合は何もしない。
    pub async fn stop(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        let channel = self.channel().clone();
        if self.shared.status().is_live() {
            self.shared.set_status(SessionStatus::Disconnecting);
            self.broadcaster.publish(TelemetryEvent::session_status(
                &channel,
                SessionStatus::Disconnecting,
            ));
        }

        let _ = self.shutdown.send(true);
        if tokio::time::timeout(STOP_GRACE_PERIOD, &mut task)
            .await
            .is_err()
        {
            warn!("⚠️ Session loop for #{} did not stop in time, aborting", channel);
            task.abort();
        }

        self.shared.update_stats(|stats| *stats = SessionStats::default());
        self.shared.set_status(SessionStatus::Stopped);

        self.broadcaster.publish(TelemetryEvent::connection_status(
            &channel,
            ConnectionState::Disconnected,
            Some("session stopped".to_string()),
        ));
        self.broadcaster.publish(TelemetryEvent::session_status(
            &channel,
            SessionStatus::Stopped,
        ));
        self.broadcaster.publish(TelemetryEvent::stats_snapshot(
            &channel,
            SessionStatus::Stopped,
            SessionStats::default(),
        ));

        info!("🛑 Moderation session stopped for #{}", channel);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// メッセージ1件分の処理
struct MessagePipeline {
    channel: ChannelName,
    shared: Arc<SessionShared>,
    deps: SessionDeps,
}

impl MessagePipeline {
    async fn process(&self, message: ChatMessage) {
        let status = self.shared.status();
        self.shared.update_stats(SessionStats::record_observed);

        if status != SessionStatus::Active {
            // 一時停止中は数えるだけで判定しない
            self.publish(TelemetryEvent::ChatEvent {
                channel: self.channel.clone(),
                message,
                verdict: None,
                actions: Vec::new(),
            });
            return;
        }

        let verdict = self.classify(&message);
        self.shared
            .update_stats(|stats| stats.record_verdict(&verdict));

        let actions = plan_actions(&message, &verdict);
        let records = if actions.is_empty() {
            Vec::new()
        } else {
            info!(
                channel = %self.channel,
                user = %message.username,
                category = ?verdict.category(),
                "🚨 Violation detected"
            );
            self.deps.executor.apply_all(actions).await
        };

        for record in &records {
            self.shared.update_stats(|stats| stats.record_action(record));
        }

        self.publish(TelemetryEvent::ChatEvent {
            channel: self.channel.clone(),
            message,
            verdict: Some(verdict),
            actions: records.clone(),
        });

        if !records.is_empty() {
            for record in records {
                self.publish(TelemetryEvent::ModerationAction(record));
            }
            self.publish_stats();
        }
    }

    /// 分類器のパニックはClean扱いにしてループを守る
    fn classify(&self, message: &ChatMessage) -> ModerationVerdict {
        let classifier = &self.deps.classifier;
        match std::panic::catch_unwind(AssertUnwindSafe(|| classifier.classify(message))) {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(
                    channel = %self.channel,
                    message_id = %message.id,
                    "⚠️ Classifier panicked, treating message as clean"
                );
                ModerationVerdict::Clean
            }
        }
    }

    async fn ban(&self, username: String, reason: String) -> ActionRecord {
        let action = ModerationAction::ban(&self.channel, &username, &reason);
        let record = self.deps.executor.apply(action).await;
        self.shared.update_stats(|stats| stats.record_action(&record));
        self.publish(TelemetryEvent::ModerationAction(record.clone()));
        self.publish_stats();
        record
    }

    fn on_connection_status(&self, state: ConnectionState, reason: Option<String>) {
        match state {
            ConnectionState::Reconnecting => {
                warn!("🔄 #{} reconnecting: {}", self.channel, reason.as_deref().unwrap_or("-"))
            }
            _ => debug!("🔌 #{} connection {:?}", self.channel, state),
        }
        self.publish(TelemetryEvent::connection_status(&self.channel, state, reason));
    }

    fn publish_stats(&self) {
        self.publish(TelemetryEvent::stats_snapshot(
            &self.channel,
            self.shared.status(),
            self.shared.stats(),
        ));
    }

    fn publish(&self, event: TelemetryEvent) {
        self.deps.broadcaster.publish(event);
    }
}

/// 受信ループ本体
///
/// シャットダウン要求が来たら処理中のアクションも打ち切って終了する。
async fn run_session_loop(
    pipeline: MessagePipeline,
    mut connection: Box<dyn ChatConnection>,
    mut shutdown: watch::Receiver<bool>,
    mut commands: mpsc::Receiver<SessionCommand>,
    stats_interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + stats_interval,
        stats_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(command) = commands.recv() => {
                let SessionCommand::Ban { username, reason, reply } = command;
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    record = pipeline.ban(username, reason) => {
                        let _ = reply.send(record);
                    }
                }
            }
            event = connection.next_event() => match event {
                Some(ConnectionEvent::Message(message)) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = pipeline.process(message) => {}
                    }
                }
                Some(ConnectionEvent::Status { state, reason }) => {
                    pipeline.on_connection_status(state, reason);
                }
                None => {
                    warn!("🔌 Chat connection for #{} ended", pipeline.channel);
                    pipeline.shared.set_status(SessionStatus::Stopped);
                    pipeline.publish(TelemetryEvent::session_status(
                        &pipeline.channel,
                        SessionStatus::Stopped,
                    ));
                    pipeline.publish_stats();
                    break;
                }
            },
            _ = ticker.tick() => pipeline.publish_stats(),
        }
    }

    connection.disconnect().await;
    debug!("👋 Session loop for #{} finished", pipeline.channel);
}
