//! チャンネル → セッションの対応表
//!
//! 外部からの start/stop を受け付ける唯一の入口。同じチャンネルに対する操作は
//! チャンネルごとのロックで直列化し、1チャンネルに稼働中のセッションが
//! 2つ以上存在しないことを保証する。

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::controller::{SessionController, SessionDeps, SessionHandle, SessionRef, SessionStatus};
use super::stats::SessionStats;
use crate::chat::Credentials;
use crate::error::SessionError;
use crate::moderation::{ActionRecord, ChannelName};
use crate::telemetry::{ObserverHandle, StatsSource, TelemetryBroadcaster, TelemetryEvent};

type SessionSlot = Arc<tokio::sync::Mutex<Option<SessionController>>>;

/// セッションの管理者
pub struct SessionRegistry {
    deps: SessionDeps,
    slots: Mutex<HashMap<ChannelName, SessionSlot>>,
    views: RwLock<HashMap<ChannelName, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            slots: Mutex::new(HashMap::new()),
            views: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, channel: &ChannelName) -> SessionSlot {
        self.slots
            .lock()
            .entry(channel.clone())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, channel: &ChannelName) -> Result<SessionSlot, SessionError> {
        self.slots
            .lock()
            .get(channel)
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                channel: channel.clone(),
            })
    }

    /// セッションを開始する
    ///
    /// 稼働中のセッションがあれば `AlreadyActive`。停止済みのセッションは新しいものに置き換える。
    pub async fn start_session(
        &self,
        channel: impl Into<ChannelName>,
        credentials: &Credentials,
    ) -> Result<SessionRef, SessionError> {
        let channel = channel.into();
        let slot = self.slot(&channel);
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.as_mut() {
            if existing.status().is_live() {
                return Err(SessionError::AlreadyActive { channel });
            }
            // 接続が切れて止まったセッションの後始末
            existing.stop().await;
        }
        *guard = None;

        match SessionController::start(channel.clone(), credentials, self.deps.clone()).await {
            Ok(controller) => {
                let reference = controller.reference().clone();
                self.views.write().insert(channel, controller.handle());
                *guard = Some(controller);
                Ok(reference)
            }
            Err(e) => {
                self.views.write().remove(&channel);
                drop(guard);
                self.release_slot(&channel, &slot);
                Err(e)
            }
        }
    }

    /// 空のスロットを対応表から外す
    ///
    /// 他の呼び出しがスロットを保持している間は残す。
    fn release_slot(&self, channel: &ChannelName, slot: &SessionSlot) {
        let mut slots = self.slots.lock();
        let unused = slots
            .get(channel)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
            && Arc::strong_count(slot) == 2
            && slot.try_lock().is_ok_and(|guard| guard.is_none());
        if unused {
            slots.remove(channel);
        }
    }

    /// セッションを停止する（停止済みなら何もしない）
    pub async fn stop_session(&self, channel: impl Into<ChannelName>) -> Result<(), SessionError> {
        let channel = channel.into();
        let slot = self.existing_slot(&channel)?;
        let mut guard = slot.lock().await;

        match guard.as_mut() {
            Some(controller) => {
                controller.stop().await;
                Ok(())
            }
            None => Err(SessionError::NotFound { channel }),
        }
    }

    pub async fn pause_session(
        &self,
        channel: impl Into<ChannelName>,
    ) -> Result<SessionStatus, SessionError> {
        let channel = channel.into();
        let slot = self.existing_slot(&channel)?;
        let guard = slot.lock().await;
        guard
            .as_ref()
            .ok_or(SessionError::NotFound { channel })?
            .pause()
    }

    pub async fn resume_session(
        &self,
        channel: impl Into<ChannelName>,
    ) -> Result<SessionStatus, SessionError> {
        let channel = channel.into();
        let slot = self.existing_slot(&channel)?;
        let guard = slot.lock().await;
        guard
            .as_ref()
            .ok_or(SessionError::NotFound { channel })?
            .resume()
    }

    /// ユーザーを手動でBANする
    pub async fn ban_user(
        &self,
        channel: impl Into<ChannelName>,
        username: &str,
        reason: &str,
    ) -> Result<ActionRecord, SessionError> {
        let channel = channel.into();
        let slot = self.existing_slot(&channel)?;
        let guard = slot.lock().await;
        let controller = guard.as_ref().ok_or_else(|| SessionError::NotFound {
            channel: channel.clone(),
        })?;

        if !controller.status().is_live() {
            return Err(SessionError::NotRunning { channel });
        }
        controller.ban_user(username, reason).await
    }

    /// 統計のコピーを返す
    pub fn get_stats(&self, channel: impl Into<ChannelName>) -> Result<SessionStats, SessionError> {
        let channel = channel.into();
        self.views
            .read()
            .get(&channel)
            .map(SessionHandle::stats)
            .ok_or(SessionError::NotFound { channel })
    }

    pub fn session_status(&self, channel: impl Into<ChannelName>) -> Option<SessionStatus> {
        self.views.read().get(&channel.into()).map(SessionHandle::status)
    }

    /// 停止していないセッションのチャンネル一覧（名前順）
    pub fn get_active_channels(&self) -> Vec<ChannelName> {
        let mut channels: Vec<ChannelName> = self
            .views
            .read()
            .iter()
            .filter(|(_, handle)| handle.status().is_live())
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// すべてのセッションを停止する
    pub async fn shutdown_all(&self) {
        let slots: Vec<SessionSlot> = self.slots.lock().values().cloned().collect();
        for slot in slots {
            if let Some(controller) = slot.lock().await.as_mut() {
                controller.stop().await;
            }
        }
        info!("🛑 All moderation sessions stopped");
    }

    /// テレメトリを購読する
    pub fn subscribe(&self) -> ObserverHandle {
        self.deps.broadcaster.subscribe()
    }

    pub fn broadcaster(&self) -> &TelemetryBroadcaster {
        &self.deps.broadcaster
    }
}

impl StatsSource for SessionRegistry {
    fn stats_snapshots(&self) -> Vec<TelemetryEvent> {
        let views = self.views.read();
        let mut channels: Vec<&ChannelName> = views
            .iter()
            .filter(|(_, handle)| handle.status().is_live())
            .map(|(channel, _)| channel)
            .collect();
        channels.sort();

        channels
            .into_iter()
            .filter_map(|channel| {
                views.get(channel).map(|handle| {
                    TelemetryEvent::stats_snapshot(channel, handle.status(), handle.stats())
                })
            })
            .collect()
    }

    fn stats_for(&self, channel: &ChannelName) -> Option<TelemetryEvent> {
        self.views
            .read()
            .get(channel)
            .map(|handle| TelemetryEvent::stats_snapshot(channel, handle.status(), handle.stats()))
    }
}
