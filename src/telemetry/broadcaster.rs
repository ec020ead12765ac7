//! テレメトリのブロードキャスト
//!
//! `tokio::sync::broadcast` を使い、オブザーバーごとに独立したバッファで配信する。
//! 遅いオブザーバーは自分の古いイベントを失うだけで、送信側や他のオブザーバーを待たせない。

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use super::events::TelemetryEvent;

/// オブザーバーごとのデフォルトバッファサイズ
pub const DEFAULT_CAPACITY: usize = 256;

/// テレメトリのブロードキャスター
#[derive(Debug, Clone)]
pub struct TelemetryBroadcaster {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 新しいオブザーバーを登録
    ///
    /// 登録後に発行されたイベントだけを受け取る。
    pub fn subscribe(&self) -> ObserverHandle {
        debug!(
            "👀 Observer subscribed ({} total)",
            self.sender.receiver_count() + 1
        );
        ObserverHandle {
            receiver: self.sender.subscribe(),
            dropped: 0,
        }
    }

    /// すべてのオブザーバーへイベントを配信する
    ///
    /// ブロックしない。戻り値は配信先の数。
    pub fn publish(&self, event: TelemetryEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for TelemetryBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// 1オブザーバー分の受信口
///
/// ドロップすると購読が解除される。
#[derive(Debug)]
pub struct ObserverHandle {
    receiver: broadcast::Receiver<TelemetryEvent>,
    dropped: u64,
}

impl ObserverHandle {
    /// 次のイベントを待つ。ブロードキャスターが破棄されたら `None`
    pub async fn recv(&mut self) -> Option<TelemetryEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 待たずに取り出す
    pub fn try_recv(&mut self) -> Option<TelemetryEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(_) => return None,
            }
        }
    }

    /// バッファ溢れで失ったイベント数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// `Stream` として扱う（取りこぼしは読み飛ばす）
    pub fn into_stream(self) -> impl Stream<Item = TelemetryEvent> {
        BroadcastStream::new(self.receiver).filter_map(|item| item.ok())
    }

    fn record_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        warn!("🐢 Slow observer skipped {} telemetry events", skipped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ConnectionState;
    use crate::moderation::ChannelName;
    use std::time::Duration;

    fn event(n: usize) -> TelemetryEvent {
        TelemetryEvent::connection_status(
            &ChannelName::new(format!("channel{n}")),
            ConnectionState::Connected,
            None,
        )
    }

    #[tokio::test]
    async fn test_broadcaster_creation() {
        let broadcaster = TelemetryBroadcaster::default();
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(broadcaster.publish(event(0)), 0);
    }

    #[tokio::test]
    async fn test_all_observers_receive() {
        let broadcaster = TelemetryBroadcaster::default();
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        assert_eq!(broadcaster.publish(event(1)), 2);

        assert_eq!(first.recv().await, Some(event(1)));
        assert_eq!(second.recv().await, Some(event(1)));
    }

    #[tokio::test]
    async fn test_slow_observer_does_not_block_healthy_one() {
        let broadcaster = TelemetryBroadcaster::new(4);
        let mut stalled = broadcaster.subscribe();
        let mut healthy = broadcaster.subscribe();

        for n in 0..20 {
            broadcaster.publish(event(n));
            let received = tokio::time::timeout(Duration::from_millis(100), healthy.recv())
                .await
                .expect("healthy observer should not wait");
            assert_eq!(received, Some(event(n)));
        }
        assert_eq!(healthy.dropped(), 0);

        // 詰まっていたオブザーバーは古いイベントを失い、最新側から読み直す
        let next = stalled.recv().await;
        assert_eq!(next, Some(event(16)));
        assert_eq!(stalled.dropped(), 16);
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let broadcaster = TelemetryBroadcaster::default();
        let observer = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(observer);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_try_recv_and_stream() {
        let broadcaster = TelemetryBroadcaster::default();
        let mut observer = broadcaster.subscribe();
        assert_eq!(observer.try_recv(), None);

        broadcaster.publish(event(1));
        assert_eq!(observer.try_recv(), Some(event(1)));

        let stream = broadcaster.subscribe().into_stream();
        broadcaster.publish(event(2));
        drop(broadcaster);

        let collected: Vec<TelemetryEvent> = stream.collect().await;
        assert_eq!(collected, vec![event(2)]);
    }
}
