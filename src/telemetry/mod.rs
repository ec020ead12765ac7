//! テレメトリ配信
//!
//! チャットイベント・モデレーション結果・統計・接続状態をオブザーバーへ流す。

pub mod broadcaster;
pub mod events;
pub mod websocket;

use crate::moderation::ChannelName;

pub use broadcaster::{ObserverHandle, TelemetryBroadcaster};
pub use events::TelemetryEvent;
pub use websocket::{ClientMessage, ServerMessage, ServerState, TelemetryServer};

/// 統計スナップショットの取得元
///
/// 新しいオブザーバーへの初回送信と、個別の問い合わせに使う。
pub trait StatsSource: Send + Sync {
    /// 稼働中の全チャンネルのスナップショット（チャンネル名順）
    fn stats_snapshots(&self) -> Vec<TelemetryEvent>;

    /// 指定チャンネルのスナップショット
    fn stats_for(&self, channel: &ChannelName) -> Option<TelemetryEvent>;
}
