//! プロセス内で完結するチャット接続
//!
//! テストやリプレイで使う。`ChatFeed` から送ったメッセージがそのまま
//! 接続のイベントとして流れる。

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ChatConnection, ChatConnector, ConnectionEvent, ConnectionState, Credentials,
    MessageIdGenerator,
};
use crate::error::ConnectError;
use crate::moderation::{ChannelName, ChatMessage, SenderFlags};

/// フィードに投入する1行分の入力
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InboundChat {
    pub username: String,
    pub text: String,
    /// プラットフォームが付与したID（なければ採番される）
    pub platform_id: Option<String>,
    pub sender: SenderFlags,
    pub badges: BTreeSet<String>,
}

impl InboundChat {
    pub fn new(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.platform_id = Some(id.into());
        self
    }

    pub fn moderator(mut self) -> Self {
        self.sender.is_moderator = true;
        self.badges.insert("moderator".to_string());
        self
    }

    pub fn subscriber(mut self) -> Self {
        self.sender.is_subscriber = true;
        self.badges.insert("subscriber".to_string());
        self
    }

    pub fn with_badge(mut self, badge: impl Into<String>) -> Self {
        self.badges.insert(badge.into());
        self
    }
}

#[derive(Debug)]
enum FeedItem {
    Chat(InboundChat),
    Drop(String),
    Close,
}

struct FeedSlot {
    tx: mpsc::UnboundedSender<FeedItem>,
    rx: Option<mpsc::UnboundedReceiver<FeedItem>>,
}

impl FeedSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct ConnectorState {
    feeds: HashMap<ChannelName, FeedSlot>,
    rejected: HashSet<ChannelName>,
}

/// メモリ上のチャット接続ファクトリー
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    open: Arc<AtomicUsize>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// チャンネルへの入力口を取得する
    ///
    /// 接続前に送ったメッセージは次の接続でまとめて受信される。
    pub fn feed(&self, channel: impl Into<ChannelName>) -> ChatFeed {
        let channel = channel.into();
        self.state
            .lock()
            .feeds
            .entry(channel.clone())
            .or_insert_with(FeedSlot::new);
        ChatFeed {
            channel,
            state: self.state.clone(),
        }
    }

    /// 以後このチャンネルへの接続を認証エラーにする
    pub fn reject(&self, channel: impl Into<ChannelName>) {
        self.state.lock().rejected.insert(channel.into());
    }

    /// 現在開いている接続の数
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatConnector for InMemoryConnector {
    async fn connect(
        &self,
        channel: &ChannelName,
        credentials: &Credentials,
    ) -> Result<Box<dyn ChatConnection>, ConnectError> {
        let rx = {
            let mut state = self.state.lock();
            if state.rejected.contains(channel) {
                return Err(ConnectError::authentication(format!(
                    "credentials rejected for #{channel}"
                )));
            }

            let slot = state
                .feeds
                .entry(channel.clone())
                .or_insert_with(FeedSlot::new);
            match slot.rx.take() {
                Some(rx) => rx,
                None => {
                    // 前回の接続が受信側を持っていったので作り直す
                    *slot = FeedSlot::new();
                    slot.rx.take().ok_or(ConnectError::Closed)?
                }
            }
        };

        self.open.fetch_add(1, Ordering::SeqCst);
        debug!("🔌 In-memory connection opened for #{}", channel);

        Ok(Box::new(MemoryConnection {
            channel: channel.clone(),
            credentials: credentials.clone(),
            rx,
            ids: MessageIdGenerator::new(),
            pending: VecDeque::new(),
            closed: false,
            open: self.open.clone(),
        }))
    }
}

/// チャンネルへの入力口
#[derive(Clone)]
pub struct ChatFeed {
    channel: ChannelName,
    state: Arc<Mutex<ConnectorState>>,
}

impl ChatFeed {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// 通常の視聴者としてメッセージを送る
    pub fn send_message(&self, username: &str, text: &str) -> bool {
        self.send(InboundChat::new(username, text))
    }

    pub fn send(&self, chat: InboundChat) -> bool {
        self.push(FeedItem::Chat(chat))
    }

    /// 一時的な切断を発生させる（Reconnecting → Connected が流れる）
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.push(FeedItem::Drop(reason.to_string()))
    }

    /// 接続を恒久的に終了させる
    pub fn close(&self) -> bool {
        self.push(FeedItem::Close)
    }

    fn push(&self, item: FeedItem) -> bool {
        let mut state = self.state.lock();
        let slot = state
            .feeds
            .entry(self.channel.clone())
            .or_insert_with(FeedSlot::new);
        slot.tx.send(item).is_ok()
    }
}

struct MemoryConnection {
    channel: ChannelName,
    credentials: Credentials,
    rx: mpsc::UnboundedReceiver<FeedItem>,
    ids: MessageIdGenerator,
    pending: VecDeque<ConnectionEvent>,
    closed: bool,
    open: Arc<AtomicUsize>,
}

impl MemoryConnection {
    fn to_message(&self, chat: InboundChat) -> ChatMessage {
        let (id, platform_id) = match chat.platform_id {
            Some(id) => (id, true),
            None => (self.ids.next_id(), false),
        };

        ChatMessage {
            id,
            platform_id,
            channel: self.channel.clone(),
            username: chat.username.to_lowercase(),
            text: chat.text,
            received_at: Utc::now(),
            sender: chat.sender,
            badges: chat.badges,
        }
    }
}

#[async_trait]
impl ChatConnection for MemoryConnection {
    async fn next_event(&mut self) -> Option<ConnectionEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if self.closed {
            return None;
        }

        loop {
            match self.rx.recv().await? {
                FeedItem::Chat(chat) => {
                    if self.credentials.is_own_message(&chat.username) {
                        continue;
                    }
                    return Some(ConnectionEvent::Message(self.to_message(chat)));
                }
                FeedItem::Drop(reason) => {
                    self.pending
                        .push_back(ConnectionEvent::status(ConnectionState::Connected, None));
                    return Some(ConnectionEvent::status(
                        ConnectionState::Reconnecting,
                        Some(reason),
                    ));
                }
                FeedItem::Close => {
                    self.closed = true;
                    return Some(ConnectionEvent::status(
                        ConnectionState::Disconnected,
                        Some("connection closed by peer".to_string()),
                    ));
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.rx.close();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials::new("citadel_bot", "token")
    }

    async fn next_message(connection: &mut Box<dyn ChatConnection>) -> ChatMessage {
        match connection.next_event().await {
            Some(ConnectionEvent::Message(message)) => message,
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_messages_flow_in_order() {
        let connector = InMemoryConnector::new();
        let feed = connector.feed("streamer");
        let channel = ChannelName::new("streamer");

        feed.send_message("alice", "first");
        let mut connection = connector.connect(&channel, &credentials()).await.unwrap();
        feed.send_message("Bob", "second");

        let first = next_message(&mut connection).await;
        let second = next_message(&mut connection).await;
        assert_eq!(first.text, "first");
        assert_eq!(second.username, "bob");
        assert_eq!(second.channel, channel);
        assert!(!first.platform_id);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_own_messages_are_filtered() {
        let connector = InMemoryConnector::new();
        let feed = connector.feed("streamer");
        let mut connection = connector
            .connect(&ChannelName::new("streamer"), &credentials())
            .await
            .unwrap();

        feed.send_message("Citadel_Bot", "I am the bot");
        feed.send(InboundChat::new("viewer", "hi").with_id("platform-1"));

        let message = next_message(&mut connection).await;
        assert_eq!(message.username, "viewer");
        assert_eq!(message.deletable_id(), Some("platform-1"));
    }

    #[tokio::test]
    async fn test_drop_and_close_events() {
        let connector = InMemoryConnector::new();
        let feed = connector.feed("streamer");
        let mut connection = connector
            .connect(&ChannelName::new("streamer"), &credentials())
            .await
            .unwrap();

        feed.drop_connection("network blip");
        feed.close();

        assert_eq!(
            connection.next_event().await,
            Some(ConnectionEvent::status(
                ConnectionState::Reconnecting,
                Some("network blip".to_string())
            ))
        );
        assert_eq!(
            connection.next_event().await,
            Some(ConnectionEvent::status(ConnectionState::Connected, None))
        );
        assert!(matches!(
            connection.next_event().await,
            Some(ConnectionEvent::Status {
                state: ConnectionState::Disconnected,
                ..
            })
        ));
        assert_eq!(connection.next_event().await, None);
    }

    #[tokio::test]
    async fn test_rejected_channel_fails_with_authentication() {
        let connector = InMemoryConnector::new();
        connector.reject("#Locked");

        let result = connector
            .connect(&ChannelName::new("locked"), &credentials())
            .await;
        match result {
            Err(err) => assert!(err.is_fatal()),
            Ok(_) => panic!("expected connect to fail"),
        }
        assert_eq!(connector.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_open_connection_count_and_reconnect() {
        let connector = InMemoryConnector::new();
        let feed = connector.feed("streamer");
        let channel = ChannelName::new("streamer");

        let mut first = connector.connect(&channel, &credentials()).await.unwrap();
        assert_eq!(connector.open_connections(), 1);
        first.disconnect().await;
        drop(first);
        assert_eq!(connector.open_connections(), 0);

        let mut second = connector.connect(&channel, &credentials()).await.unwrap();
        assert!(feed.send_message("viewer", "again"));
        assert_eq!(next_message(&mut second).await.text, "again");
    }
}
