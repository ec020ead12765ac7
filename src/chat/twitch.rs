//! Twitch IRC over WebSocket による接続

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::irc::{self, PrivMsg, ServerLine};
use super::{
    Backoff, ChatConnection, ChatConnector, ConnectionEvent, ConnectionState, Credentials,
    MessageIdGenerator,
};
use crate::config::ReconnectConfig;
use crate::error::ConnectError;
use crate::moderation::{ChannelName, ChatMessage, SenderFlags};

/// Twitch IRCのWebSocketエンドポイント
pub const DEFAULT_IRC_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

/// 接続からセッションへのイベントバッファ
const EVENT_BUFFER: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Twitchチャットへの接続ファクトリー
#[derive(Debug, Clone)]
pub struct TwitchConnector {
    url: String,
    reconnect: ReconnectConfig,
    connect_timeout: Duration,
}

impl TwitchConnector {
    pub fn new(reconnect: ReconnectConfig) -> Self {
        Self {
            url: DEFAULT_IRC_URL.to_string(),
            reconnect,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// 接続先URLを差し替える（ローカルのIRCサーバーなど）
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for TwitchConnector {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

#[async_trait]
impl ChatConnector for TwitchConnector {
    async fn connect(
        &self,
        channel: &ChannelName,
        credentials: &Credentials,
    ) -> Result<Box<dyn ChatConnection>, ConnectError> {
        let ws = handshake(&self.url, channel, credentials, self.connect_timeout).await?;
        info!("🔌 Joined Twitch chat: {}", channel.irc_name());

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = ReaderTask {
            url: self.url.clone(),
            channel: channel.clone(),
            credentials: credentials.clone(),
            connect_timeout: self.connect_timeout,
            backoff: Backoff::new(self.reconnect.clone()),
            ids: MessageIdGenerator::new(),
            tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(reader.run(ws));

        Ok(Box::new(TwitchConnection {
            rx,
            shutdown: shutdown_tx,
            task: Some(task),
        }))
    }
}

/// ログインとJOINまでを行う
async fn handshake(
    url: &str,
    channel: &ChannelName,
    credentials: &Credentials,
    connect_timeout: Duration,
) -> Result<WsStream, ConnectError> {
    let (mut ws, _) = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| ConnectError::unreachable(format!("connect to {url} timed out")))?
        .map_err(|e| ConnectError::unreachable(e.to_string()))?;

    let mut commands = irc::login_commands(
        &credentials.bot_login,
        credentials.access_token(),
        channel.as_str(),
    );
    let join = commands.pop().unwrap_or_else(|| format!("JOIN {}", channel.irc_name()));

    for command in commands {
        send_line(&mut ws, command).await?;
    }

    tokio::time::timeout(connect_timeout, wait_for_welcome(&mut ws))
        .await
        .map_err(|_| ConnectError::protocol("no welcome from chat server"))??;

    send_line(&mut ws, join).await?;
    Ok(ws)
}

async fn wait_for_welcome(ws: &mut WsStream) -> Result<(), ConnectError> {
    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| ConnectError::unreachable(e.to_string()))?;
        let Message::Text(text) = frame else {
            continue;
        };

        for line in text.lines() {
            match irc::parse_line(line) {
                Some(ServerLine::Welcome) => return Ok(()),
                Some(ServerLine::AuthFailed(reason)) => {
                    return Err(ConnectError::authentication(reason))
                }
                Some(ServerLine::Ping(payload)) => {
                    send_line(ws, format!("PONG :{payload}")).await?;
                }
                _ => {}
            }
        }
    }

    Err(ConnectError::Closed)
}

async fn send_line(ws: &mut WsStream, line: String) -> Result<(), ConnectError> {
    ws.send(Message::Text(line))
        .await
        .map_err(|e| ConnectError::unreachable(e.to_string()))
}

/// 読み取りループの終了理由
enum ReadOutcome {
    /// 再接続する
    Lost(String),
    /// 認証が無効になった
    Fatal(String),
    /// シャットダウン要求またはセッション側の終了
    Finished,
}

struct ReaderTask {
    url: String,
    channel: ChannelName,
    credentials: Credentials,
    connect_timeout: Duration,
    backoff: Backoff,
    ids: MessageIdGenerator,
    tx: mpsc::Sender<ConnectionEvent>,
    shutdown: watch::Receiver<bool>,
}

impl ReaderTask {
    async fn run(mut self, mut ws: WsStream) {
        loop {
            let reason = match self.read_until_lost(&mut ws).await {
                ReadOutcome::Finished => {
                    let _ = send_line(&mut ws, format!("PART {}", self.channel.irc_name())).await;
                    let _ = ws.close(None).await;
                    debug!("👋 Left Twitch chat: {}", self.channel.irc_name());
                    return;
                }
                ReadOutcome::Fatal(reason) => {
                    self.emit_status(ConnectionState::Disconnected, Some(reason))
                        .await;
                    return;
                }
                ReadOutcome::Lost(reason) => reason,
            };

            warn!(
                "⚠️ Lost Twitch chat connection for {}: {}",
                self.channel.irc_name(),
                reason
            );
            if !self
                .emit_status(ConnectionState::Reconnecting, Some(reason))
                .await
            {
                return;
            }

            match self.reconnect().await {
                Some(new_ws) => {
                    ws = new_ws;
                    self.backoff.reset();
                    info!("🔄 Reconnected to Twitch chat: {}", self.channel.irc_name());
                    if !self.emit_status(ConnectionState::Connected, None).await {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    async fn read_until_lost(&mut self, ws: &mut WsStream) -> ReadOutcome {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return ReadOutcome::Finished,
                frame = ws.next() => frame,
            };

            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    return ReadOutcome::Lost("connection closed by server".to_string())
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return ReadOutcome::Lost(e.to_string()),
            };

            for line in text.lines() {
                match irc::parse_line(line) {
                    Some(ServerLine::Ping(payload)) => {
                        if let Err(e) = send_line(ws, format!("PONG :{payload}")).await {
                            return ReadOutcome::Lost(e.to_string());
                        }
                    }
                    Some(ServerLine::Reconnect) => {
                        return ReadOutcome::Lost("server requested reconnect".to_string())
                    }
                    Some(ServerLine::AuthFailed(reason)) => return ReadOutcome::Fatal(reason),
                    Some(ServerLine::PrivMsg(privmsg)) => {
                        if self.credentials.is_own_message(&privmsg.username) {
                            continue;
                        }
                        let message = self.to_message(privmsg);
                        if self.tx.send(ConnectionEvent::Message(message)).await.is_err() {
                            return ReadOutcome::Finished;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// バックオフしながら再接続する。諦めた場合は `None`
    async fn reconnect(&mut self) -> Option<WsStream> {
        loop {
            let Some(delay) = self.backoff.next_delay() else {
                warn!(
                    "❌ Giving up on {} after {} reconnect attempts",
                    self.channel.irc_name(),
                    self.backoff.attempts()
                );
                self.emit_status(
                    ConnectionState::Disconnected,
                    Some("reconnect attempts exhausted".to_string()),
                )
                .await;
                return None;
            };

            debug!(
                "⏳ Reconnecting to {} in {:?} (attempt {})",
                self.channel.irc_name(),
                delay,
                self.backoff.attempts()
            );
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match handshake(
                &self.url,
                &self.channel,
                &self.credentials,
                self.connect_timeout,
            )
            .await
            {
                Ok(ws) => return Some(ws),
                Err(e) if e.is_fatal() => {
                    self.emit_status(ConnectionState::Disconnected, Some(e.to_string()))
                        .await;
                    return None;
                }
                Err(e) => warn!("⚠️ Reconnect attempt failed: {}", e),
            }
        }
    }

    /// 受信側が既にいなければ `false`
    async fn emit_status(&self, state: ConnectionState, reason: Option<String>) -> bool {
        self.tx
            .send(ConnectionEvent::status(state, reason))
            .await
            .is_ok()
    }

    fn to_message(&self, privmsg: PrivMsg) -> ChatMessage {
        let (id, platform_id) = match privmsg.id {
            Some(id) => (id, true),
            None => (self.ids.next_id(), false),
        };

        ChatMessage {
            id,
            platform_id,
            channel: self.channel.clone(),
            username: privmsg.username,
            text: privmsg.text,
            received_at: Utc::now(),
            sender: SenderFlags {
                is_moderator: privmsg.is_moderator,
                is_subscriber: privmsg.is_subscriber,
            },
            badges: privmsg.badges,
        }
    }
}

struct TwitchConnection {
    rx: mpsc::Receiver<ConnectionEvent>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl ChatConnection for TwitchConnection {
    async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }

    async fn disconnect(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .is_err()
            {
                warn!("⚠️ Chat reader did not stop in time");
            }
        }
        self.rx.close();
    }
}

impl Drop for TwitchConnection {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
