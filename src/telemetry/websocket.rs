//! テレメトリのWebSocketサーバー
//!
//! ダッシュボードは `ws://127.0.0.1:8765` に接続してイベントを受信する。
//! 接続直後に `Connected` と、稼働中チャンネルの統計スナップショットが届く。
//!
//! ## クライアントから送れるメッセージ
//!
//! ```text
//! {"type":"Ping"}
//! {"type":"GetInfo"}
//! {"type":"GetStats","channel":"streamer"}
//! ```

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;

use super::{ObserverHandle, StatsSource, TelemetryBroadcaster, TelemetryEvent};
use crate::moderation::ChannelName;

/// WebSocket接続のID
type ClientId = u64;

/// 希望ポートが使えない場合に試すポート数
const PORT_SEARCH_RANGE: u16 = 9;

/// サーバーからクライアントへのメッセージ
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// テレメトリイベント
    Telemetry(TelemetryEvent),
    /// 接続確認
    Connected { client_id: ClientId },
    /// サーバー情報
    ServerInfo {
        version: String,
        connected_clients: usize,
        active_channels: Vec<ChannelName>,
    },
    /// エラー
    Error { message: String },
}

/// クライアントからサーバーへのメッセージ
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    Ping,
    /// サーバー情報をリクエスト
    GetInfo,
    /// 指定チャンネルの統計をリクエスト
    GetStats { channel: ChannelName },
}

/// WebSocketサーバーの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running,
    Stopping,
}

type ClientMap = Arc<RwLock<HashMap<ClientId, SocketAddr>>>;

/// テレメトリのWebSocketサーバー
pub struct TelemetryServer {
    host: String,
    /// 希望ポート（開始ポート）
    preferred_port: u16,
    /// 実際に使用中のポート
    actual_port: Arc<RwLock<Option<u16>>>,
    state: Arc<RwLock<ServerState>>,
    clients: ClientMap,
    broadcaster: TelemetryBroadcaster,
    stats: Arc<dyn StatsSource>,
    next_client_id: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
}

impl TelemetryServer {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        broadcaster: TelemetryBroadcaster,
        stats: Arc<dyn StatsSource>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            host: host.into(),
            preferred_port: port,
            actual_port: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            clients: Arc::new(RwLock::new(HashMap::new())),
            broadcaster,
            stats,
            next_client_id: Arc::new(AtomicU64::new(1)),
            shutdown,
        }
    }

    /// サーバーを起動
    ///
    /// 希望ポートが使用中の場合、自動的に次のポート（最大10ポート）を試行する。
    /// 戻り値は実際にバインドしたポート。
    pub async fn start(&self) -> anyhow::Result<u16> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                tracing::warn!("Telemetry server is already in state: {:?}", *state);
                return Err(anyhow::anyhow!("Server is already running"));
            }
            let end_port = self.preferred_port.saturating_add(PORT_SEARCH_RANGE);
            let (listener, bound_port) = self.try_bind_ports(self.preferred_port, end_port).await?;
            *state = ServerState::Running;
            *self.actual_port.write().await = Some(bound_port);
            self.spawn_accept_loop(listener);

            let addr = format!("{}:{}", self.host, bound_port);
            if bound_port != self.preferred_port {
                tracing::info!(
                    "🌐 Telemetry server listening on ws://{} (preferred port {} was unavailable)",
                    addr,
                    self.preferred_port
                );
            } else {
                tracing::info!("🌐 Telemetry server listening on ws://{}", addr);
            }
            Ok(bound_port)
        }
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let state = Arc::clone(&self.state);
        let context = ConnectionContext {
            clients: Arc::clone(&self.clients),
            broadcaster: self.broadcaster.clone(),
            stats: Arc::clone(&self.stats),
            shutdown: self.shutdown.subscribe(),
        };
        let next_client_id = Arc::clone(&self.next_client_id);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    result = listener.accept() => match result {
                        Ok((stream, addr)) => {
                            let client_id = next_client_id.fetch_add(1, Ordering::SeqCst);
                            tracing::info!("📥 New observer connection from {} (client_id: {})", addr, client_id);

                            let context = context.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, client_id, context).await {
                                    tracing::warn!("Observer connection error for client {}: {}", client_id, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    },
                }
            }

            *state.write().await = ServerState::Stopped;
            tracing::info!("🛑 Telemetry server stopped");
        });
    }

    /// 指定範囲のポートを順番に試行してバインド
    async fn try_bind_ports(
        &self,
        start_port: u16,
        end_port: u16,
    ) -> anyhow::Result<(TcpListener, u16)> {
        let mut last_error = None;

        for port in start_port..=end_port {
            let addr = format!("{}:{}", self.host, port);
            tracing::debug!("Attempting to bind telemetry server to {}", addr);

            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    // ポート0の場合はOSが割り当てたポートを返す
                    let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    return Ok((listener, bound));
                }
                Err(e) => {
                    tracing::debug!("Port {} unavailable: {}", port, e);
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "No ports available")
        });
        tracing::error!(
            "❌ Failed to bind telemetry server to any port in range {}-{}: {}",
            start_port,
            end_port,
            err
        );

        Err(anyhow::anyhow!(
            "Failed to bind to any port in range {}-{}: {}",
            start_port,
            end_port,
            err
        ))
    }

    /// サーバーを停止（接続中のクライアントも切断する）
    pub async fn stop(&self) {
        tracing::info!("🛑 Stopping telemetry server...");
        {
            let mut state = self.state.write().await;
            if *state == ServerState::Running {
                *state = ServerState::Stopping;
            }
        }
        self.shutdown.send_replace(true);
        *self.actual_port.write().await = None;
    }

    /// 接続中のクライアント数を取得
    pub async fn connected_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn get_state(&self) -> ServerState {
        *self.state.read().await
    }

    pub fn preferred_port(&self) -> u16 {
        self.preferred_port
    }

    /// 実際に使用中のポート番号（未起動ならNone）
    pub async fn actual_port(&self) -> Option<u16> {
        *self.actual_port.read().await
    }
}

#[derive(Clone)]
struct ConnectionContext {
    clients: ClientMap,
    broadcaster: TelemetryBroadcaster,
    stats: Arc<dyn StatsSource>,
    shutdown: watch::Receiver<bool>,
}

/// WebSocket接続を処理
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    client_id: ClientId,
    mut context: ConnectionContext,
) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    // 挨拶より先に購読して取りこぼしを防ぐ
    let mut observer: ObserverHandle = context.broadcaster.subscribe();
    context.clients.write().await.insert(client_id, addr);

    let result = async {
        send_json(&mut write, &ServerMessage::Connected { client_id }).await?;
        for snapshot in context.stats.stats_snapshots() {
            send_json(&mut write, &ServerMessage::Telemetry(snapshot)).await?;
        }
        tracing::info!("✅ Observer {} connected from {}", client_id, addr);

        loop {
            tokio::select! {
                _ = context.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(request) = serde_json::from_str::<ClientMessage>(&text) else {
                            send_json(&mut write, &ServerMessage::Error {
                                message: format!("Unrecognized request: {}", text),
                            }).await?;
                            continue;
                        };
                        match request {
                            ClientMessage::Ping => write.send(Message::Pong(vec![])).await?,
                            ClientMessage::GetInfo => {
                                let info = ServerMessage::ServerInfo {
                                    version: env!("CARGO_PKG_VERSION").to_string(),
                                    connected_clients: context.clients.read().await.len(),
                                    active_channels: context
                                        .stats
                                        .stats_snapshots()
                                        .iter()
                                        .map(|event| event.channel().clone())
                                        .collect(),
                                };
                                send_json(&mut write, &info).await?;
                            }
                            ClientMessage::GetStats { channel } => {
                                let reply = match context.stats.stats_for(&channel) {
                                    Some(snapshot) => ServerMessage::Telemetry(snapshot),
                                    None => ServerMessage::Error {
                                        message: format!("No session for channel '{}'", channel),
                                    },
                                };
                                send_json(&mut write, &reply).await?;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("📤 Observer {} disconnected", client_id);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error for observer {}: {}", client_id, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                event = observer.recv() => match event {
                    Some(event) => send_json(&mut write, &ServerMessage::Telemetry(event)).await?,
                    None => break,
                },
            }
        }
        anyhow::Ok(())
    }
    .await;

    context.clients.write().await.remove(&client_id);
    if observer.dropped() > 0 {
        tracing::debug!(
            "Observer {} missed {} events while connected",
            client_id,
            observer.dropped()
        );
    }
    result
}

async fn send_json<S>(write: &mut S, message: &ServerMessage) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(message)?;
    write.send(Message::Text(json)).await?;
    Ok(())
}
