//! WebSocket配信サーバー
//!
//! 表示クライアントにチャットイベントとセッション状態をリアルタイムで送る。
//!
//! ## 使用方法
//!
//! ```ignore
//! let server = WebSocketServer::new(config.server.clone(), hub, store);
//! let port = server.start().await?;
//! // ...
//! server.stop();
//! ```
//!
//! ## WebSocket API
//!
//! クライアントは `ws://127.0.0.1:8765/?since=<sequence>` に接続する。
//! `since` を付けるとそのシーケンスより後の保存済みイベントを再送し、
//! 付けなければ直近のイベントを送ってからライブ配信に移る。
//! メッセージはJSON `{"type": ..., "data": ...}` 形式。

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::database::PersistenceManager;
use crate::hub::{ClientId, DistributionHub, HubMessage, OutboundEvent, StatusEvent};
use crate::settings::OverlaySettings;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// サーバーからクライアントへのメッセージ
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// 接続確認
    #[serde(rename_all = "camelCase")]
    Connected {
        client_id: ClientId,
        replay_from: Option<i64>,
    },
    /// チャットイベント（1件ずつ）
    Chat(OutboundEvent),
    /// セッション状態
    Status(StatusEvent),
    /// オーバーレイ設定（正規化済み）
    Settings(OverlaySettings),
    /// サーバー情報
    #[serde(rename_all = "camelCase")]
    ServerInfo {
        version: String,
        connected_clients: usize,
    },
    /// エラー
    Error { message: String },
}

/// クライアントからサーバーへのメッセージ
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Ping,
    /// サーバー情報をリクエスト
    GetInfo,
}

/// WebSocketサーバーの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
}

/// `?since=<sequence>` を取り出す
pub fn parse_replay_cursor(query: Option<&str>) -> Option<i64> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "since")
        .and_then(|(_, value)| value.parse::<i64>().ok())
        .filter(|sequence| *sequence >= 0)
}

/// WebSocketサーバー
pub struct WebSocketServer {
    config: ServerConfig,
    hub: Arc<DistributionHub>,
    store: PersistenceManager,
    /// 実際に使用中のポート
    actual_port: RwLock<Option<u16>>,
    state: RwLock<ServerState>,
    shutdown: Mutex<CancellationToken>,
}

impl WebSocketServer {
    pub fn new(config: ServerConfig, hub: Arc<DistributionHub>, store: PersistenceManager) -> Self {
        Self {
            config,
            hub,
            store,
            actual_port: RwLock::new(None),
            state: RwLock::new(ServerState::Stopped),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// サーバーを起動し、バインドしたポートを返す
    ///
    /// 希望ポートが使用中の場合、設定された数だけ次のポートを試行する。
    pub async fn start(&self) -> anyhow::Result<u16> {
        {
            let mut state = self.state.write();
            if *state != ServerState::Stopped {
                tracing::warn!("WebSocket server is already in state: {:?}", *state);
                return Err(anyhow::anyhow!("Server is already running or starting"));
            }
            *state = ServerState::Starting;
        }

        let preferred = self.config.port;
        let last = preferred.saturating_add(self.config.port_search_span.saturating_sub(1));
        let (listener, bound_port) = match try_bind_ports(preferred, last).await {
            Ok(bound) => bound,
            Err(e) => {
                *self.state.write() = ServerState::Stopped;
                return Err(e);
            }
        };

        *self.actual_port.write() = Some(bound_port);

        let addr = format!("127.0.0.1:{}", bound_port);
        if bound_port != preferred {
            tracing::info!(
                "🌐 WebSocket server listening on ws://{} (preferred port {} was unavailable)",
                addr,
                preferred
            );
        } else {
            tracing::info!("🌐 WebSocket server listening on ws://{}", addr);
        }

        let shutdown = CancellationToken::new();
        *self.shutdown.lock() = shutdown.clone();
        *self.state.write() = ServerState::Running;

        let hub = Arc::clone(&self.hub);
        let store = self.store.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::debug!("📥 New WebSocket connection from {}", addr);
                                let conn = Connection {
                                    hub: Arc::clone(&hub),
                                    store: store.clone(),
                                    config: config.clone(),
                                    shutdown: shutdown.clone(),
                                };
                                tokio::spawn(async move {
                                    if let Err(e) = conn.handle(stream, addr).await {
                                        tracing::warn!("WebSocket connection error for {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                }
            }
            tracing::info!("🛑 WebSocket server stopped");
        });

        Ok(bound_port)
    }

    /// サーバーを停止し、全クライアントを切断
    pub fn stop(&self) {
        tracing::info!("🛑 Stopping WebSocket server...");
        self.shutdown.lock().cancel();
        *self.actual_port.write() = None;
        self.hub.disconnect_all();
        *self.state.write() = ServerState::Stopped;
    }

    pub fn connected_clients(&self) -> usize {
        self.hub.client_count()
    }

    pub fn get_state(&self) -> ServerState {
        *self.state.read()
    }

    pub fn preferred_port(&self) -> u16 {
        self.config.port
    }

    /// 実際に使用中のポート番号（停止中はNone）
    pub fn actual_port(&self) -> Option<u16> {
        *self.actual_port.read()
    }
}

/// 指定範囲のポートを順番に試行してバインド
async fn try_bind_ports(start_port: u16, end_port: u16) -> anyhow::Result<(TcpListener, u16)> {
    let mut last_error = None;

    for port in start_port..=end_port {
        let addr = format!("127.0.0.1:{}", port);
        tracing::debug!("Attempting to bind WebSocket server to {}", addr);

        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                // ポート0の場合はOSが割り当てたポートを使う
                let bound = listener.local_addr()?.port();
                return Ok((listener, bound));
            }
            Err(e) => {
                tracing::debug!("Port {} unavailable: {}", port, e);
                last_error = Some(e);
            }
        }
    }

    let err = last_error
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrInUse, "No ports available"));
    tracing::error!(
        "❌ Failed to bind WebSocket server to any port in range {}-{}: {}",
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

/// 1接続分のハンドラ
struct Connection {
    hub: Arc<DistributionHub>,
    store: PersistenceManager,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl Connection {
    async fn handle(self, stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        let mut replay_cursor = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                replay_cursor = parse_replay_cursor(request.uri().query());
                Ok(response)
            },
        )
        .await?;
        let (mut write, mut read) = ws_stream.split();

        // 再送より先に登録し、その間のライブイベントを取りこぼさない
        let mut client = self.hub.register(replay_cursor);
        let client_id = client.id;
        tracing::info!(
            "✅ Client {} connected from {} (since: {:?})",
            client_id,
            addr,
            replay_cursor
        );

        let result = async {
            send_json(
                &mut write,
                &ServerMessage::Connected {
                    client_id,
                    replay_from: replay_cursor,
                },
            )
            .await?;
            send_json(&mut write, &ServerMessage::Settings(self.hub.latest_settings())).await?;

            let mut last_sequence = self.replay(&mut write, replay_cursor).await?;

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,

                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                self.handle_client_message(&mut write, &text).await?;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                write.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!("📤 Client {} disconnected", client_id);
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::warn!("WebSocket error for client {}: {}", client_id, e);
                                break;
                            }
                            _ => {}
                        }
                    }

                    msg = client.receiver.recv() => {
                        match msg {
                            Some(HubMessage::Events(batch)) => {
                                for event in batch.iter() {
                                    // 再送済みのものは飛ばす
                                    if event.sequence <= last_sequence {
                                        continue;
                                    }
                                    send_json(&mut write, &ServerMessage::Chat(event.clone())).await?;
                                    last_sequence = event.sequence;
                                }
                            }
                            Some(HubMessage::Status(status)) => {
                                send_json(&mut write, &ServerMessage::Status(status)).await?;
                            }
                            Some(HubMessage::Settings(settings)) => {
                                send_json(&mut write, &ServerMessage::Settings(settings)).await?;
                            }
                            None => {
                                // ハブから切り離された
                                tracing::debug!("Client {} detached by hub", client_id);
                                break;
                            }
                        }
                    }
                }
            }
            let _ = write.close().await;
            anyhow::Ok(())
        }
        .await;

        self.hub.unregister(client_id);
        result
    }

    /// 保存済みイベントを再送し、最後に送ったシーケンスを返す
    async fn replay(&self, write: &mut WsSink, cursor: Option<i64>) -> anyhow::Result<i64> {
        let backlog = match cursor {
            Some(since) => self.store.events_since(since, self.config.max_replay).await,
            None => self.store.recent_events(self.config.initial_replay).await,
        };

        let mut last_sequence = cursor.unwrap_or(0);
        match backlog {
            Ok(events) => {
                if !events.is_empty() {
                    tracing::debug!("⏪ Replaying {} events", events.len());
                }
                for stored in &events {
                    send_json(write, &ServerMessage::Chat(OutboundEvent::from(stored))).await?;
                    last_sequence = last_sequence.max(stored.sequence);
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ Failed to load replay backlog: {}", e);
                send_json(
                    write,
                    &ServerMessage::Error {
                        message: format!("replay unavailable: {}", e),
                    },
                )
                .await?;
            }
        }
        Ok(last_sequence)
    }

    async fn handle_client_message(&self, write: &mut WsSink, text: &str) -> anyhow::Result<()> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Ping) => {
                write.send(Message::Pong(Vec::new())).await?;
            }
            Ok(ClientMessage::GetInfo) => {
                let info = ServerMessage::ServerInfo {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    connected_clients: self.hub.client_count(),
                };
                send_json(write, &info).await?;
            }
            Err(e) => {
                send_json(
                    write,
                    &ServerMessage::Error {
                        message: format!("unrecognized message: {}", e),
                    },
                )
                .await?;
            }
        }
        Ok(())
    }
}

async fn send_json(write: &mut WsSink, message: &ServerMessage) -> anyhow::Result<()> {
    let json = serde_json::to_string(message)?;
    write.send(Message::Text(json)).await?;
    Ok(())
}
