//! WebSocket server for the gateway
//!
//! One task per client connection. The first frame must authenticate; after
//! that a writer task drains the client's outbound queue (with a send
//! timeout and periodic pings) while the reader feeds text frames to the
//! gateway in arrival order. Whichever side stops first ends the connection,
//! and the gateway then drops the client's subscriptions and sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::{AuthError, Identity};
use super::gateway::Gateway;
use super::protocol::{ClientMessage, ServerEvent};
use crate::router::ClientId;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Reason for WebSocket disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client closed the connection normally
    ClientClosed,
    /// No frame from the client within the heartbeat timeout
    HeartbeatTimeout,
    /// Client stopped reading; a send did not finish in time
    SendTimeout,
    NetworkError(String),
    /// Gateway dropped the client (shutdown or explicit disconnect)
    Dropped,
}

impl DisconnectReason {
    pub fn description(&self) -> String {
        match self {
            DisconnectReason::ClientClosed => "client closed connection".to_string(),
            DisconnectReason::HeartbeatTimeout => "heartbeat timeout".to_string(),
            DisconnectReason::SendTimeout => "send timeout".to_string(),
            DisconnectReason::NetworkError(e) => format!("network error: {}", e),
            DisconnectReason::Dropped => "dropped by gateway".to_string(),
        }
    }
}

/// Liveness of one connection
struct ConnectionState {
    /// Last frame received (unix millis)
    last_seen: AtomicU64,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            last_seen: AtomicU64::new(unix_millis()),
        }
    }

    fn touch(&self) {
        self.last_seen.store(unix_millis(), Ordering::SeqCst);
    }

    fn silent_for(&self) -> Duration {
        Duration::from_millis(unix_millis().saturating_sub(self.last_seen.load(Ordering::SeqCst)))
    }
}

pub struct GatewayServer {
    gateway: Arc<Gateway>,
    listener: TcpListener,
}

impl GatewayServer {
    /// Bind to the configured address
    pub async fn bind(gateway: Arc<Gateway>) -> Result<Self, String> {
        let addr = gateway.config().bind_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind gateway on {}: {}", addr, e))?;
        Ok(Self { gateway, listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, String> {
        self.listener
            .local_addr()
            .map_err(|e| format!("Failed to get local address: {}", e))
    }

    /// Accept connections until the gateway shuts down
    pub async fn run(self) {
        let shutdown = self.gateway.shutdown_token();
        if let Ok(addr) = self.local_addr() {
            info!("Gateway listening on ws://{}", addr);
        }

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    // Disable Nagle's algorithm for low-latency interactive terminal
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    debug!("TCP connection from {}", addr);
                    let gateway = self.gateway.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(gateway, stream).await {
                            warn!("Gateway connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept gateway connection: {}", e);
                }
            }
        }

        info!("Gateway server stopped");
    }
}

/// Wait for `{"type":"auth","token":...}` as the first frame
async fn authenticate(gateway: &Gateway, ws_receiver: &mut WsSource) -> Result<Identity, AuthError> {
    let timeout = Duration::from_secs(gateway.config().auth_timeout_secs);
    let text = match tokio::time::timeout(timeout, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Binary(data)))) => String::from_utf8_lossy(&data).into_owned(),
        Ok(Some(Ok(other))) => return Err(AuthError::ExpectedAuth(format!("{} frame", frame_kind(&other)))),
        Ok(Some(Err(_))) | Ok(None) => return Err(AuthError::Closed),
        Err(_) => return Err(AuthError::Timeout),
    };

    match serde_json::from_str::<ClientMessage>(&text) {
        Ok(ClientMessage::Auth { token }) => gateway.authenticate(&token).await,
        Ok(other) => Err(AuthError::ExpectedAuth(other.kind().to_string())),
        Err(_) => Err(AuthError::ExpectedAuth("malformed message".to_string())),
    }
}

fn frame_kind(msg: &Message) -> &'static str {
    match msg {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    }
}

/// Serve one client from handshake to disconnect
async fn handle_connection(gateway: Arc<Gateway>, stream: TcpStream) -> Result<(), String> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let identity = match authenticate(&gateway, &mut ws_receiver).await {
        Ok(identity) => identity,
        Err(e) => {
            let event = ServerEvent::error(e.code(), e.to_string());
            if let Ok(json) = event.to_json() {
                let _ = ws_sender.send(Message::Text(json)).await;
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return Err(format!("Authentication failed: {}", e));
        }
    };

    let conn = gateway.connect_client(identity);
    let client_id = conn.client_id.clone();
    let state = Arc::new(ConnectionState::new());

    let writer = tokio::spawn(write_loop(
        gateway.clone(),
        ws_sender,
        conn.events,
        conn.cancel.clone(),
        state.clone(),
    ));
    let reader = tokio::spawn(read_loop(
        gateway.clone(),
        client_id.clone(),
        ws_receiver,
        conn.cancel.clone(),
        state,
    ));
    let writer_abort = writer.abort_handle();
    let reader_abort = reader.abort_handle();

    // Wait for either side to finish
    let reason = tokio::select! {
        reason = writer => reason.unwrap_or_else(|e| DisconnectReason::NetworkError(e.to_string())),
        reason = reader => reason.unwrap_or_else(|e| DisconnectReason::NetworkError(e.to_string())),
    };
    writer_abort.abort();
    reader_abort.abort();

    gateway.disconnect_client(&client_id, &reason.description());
    Ok(())
}

/// Drain the outbound queue into the socket; ping on the heartbeat interval
async fn write_loop(
    gateway: Arc<Gateway>,
    mut ws_sender: WsSink,
    mut events: mpsc::Receiver<ServerEvent>,
    cancel: CancellationToken,
    state: Arc<ConnectionState>,
) -> DisconnectReason {
    let config = gateway.config();
    let send_timeout = Duration::from_secs(config.send_timeout_secs.max(1));
    let heartbeat_timeout = Duration::from_secs(config.heartbeat_timeout_secs.max(1));
    let mut heartbeat = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let reason = loop {
        let msg = tokio::select! {
            event = events.recv() => match event {
                Some(event) => match event.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        error!("Failed to serialize gateway event: {}", e);
                        continue;
                    }
                },
                None => break DisconnectReason::Dropped,
            },
            _ = heartbeat.tick() => {
                let silent = state.silent_for();
                if silent > heartbeat_timeout {
                    warn!("Gateway client silent for {}s, disconnecting", silent.as_secs());
                    break DisconnectReason::HeartbeatTimeout;
                }
                Message::Ping(Vec::new())
            }
            _ = cancel.cancelled() => break DisconnectReason::Dropped,
        };

        // Use timeout to detect dead clients
        match tokio::time::timeout(send_timeout, ws_sender.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => break DisconnectReason::NetworkError(e.to_string()),
            Err(_) => {
                warn!(
                    "WebSocket send timeout after {}s - client unresponsive, disconnecting",
                    send_timeout.as_secs()
                );
                break DisconnectReason::SendTimeout;
            }
        }
    };

    let _ = tokio::time::timeout(send_timeout, ws_sender.send(Message::Close(None))).await;
    debug!("Gateway writer stopped: {:?}", reason);
    reason
}

/// Feed inbound text frames to the gateway in order. Host-bound requests
/// return as soon as they are started, so pongs keep being read.
async fn read_loop(
    gateway: Arc<Gateway>,
    client_id: ClientId,
    mut ws_receiver: WsSource,
    cancel: CancellationToken,
    state: Arc<ConnectionState>,
) -> DisconnectReason {
    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = cancel.cancelled() => return DisconnectReason::Dropped,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                state.touch();
                gateway.handle_text(&client_id, &text).await;
            }
            Some(Ok(Message::Binary(data))) => {
                state.touch();
                gateway.handle_text(&client_id, &String::from_utf8_lossy(&data)).await;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                state.touch();
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("Gateway client {} closed the connection", client_id);
                return DisconnectReason::ClientClosed;
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                warn!("WebSocket receive error for client {}: {}", client_id, e);
                return DisconnectReason::NetworkError(e.to_string());
            }
        }
    }
}
