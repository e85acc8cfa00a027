//! Gateway core
//!
//! The socket-free half of the real-time endpoint. Each authenticated
//! client gets an id, a bounded outbound queue and a subscription set;
//! `handle_message` routes its control messages, and the fan-out tasks push
//! monitoring snapshots and session lifecycle events to matching clients.
//!
//! `ssh_connect` and `container_action` wait on a remote host, so frames
//! carrying them are handled on their own task (at most
//! `max_pending_requests` per client) and never hold up later keystrokes.
//!
//! Terminal output is queued with `send().await` so a slow client slows its
//! own terminals down; monitoring updates use `try_send` and are dropped for
//! a full queue, the next poll carries fresher data anyway.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::{AuthError, Authenticator, Identity};
use super::protocol::{topic_of, ClientMessage, ServerEvent};
use crate::container::{ContainerAction, ContainerControl, ContainerError};
use crate::error::ErrorCode;
use crate::monitor::{MonitoringAggregator, MonitoringSnapshot};
use crate::router::{ClientId, SubscriptionRegistry, Topic, TopicKind};
use crate::session::{SessionError, SessionEvent, SessionId, SessionManager, TerminalEvent, TerminalStreamer};
use crate::ssh::HostId;

/// Reason recorded when a client closes its own session
pub const CLOSED_BY_CLIENT: &str = "closed by client";

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// token -> user name, for the built-in authenticator
    #[serde(default)]
    pub tokens: HashMap<String, String>,

    /// Events buffered per client before backpressure / dropping
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// `ssh_connect` / `container_action` requests in flight per client
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:7681".to_string()
}

fn default_outbound_queue() -> usize {
    1024
}

fn default_send_timeout_secs() -> u64 {
    5
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    90
}

fn default_max_pending_requests() -> usize {
    16
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            tokens: HashMap::new(),
            outbound_queue: default_outbound_queue(),
            send_timeout_secs: default_send_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            max_pending_requests: default_max_pending_requests(),
        }
    }
}

/// Why a control message was rejected; sent back as `error{code, message}`
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Too many requests in flight (max {0})")]
    Busy(usize),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::BadRequest(_) => ErrorCode::BadRequest,
            GatewayError::Busy(_) => ErrorCode::Capacity,
            GatewayError::Session(e) => e.code(),
            GatewayError::Container(e) => e.code(),
        }
    }

    fn into_event(self) -> ServerEvent {
        ServerEvent::error(self.code(), self.to_string())
    }
}

struct ClientEntry {
    user: String,
    tx: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
    /// Permits for host-bound requests running off the read path
    pending: Arc<Semaphore>,
}

/// A registered client as seen by its socket task
pub struct ClientConnection {
    pub client_id: ClientId,
    pub user: String,
    /// Outbound events, `auth_ok` first
    pub events: mpsc::Receiver<ServerEvent>,
    /// Cancelled when the gateway drops the client
    pub cancel: CancellationToken,
}

pub struct Gateway {
    config: GatewayConfig,
    sessions: Arc<SessionManager>,
    terminals: Arc<TerminalStreamer>,
    monitor: Arc<MonitoringAggregator>,
    subscriptions: Arc<SubscriptionRegistry>,
    containers: Arc<dyn ContainerControl>,
    authenticator: Arc<dyn Authenticator>,
    clients: DashMap<ClientId, ClientEntry>,
    /// Sessions whose terminal output is forwarded to their owner
    streams: DashMap<SessionId, ClientId>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        sessions: Arc<SessionManager>,
        terminals: Arc<TerminalStreamer>,
        monitor: Arc<MonitoringAggregator>,
        subscriptions: Arc<SubscriptionRegistry>,
        containers: Arc<dyn ContainerControl>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions,
            terminals,
            monitor,
            subscriptions,
            containers,
            authenticator,
            clients: DashMap::new(),
            streams: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        self.authenticator.authenticate(token).await
    }

    // ─── Client lifecycle ────────────────────────────────────────────────

    /// Register an authenticated client; `auth_ok` is already queued
    pub fn connect_client(&self, identity: Identity) -> ClientConnection {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (tx, events) = mpsc::channel(self.config.outbound_queue.max(1));
        let cancel = self.shutdown.child_token();

        let _ = tx.try_send(ServerEvent::AuthOk {
            client_id: client_id.clone(),
            user: identity.user.clone(),
        });
        self.subscriptions.register_client(&client_id);
        self.clients.insert(
            client_id.clone(),
            ClientEntry {
                user: identity.user.clone(),
                tx,
                cancel: cancel.clone(),
                pending: Arc::new(Semaphore::new(self.config.max_pending_requests.max(1))),
            },
        );
        info!("Gateway client {} connected as {}", client_id, identity.user);

        ClientConnection {
            client_id,
            user: identity.user,
            events,
            cancel,
        }
    }

    /// Drop a client with its subscriptions and the sessions it owns.
    /// Safe to call more than once.
    pub fn disconnect_client(&self, client_id: &ClientId, reason: &str) {
        let removed = self.clients.remove(client_id);
        if let Some((_, client)) = removed.as_ref() {
            client.cancel.cancel();
        }
        let subscriptions = self.subscriptions.remove_client(client_id);
        let sessions = self.sessions.close_client_sessions(client_id);
        self.streams.retain(|_, owner| owner != client_id);

        if let Some((_, client)) = removed {
            info!(
                "Gateway client {} ({}) disconnected: {} ({} subscription(s), {} session(s) closed)",
                client_id, client.user, reason, subscriptions, sessions
            );
        }
    }

    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn sender(&self, client_id: &ClientId) -> Option<mpsc::Sender<ServerEvent>> {
        self.clients.get(client_id).map(|c| c.tx.clone())
    }

    /// Queue an event, waiting for room
    async fn send(&self, client_id: &ClientId, event: ServerEvent) -> bool {
        match self.sender(client_id) {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Queue an event unless the client's queue is full
    fn try_send(&self, client_id: &ClientId, event: ServerEvent) -> bool {
        let Some(tx) = self.sender(client_id) else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Outbound queue of client {} full, dropping event", client_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    // ─── Inbound ─────────────────────────────────────────────────────────

    /// Parse and handle one text frame. Host-bound requests are started on
    /// their own task and this returns without waiting for them.
    pub async fn handle_text(self: &Arc<Self>, client_id: &ClientId, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) if msg.waits_on_host() => {
                if let Err(e) = self.spawn_message(client_id, msg) {
                    self.send(client_id, e.into_event()).await;
                }
            }
            Ok(msg) => self.handle_message(client_id, msg).await,
            Err(e) => {
                debug!("Malformed message from client {}: {}", client_id, e);
                let event = ServerEvent::error(ErrorCode::BadRequest, format!("Invalid message: {}", e));
                self.send(client_id, event).await;
            }
        }
    }

    fn spawn_message(self: &Arc<Self>, client_id: &ClientId, msg: ClientMessage) -> Result<(), GatewayError> {
        let Some(pending) = self.clients.get(client_id).map(|c| c.pending.clone()) else {
            return Ok(());
        };
        let permit = pending
            .try_acquire_owned()
            .map_err(|_| GatewayError::Busy(self.config.max_pending_requests))?;
        let gateway = self.clone();
        let client_id = client_id.clone();
        // Not cancelled on disconnect: ssh_connect closes what it created
        // once it sees the client gone, container actions are bounded
        tokio::spawn(async move {
            gateway.handle_message(&client_id, msg).await;
            drop(permit);
        });
        Ok(())
    }

    /// Handle one control message and wait for it; failures go back as an
    /// `error` event
    pub async fn handle_message(self: &Arc<Self>, client_id: &ClientId, msg: ClientMessage) {
        let kind = msg.kind();
        if !self.is_connected(client_id) {
            debug!("Dropping {} from disconnected client {}", kind, client_id);
            return;
        }
        if let Err(e) = self.dispatch(client_id, msg).await {
            debug!("{} from client {} rejected: {}", kind, client_id, e);
            self.send(client_id, e.into_event()).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, client_id: &ClientId, msg: ClientMessage) -> Result<(), GatewayError> {
        match msg {
            ClientMessage::Auth { .. } => Err(GatewayError::BadRequest("Already authenticated".into())),
            ClientMessage::SubscribeMonitoring {
                host_id,
                kind,
                container_id,
            } => {
                let topic = topic_of(host_id, kind, container_id);
                if self.subscriptions.subscribe(client_id, topic.clone()) {
                    self.replay_cached(client_id, &topic);
                }
                Ok(())
            }
            ClientMessage::UnsubscribeMonitoring {
                host_id,
                kind,
                container_id,
            } => {
                self.subscriptions
                    .unsubscribe(client_id, &topic_of(host_id, kind, container_id));
                Ok(())
            }
            ClientMessage::SshConnect { host_id } => self.ssh_connect(client_id, host_id).await,
            ClientMessage::SshCommand { session_id, command } => {
                let mut data = command;
                if !data.ends_with('\n') && !data.ends_with('\r') {
                    data.push('\n');
                }
                self.terminals
                    .write(&session_id, data, Some(client_id))
                    .await?;
                Ok(())
            }
            ClientMessage::SshResize { session_id, cols, rows } => {
                if cols == 0 || rows == 0 {
                    return Err(GatewayError::BadRequest(format!("Invalid terminal size {}x{}", cols, rows)));
                }
                self.terminals
                    .resize(&session_id, cols, rows, Some(client_id))
                    .await?;
                Ok(())
            }
            ClientMessage::SshDisconnect { session_id } => self.ssh_disconnect(client_id, session_id).await,
            ClientMessage::ContainerAction {
                host_id,
                container_id,
                action,
            } => self.container_action(client_id, host_id, container_id, action).await,
            ClientMessage::Ping => {
                self.send(client_id, ServerEvent::Pong).await;
                Ok(())
            }
        }
    }

    /// Push what is already cached so a new subscriber does not wait a cycle
    fn replay_cached(&self, client_id: &ClientId, topic: &Topic) {
        let cached: Vec<MonitoringSnapshot> = match topic.kind {
            TopicKind::HostMetrics => self.monitor.current_snapshot(topic.host_id, None).into_iter().collect(),
            TopicKind::ContainerMetrics => self
                .monitor
                .host_snapshots(topic.host_id)
                .into_iter()
                .filter(|s| s.container_id.is_some())
                .filter(|s| topic.matches(&snapshot_topic(s)))
                .collect(),
            TopicKind::Terminal => Vec::new(),
        };
        for snapshot in cached {
            self.try_send(client_id, ServerEvent::monitoring(snapshot));
        }
    }

    async fn ssh_connect(self: &Arc<Self>, client_id: &ClientId, host_id: HostId) -> Result<(), GatewayError> {
        let session_id = self.sessions.create_session(host_id, Some(client_id.clone())).await?;

        let stream = match self.terminals.attach(&session_id, Some(client_id)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Terminal attach for session {} failed: {}", session_id, e);
                let _ = self.sessions.close_session(&session_id, "terminal unavailable").await;
                return Err(e.into());
            }
        };

        // The client may have gone while the handshake ran
        if !self.is_connected(client_id) {
            let _ = self.sessions.close_session(&session_id, "client disconnected").await;
            return Ok(());
        }

        self.streams.insert(session_id.clone(), client_id.clone());
        let connected = ServerEvent::SshConnected {
            session_id: session_id.clone(),
            host_id,
        };
        self.send(client_id, connected.clone()).await;
        self.notify_terminal_watchers(host_id, Some(client_id), connected);
        self.spawn_terminal_forward(client_id.clone(), session_id, stream);
        Ok(())
    }

    /// Forward one session's terminal stream to its owner, in order
    fn spawn_terminal_forward(
        self: &Arc<Self>,
        client_id: ClientId,
        session_id: SessionId,
        mut stream: mpsc::Receiver<TerminalEvent>,
    ) {
        let Some(tx) = self.sender(&client_id) else {
            return;
        };
        let gateway = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                let (event, last) = match event {
                    TerminalEvent::Output { session_id, seq, data } => (
                        ServerEvent::SshOutput {
                            session_id,
                            chunk: data,
                            seq,
                        },
                        false,
                    ),
                    TerminalEvent::Closed { session_id, reason } => {
                        (ServerEvent::SshDisconnected { session_id, reason }, true)
                    }
                };
                if tx.send(event).await.is_err() || last {
                    break;
                }
            }
            if let Some(gateway) = gateway.upgrade() {
                gateway.streams.remove_if(&session_id, |_, owner| owner == &client_id);
            }
            debug!("Terminal forward of session {} to client {} ended", session_id, client_id);
        });
    }

    async fn ssh_disconnect(&self, client_id: &ClientId, session_id: SessionId) -> Result<(), GatewayError> {
        // A forwarded stream reports the close itself, after its last output
        let streamed = self
            .streams
            .get(&session_id)
            .map(|owner| owner.value() == client_id)
            .unwrap_or(false);
        self.sessions
            .close_owned(&session_id, Some(client_id), CLOSED_BY_CLIENT)
            .await?;
        if !streamed {
            self.send(
                client_id,
                ServerEvent::SshDisconnected {
                    session_id,
                    reason: CLOSED_BY_CLIENT.to_string(),
                },
            )
            .await;
        }
        Ok(())
    }

    async fn container_action(
        &self,
        client_id: &ClientId,
        host_id: HostId,
        container_id: String,
        action: ContainerAction,
    ) -> Result<(), GatewayError> {
        let (success, message) = match self.containers.perform(host_id, &container_id, action).await {
            Ok(output) if output.is_empty() => (true, format!("{} succeeded", action)),
            Ok(output) => (true, output),
            Err(e @ ContainerError::InvalidId(_)) => return Err(e.into()),
            Err(e) => (false, e.to_string()),
        };
        info!(
            "Client {} ran {} on container {} of host {}: {}",
            client_id,
            action,
            container_id,
            host_id,
            if success { "ok" } else { "failed" }
        );

        let event = ServerEvent::ContainerUpdated {
            host_id,
            container_id: container_id.clone(),
            action,
            success,
            message,
        };
        let watchers = self
            .subscriptions
            .matching_clients(&Topic::container_metrics(host_id, Some(container_id)));
        for watcher in watchers.iter().filter(|w| *w != client_id) {
            self.try_send(watcher, event.clone());
        }
        self.send(client_id, event).await;
        Ok(())
    }

    // ─── Fan-out ─────────────────────────────────────────────────────────

    /// Push a snapshot to every matching subscriber; returns how many got it
    fn fan_out_snapshot(&self, snapshot: MonitoringSnapshot) -> usize {
        let recipients = self.subscriptions.matching_clients(&snapshot_topic(&snapshot));
        let mut delivered = 0;
        for client_id in &recipients {
            if self.try_send(client_id, ServerEvent::monitoring(snapshot.clone())) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Terminal-topic subscribers of a host, except `exclude`
    fn notify_terminal_watchers(&self, host_id: HostId, exclude: Option<&ClientId>, event: ServerEvent) {
        for client_id in self.subscriptions.matching_clients(&Topic::terminal(host_id)) {
            if Some(&client_id) != exclude {
                self.try_send(&client_id, event.clone());
            }
        }
    }

    /// Spawn the monitoring fan-out and the session-close watcher
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![self.spawn_monitoring_fanout(), self.spawn_session_watch()]
    }

    fn spawn_monitoring_fanout(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let mut updates = self.monitor.subscribe();

        tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    update = updates.recv() => update,
                    _ = shutdown.cancelled() => break,
                };
                let Some(gateway) = gateway.upgrade() else { break };
                match update {
                    Ok(snapshot) => {
                        gateway.fan_out_snapshot(snapshot);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Monitoring fan-out lagged, skipped {} snapshot(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Monitoring fan-out stopped");
        })
    }

    fn spawn_session_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let mut events = self.sessions.subscribe_events();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.cancelled() => break,
                };
                let Some(gateway) = gateway.upgrade() else { break };
                match event {
                    Ok(SessionEvent::Closed {
                        session_id,
                        host_id,
                        owner,
                        reason,
                    }) => {
                        gateway.notify_terminal_watchers(
                            host_id,
                            owner.as_ref(),
                            ServerEvent::SshDisconnected { session_id, reason },
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Session watch lagged, skipped {} event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Session watch stopped");
        })
    }

    /// Drop every client and stop the fan-out tasks
    pub fn shutdown(&self) {
        let ids: Vec<ClientId> = self.clients.iter().map(|c| c.key().clone()).collect();
        for client_id in ids {
            self.disconnect_client(&client_id, "shutdown");
        }
        self.shutdown.cancel();
        info!("Gateway shut down");
    }
}

/// Topic an event about this snapshot is published under
fn snapshot_topic(snapshot: &MonitoringSnapshot) -> Topic {
    match &snapshot.container_id {
        Some(id) => Topic::container_metrics(snapshot.host_id, Some(id.clone())),
        None => Topic::host_metrics(snapshot.host_id),
    }
}
