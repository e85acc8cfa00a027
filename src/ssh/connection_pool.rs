//! SSH Connection Pool
//!
//! Owns every live SSH connection, keyed by `HostIdentity`.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  ConnectionPool                                            │
//! │  slots: HostIdentity -> Slot                               │
//! │    ├── gate: creation lock (one handshake per identity)    │
//! │    ├── current: Option<Arc<Connection>>                    │
//! │    └── failure: consecutive failures + retry_not_before    │
//! │  connections: ConnectionId -> Arc<Connection>              │
//! │    ├── transport: Arc<dyn Transport>                       │
//! │    ├── channel_count (only mutated by the pool)            │
//! │    └── last_active                                         │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # State machine
//!
//! `Disconnected -> Connecting -> Ready -> Closed`, with `Connecting ->
//! Degraded` when every handshake attempt of an `acquire` failed. A Degraded
//! slot fails fast until its backoff window has passed; the next `acquire`
//! after that retries. Inside the window a credential failure is reported
//! as itself, anything else as `Backoff`. Nothing is retried in the background.
//!
//! # Idle policy
//!
//! The sweeper runs on a fixed interval and closes a connection only if its
//! channel count is zero and it has been idle past `idle_timeout_secs`.
//! The same pass pings every unused connection and closes the ones whose
//! link turns out to be dead.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::config::{HostConfig, HostId, HostIdentity};
use super::error::SshError;
use super::handle_owner::PingResult;
use super::transport::{Connector, Transport};
use crate::error::ErrorCode;

pub type ConnectionId = String;

const EVENT_CAPACITY: usize = 64;

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum live connections (0 = unlimited)
    #[serde(default)]
    pub max_connections: usize,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No handshake attempted yet
    Disconnected,
    Connecting,
    Ready,
    /// Last handshake failed; waiting out the backoff window
    Degraded,
    /// Terminal; a closed connection is never reused
    Closed,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("Connection limit reached: {current}/{max}")]
    LimitReached { current: usize, max: usize },

    #[error("Host {host} unavailable, retry in {retry_in_ms}ms ({last_error})")]
    Backoff {
        host: String,
        retry_in_ms: u64,
        last_error: String,
    },

    #[error("Connection not found: {0}")]
    NotFound(ConnectionId),

    #[error("Connection pool is shut down")]
    ShutDown,

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl PoolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PoolError::LimitReached { .. } => ErrorCode::Capacity,
            PoolError::Backoff { .. } => ErrorCode::TransportFailure,
            PoolError::NotFound(_) | PoolError::ShutDown => ErrorCode::Internal,
            PoolError::Ssh(e) => e.code(),
        }
    }
}

/// Lifecycle notifications for pool consumers
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Closed {
        connection_id: ConnectionId,
        host_id: HostId,
        reason: String,
    },
}

/// Connection info for the CRUD layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub host_id: HostId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: ConnectionState,
    pub channel_count: u32,
    pub created_at: String,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_connections: usize,
    /// Connections with at least one open channel
    pub active_connections: usize,
    pub idle_connections: usize,
    pub connecting_hosts: usize,
    pub degraded_hosts: usize,
    pub total_channels: u32,
    /// 0 = unlimited
    pub pool_capacity: usize,
    pub idle_timeout_secs: u64,
}

/// One established transport to a host
pub struct Connection {
    pub id: ConnectionId,
    pub host_id: HostId,
    pub identity: HostIdentity,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    channel_count: AtomicU32,
    last_active: Mutex<Instant>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host_id", &self.host_id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(host_id: HostId, identity: HostIdentity, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            host_id,
            identity,
            transport,
            state: RwLock::new(ConnectionState::Ready),
            channel_count: AtomicU32::new(0),
            last_active: Mutex::new(Instant::now()),
            created_at: Utc::now(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Record activity without changing the channel count
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Take a channel reference if still Ready.
    ///
    /// Holds the state read lock so it cannot interleave with `try_retire`.
    fn try_checkout(&self) -> bool {
        let state = self.state.read();
        if *state != ConnectionState::Ready || !self.transport.is_connected() {
            return false;
        }
        let count = self.channel_count.fetch_add(1, Ordering::SeqCst) + 1;
        drop(state);
        self.touch();
        debug!("Connection {} channel count increased to {}", self.id, count);
        true
    }

    fn checkin(&self) -> u32 {
        let prev = self
            .channel_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .unwrap_or(0);
        self.touch();
        let count = prev.saturating_sub(1);
        debug!("Connection {} channel count decreased to {}", self.id, count);
        count
    }

    /// Move to Closed if no channel is open (or unconditionally with `force`)
    fn try_retire(&self, force: bool) -> bool {
        let mut state = self.state.write();
        if *state == ConnectionState::Closed {
            return false;
        }
        if !force && self.channel_count.load(Ordering::SeqCst) > 0 {
            return false;
        }
        *state = ConnectionState::Closed;
        true
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            host_id: self.host_id,
            host: self.identity.address.clone(),
            port: self.identity.port,
            username: self.identity.username.clone(),
            state: self.state(),
            channel_count: self.channel_count(),
            created_at: self.created_at.to_rfc3339(),
            idle_secs: self.idle_for().as_secs(),
        }
    }
}

struct FailureRecord {
    error: SshError,
    consecutive_failures: u32,
    retry_not_before: Instant,
}

/// Per-identity bookkeeping; outlives the connections it creates
struct Slot {
    gate: tokio::sync::Mutex<()>,
    /// Bumped after every finished handshake round
    generation: AtomicU64,
    current: RwLock<Option<Arc<Connection>>>,
    failure: Mutex<Option<FailureRecord>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            current: RwLock::new(None),
            failure: Mutex::new(None),
        }
    }

    fn checkout(&self) -> Option<Arc<Connection>> {
        let conn = self.current.read().clone()?;
        conn.try_checkout().then_some(conn)
    }

    fn state(&self) -> ConnectionState {
        if let Some(conn) = self.current.read().as_ref() {
            return conn.state();
        }
        if self.gate.try_lock().is_err() {
            return ConnectionState::Connecting;
        }
        if self.failure.lock().is_some() {
            return ConnectionState::Degraded;
        }
        ConnectionState::Disconnected
    }

    /// Remaining backoff and the error that caused it
    fn backoff_remaining(&self) -> Option<(Duration, SshError)> {
        let failure = self.failure.lock();
        let record = failure.as_ref()?;
        let now = Instant::now();
        (record.retry_not_before > now)
            .then(|| (record.retry_not_before - now, record.error.clone()))
    }

    fn record_failure(&self, error: SshError, policy: &BackoffPolicy) -> u32 {
        let mut failure = self.failure.lock();
        let failures = failure
            .as_ref()
            .map(|r| r.consecutive_failures)
            .unwrap_or(0)
            .saturating_add(1);
        *failure = Some(FailureRecord {
            error,
            consecutive_failures: failures,
            retry_not_before: Instant::now() + policy.delay_for(failures),
        });
        failures
    }

    fn is_vacant(&self) -> bool {
        self.current.read().is_none() && self.failure.lock().is_none() && self.gate.try_lock().is_ok()
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    slots: DashMap<HostIdentity, Arc<Slot>>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    events: broadcast::Sender<PoolEvent>,
    shutdown: CancellationToken,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            connector,
            config,
            slots: DashMap::new(),
            connections: DashMap::new(),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Get a Ready connection for `host`, creating it if needed.
    ///
    /// Concurrent calls for the same identity share one handshake. The
    /// returned connection carries one channel reference; hand it back with
    /// `release`.
    pub async fn acquire(self: &Arc<Self>, host: &HostConfig) -> Result<Arc<Connection>, PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::ShutDown);
        }

        let identity = host.identity();
        let slot = self
            .slots
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone();

        if let Some(conn) = slot.checkout() {
            return Ok(conn);
        }

        let observed = slot.generation.load(Ordering::SeqCst);
        let _creation = slot.gate.lock().await;

        if let Some(conn) = slot.checkout() {
            debug!("Reusing connection {} created by a concurrent acquire", conn.id);
            return Ok(conn);
        }

        // Another caller just ran the handshake for us and it failed
        if slot.generation.load(Ordering::SeqCst) != observed {
            if let Some(record) = slot.failure.lock().as_ref() {
                return Err(PoolError::Ssh(record.error.clone()));
            }
        }

        if let Some((remaining, last_error)) = slot.backoff_remaining() {
            // Rejected credentials stay an auth failure until they change
            if last_error.is_auth() {
                return Err(PoolError::Ssh(last_error));
            }
            return Err(PoolError::Backoff {
                host: identity.to_string(),
                retry_in_ms: remaining.as_millis() as u64,
                last_error: last_error.to_string(),
            });
        }

        let max = self.config.max_connections;
        if max > 0 && self.connections.len() >= max {
            warn!("Connection limit reached ({}/{})", self.connections.len(), max);
            return Err(PoolError::LimitReached {
                current: self.connections.len(),
                max,
            });
        }

        let result = self.establish(&slot, host, identity).await;
        slot.generation.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// Handshake with bounded retries; called with the slot's gate held
    async fn establish(
        self: &Arc<Self>,
        slot: &Arc<Slot>,
        host: &HostConfig,
        identity: HostIdentity,
    ) -> Result<Arc<Connection>, PoolError> {
        let policy = &self.config.backoff;
        let attempts = policy.attempts();
        let timeout = Duration::from_secs(self.config.handshake_timeout_secs);
        let mut last_error = SshError::ConnectionFailed("no attempt made".to_string());

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = policy.delay_for(attempt - 1);
                debug!("Waiting {:?} before handshake attempt {} to {}", delay, attempt, identity);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => return Err(PoolError::ShutDown),
                }
            }

            info!("Connecting to {} (attempt {}/{})", identity, attempt, attempts);
            let outcome = match tokio::time::timeout(timeout, self.connector.connect(host, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(SshError::Timeout(format!("Handshake with {} timed out", identity))),
            };

            match outcome {
                Ok(transport) => {
                    *slot.failure.lock() = None;
                    let conn = Arc::new(Connection::new(host.id, identity, transport));
                    conn.channel_count.store(1, Ordering::SeqCst);
                    *slot.current.write() = Some(conn.clone());
                    self.connections.insert(conn.id.clone(), conn.clone());
                    self.spawn_watcher(conn.clone());
                    info!("Connection {} ready for host {}", conn.id, host.id);
                    return Ok(conn);
                }
                Err(e) if e.is_auth() => {
                    warn!("Authentication to {} failed, not retrying: {}", identity, e);
                    slot.record_failure(e.clone(), policy);
                    return Err(PoolError::Ssh(e));
                }
                Err(e) => {
                    warn!("Handshake attempt {}/{} to {} failed: {}", attempt, attempts, identity, e);
                    last_error = e;
                }
            }
        }

        let failures = slot.record_failure(last_error.clone(), policy);
        warn!(
            "Host {} degraded after {} consecutive failures",
            identity, failures
        );
        Err(PoolError::Ssh(last_error))
    }

    /// Give back one channel reference. Never closes the connection.
    pub fn release(&self, conn: &Connection) {
        conn.checkin();
    }

    fn spawn_watcher(self: &Arc<Self>, conn: Arc<Connection>) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let mut disconnect_rx = conn.transport.subscribe_disconnect();

        tokio::spawn(async move {
            if conn.transport.is_connected() {
                tokio::select! {
                    _ = disconnect_rx.recv() => {}
                    _ = shutdown.cancelled() => return,
                }
            }
            if let Some(pool) = pool.upgrade() {
                pool.retire(&conn, true, "transport disconnected").await;
            }
        });
    }

    /// Close and forget a connection; idempotent
    async fn retire(&self, conn: &Arc<Connection>, force: bool, reason: &str) -> bool {
        if !conn.try_retire(force) {
            return false;
        }

        self.connections.remove(&conn.id);
        if let Some(slot) = self.slots.get(&conn.identity).map(|s| s.clone()) {
            let mut current = slot.current.write();
            if current.as_ref().is_some_and(|c| c.id == conn.id) {
                *current = None;
            }
        }

        conn.transport.disconnect().await;
        info!("Connection {} closed: {}", conn.id, reason);

        let _ = self.events.send(PoolEvent::Closed {
            connection_id: conn.id.clone(),
            host_id: conn.host_id,
            reason: reason.to_string(),
        });
        true
    }

    /// Close connections with no open channel that have been idle past the
    /// threshold. Returns the number closed.
    pub async fn evict_idle(&self) -> usize {
        let threshold = Duration::from_secs(self.config.idle_timeout_secs);
        let candidates: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|e| e.channel_count() == 0 && e.idle_for() >= threshold)
            .map(|e| e.value().clone())
            .collect();

        let mut closed = 0;
        for conn in candidates {
            if self.retire(&conn, false, "idle timeout").await {
                closed += 1;
            }
        }

        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1 || !slot.is_vacant());

        if closed > 0 {
            info!("Idle sweep closed {} connection(s)", closed);
        }
        closed
    }

    /// Ping connections nobody is using and close those whose link is gone,
    /// so the next `acquire` handshakes instead of getting a dead one.
    /// A slow answer is not a failure. Returns the number closed.
    pub async fn check_unused_links(&self) -> usize {
        let unused: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|e| e.channel_count() == 0)
            .map(|e| e.value().clone())
            .collect();

        let mut closed = 0;
        for conn in unused {
            match conn.transport.ping().await {
                PingResult::IoError => {
                    warn!("Connection {} failed its keepalive", conn.id);
                    if self.retire(&conn, false, "keepalive failed").await {
                        closed += 1;
                    }
                }
                PingResult::Timeout => debug!("Keepalive on {} timed out, keeping it", conn.id),
                PingResult::Ok => {}
            }
        }
        closed
    }

    /// Close a connection regardless of open channels
    pub async fn force_close(&self, connection_id: &str, reason: &str) -> Result<(), PoolError> {
        let conn = self
            .connections
            .get(connection_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| PoolError::NotFound(connection_id.to_string()))?;
        self.retire(&conn, true, reason).await;
        Ok(())
    }

    /// Why `host` is currently unreachable, if it is
    pub fn unreachable_reason(&self, host: &HostConfig) -> Option<String> {
        let slot = self.slots.get(&host.identity())?.clone();
        slot.backoff_remaining().map(|(_, error)| error.to_string())
    }

    /// False while the host sits in its backoff window
    pub fn is_reachable(&self, host: &HostConfig) -> bool {
        self.unreachable_reason(host).is_none()
    }

    pub fn state_of(&self, host: &HostConfig) -> ConnectionState {
        self.slots
            .get(&host.identity())
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|e| e.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.connections.iter().map(|e| e.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn stats(&self) -> PoolStats {
        let mut active_connections = 0;
        let mut idle_connections = 0;
        let mut total_channels: u32 = 0;
        for conn in self.connections.iter() {
            let count = conn.channel_count();
            if count > 0 {
                active_connections += 1;
            } else {
                idle_connections += 1;
            }
            total_channels = total_channels.saturating_add(count);
        }

        let mut connecting_hosts = 0;
        let mut degraded_hosts = 0;
        for slot in self.slots.iter() {
            match slot.state() {
                ConnectionState::Connecting => connecting_hosts += 1,
                ConnectionState::Degraded => degraded_hosts += 1,
                _ => {}
            }
        }

        PoolStats {
            total_connections: self.connections.len(),
            active_connections,
            idle_connections,
            connecting_hosts,
            degraded_hosts,
            total_channels,
            pool_capacity: self.config.max_connections,
            idle_timeout_secs: self.config.idle_timeout_secs,
        }
    }

    /// Run `evict_idle` every `sweep_interval_secs` until shutdown
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                let Some(pool) = pool.upgrade() else { break };
                pool.evict_idle().await;
                pool.check_unused_links().await;
            }
            debug!("Connection sweeper stopped");
        })
    }

    /// Close everything and refuse new acquires
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let all: Vec<Arc<Connection>> = self.connections.iter().map(|e| e.value().clone()).collect();
        for conn in all {
            self.retire(&conn, true, "shutdown").await;
        }
        self.slots.clear();
        info!("Connection pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{host, MockConnector};

    fn pool_with(connector: &Arc<MockConnector>, config: PoolConfig) -> Arc<ConnectionPool> {
        ConnectionPool::new(connector.clone(), config)
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
            max_attempts: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_single_handshake() {
        let connector = MockConnector::new();
        connector.set_handshake_delay(Duration::from_millis(200));
        let pool = pool_with(&connector, PoolConfig::default());
        let target = host(1);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let target = target.clone();
            tasks.push(tokio::spawn(async move { pool.acquire(&target).await }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id.clone());
        }

        assert_eq!(connector.handshakes(), 1);
        assert!(ids.iter().all(|id| id == &ids[0]));
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.get(&ids[0]).unwrap().channel_count(), 16);
    }

    #[tokio::test]
    async fn test_credential_change_uses_new_connection() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default());
        let original = host(1);
        let mut rotated = original.clone();
        rotated.auth = crate::ssh::AuthMethod::password("rotated");

        let a = pool.acquire(&original).await.unwrap();
        let b = pool.acquire(&rotated).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(connector.handshakes(), 2);
    }

    #[tokio::test]
    async fn test_dead_unused_link_is_replaced() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default());

        let busy = pool.acquire(&host(2)).await.unwrap();
        let unused = pool.acquire(&host(1)).await.unwrap();
        connector.last_transport().unwrap().go_silent();
        pool.release(&unused);

        assert_eq!(pool.check_unused_links().await, 1);
        assert_eq!(unused.state(), ConnectionState::Closed);
        assert_eq!(busy.state(), ConnectionState::Ready);

        let fresh = pool.acquire(&host(1)).await.unwrap();
        assert_ne!(fresh.id, unused.id);
        assert_eq!(connector.handshakes(), 3);
        assert_eq!(pool.check_unused_links().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_respects_channel_count() {
        let connector = MockConnector::new();
        let config = PoolConfig {
            idle_timeout_secs: 60,
            ..Default::default()
        };
        let pool = pool_with(&connector, config);

        let busy = pool.acquire(&host(1)).await.unwrap();
        let idle = pool.acquire(&host(2)).await.unwrap();
        pool.release(&idle);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(pool.evict_idle().await, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(pool.evict_idle().await, 1);
        assert_eq!(idle.state(), ConnectionState::Closed);
        assert_eq!(busy.state(), ConnectionState::Ready);
        assert!(pool.get(&busy.id).is_some());
        assert!(pool.get(&idle.id).is_none());

        // Closed connections are never handed out again
        let fresh = pool.acquire(&host(2)).await.unwrap();
        assert_ne!(fresh.id, idle.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_does_not_close() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default());
        let conn = pool.acquire(&host(1)).await.unwrap();
        pool.release(&conn);
        pool.release(&conn);
        assert_eq!(conn.channel_count(), 0);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_degrades_and_fails_fast() {
        let connector = MockConnector::new();
        connector.set_unreachable(1, true);
        let config = PoolConfig {
            backoff: fast_backoff(),
            ..Default::default()
        };
        let pool = pool_with(&connector, config);
        let target = host(1);

        let err = pool.acquire(&target).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransportFailure);
        assert_eq!(connector.handshakes(), 2);
        assert_eq!(pool.state_of(&target), ConnectionState::Degraded);
        assert!(!pool.is_reachable(&target));

        // Inside the backoff window: no handshake
        let err = pool.acquire(&target).await.unwrap_err();
        assert!(matches!(err, PoolError::Backoff { .. }));
        assert!(err.code().is_retryable());
        assert_eq!(connector.handshakes(), 2);

        connector.set_unreachable(1, false);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(pool.is_reachable(&target));
        let conn = pool.acquire(&target).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(pool.state_of(&target), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_waiter() {
        let connector = MockConnector::new();
        connector.set_unreachable(1, true);
        connector.set_handshake_delay(Duration::from_millis(50));
        let config = PoolConfig {
            backoff: BackoffPolicy {
                max_attempts: 1,
                ..fast_backoff()
            },
            ..Default::default()
        };
        let pool = pool_with(&connector, config);

        let (h1, h2, h3) = (host(1), host(1), host(1));
        let (a, b, c) = tokio::join!(pool.acquire(&h1), pool.acquire(&h2), pool.acquire(&h3));
        assert!(a.is_err() && b.is_err() && c.is_err());
        assert_eq!(connector.handshakes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_not_retried() {
        let connector = MockConnector::new();
        connector.set_auth_rejected(1, true);
        let config = PoolConfig {
            backoff: fast_backoff(),
            ..Default::default()
        };
        let pool = pool_with(&connector, config);

        let err = pool.acquire(&host(1)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthFailure);
        assert!(!err.code().is_retryable());
        assert_eq!(connector.handshakes(), 1);

        // Still inside the window: same classification, no new handshake
        let again = pool.acquire(&host(1)).await.unwrap_err();
        assert!(matches!(again, PoolError::Ssh(ref e) if e.is_auth()));
        assert_eq!(again.code(), ErrorCode::AuthFailure);
        assert_eq!(connector.handshakes(), 1);
        assert!(!pool.is_reachable(&host(1)));
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let connector = MockConnector::new();
        let config = PoolConfig {
            max_connections: 1,
            ..Default::default()
        };
        let pool = pool_with(&connector, config);

        pool.acquire(&host(1)).await.unwrap();
        let err = pool.acquire(&host(2)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Capacity);
        // Reuse of an existing connection is not limited
        assert!(pool.acquire(&host(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_transport_drop_emits_closed() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default());
        let mut events = pool.subscribe_events();

        let conn = pool.acquire(&host(1)).await.unwrap();
        connector.last_transport().unwrap().drop_link();

        let PoolEvent::Closed {
            connection_id,
            host_id,
            reason,
        } = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connection_id, conn.id);
        assert_eq!(host_id, 1);
        assert_eq!(reason, "transport disconnected");
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_force_close_and_shutdown() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default());
        let a = pool.acquire(&host(1)).await.unwrap();
        let b = pool.acquire(&host(2)).await.unwrap();

        pool.force_close(&a.id, "operator").await.unwrap();
        assert_eq!(a.state(), ConnectionState::Closed);
        assert!(matches!(
            pool.force_close(&a.id, "again").await,
            Err(PoolError::NotFound(_))
        ));

        pool.shutdown().await;
        assert_eq!(b.state(), ConnectionState::Closed);
        assert!(matches!(pool.acquire(&host(3)).await, Err(PoolError::ShutDown)));
    }

    #[tokio::test]
    async fn test_stats_and_list() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default());
        let a = pool.acquire(&host(1)).await.unwrap();
        let b = pool.acquire(&host(2)).await.unwrap();
        pool.release(&b);

        let stats = pool.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_channels, 1);

        let list = pool.list();
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|i| i.id == a.id && i.channel_count == 1));
    }
}
