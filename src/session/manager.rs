//! Session Manager
//!
//! Sessions are logical contexts on top of pooled connections. Each one
//! holds one channel reference on its connection for its whole lifetime
//! and owns a command shell for `execute`. Closing happens in exactly one
//! place (`finish`), whatever the trigger: explicit close, idle timeout,
//! owner disconnect, remote shell exit or the connection going away.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::CommandHistory;
use super::sanitize::sanitize_output;
use super::shell::CommandShell;
use super::types::{
    ExecResult, HistoryEntry, SessionConfig, SessionError, SessionEvent, SessionId, SessionInfo,
    SessionStats,
};
use crate::hosts::HostRegistry;
use crate::router::ClientId;
use crate::ssh::{Connection, ConnectionPool, HostId, PoolEvent};

const EVENT_CAPACITY: usize = 256;

/// One live session
pub struct SessionEntry {
    pub id: SessionId,
    pub host_id: HostId,
    pub host_name: String,
    pub owner: Option<ClientId>,
    pub created_at: DateTime<Utc>,
    connection: Arc<Connection>,
    cwd: RwLock<String>,
    last_activity: Mutex<(Instant, DateTime<Utc>)>,
    history: Mutex<CommandHistory>,
    shell: tokio::sync::Mutex<Option<CommandShell>>,
    terminal_attached: AtomicBool,
    close_reason: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl SessionEntry {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Cancelled once the session is closed
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    pub fn current_path(&self) -> String {
        self.cwd.read().clone()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = (Instant::now(), Utc::now());
        self.connection.touch();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().0.elapsed()
    }

    /// Claim the single terminal slot; false if already taken
    pub(crate) fn claim_terminal(&self) -> bool {
        !self.terminal_attached.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn release_terminal(&self) {
        self.terminal_attached.store(false, Ordering::SeqCst);
    }

    pub fn terminal_attached(&self) -> bool {
        self.terminal_attached.load(Ordering::SeqCst)
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            host_id: self.host_id,
            host_name: self.host_name.clone(),
            current_path: self.current_path(),
            created_at: self.created_at,
            last_activity: self.last_activity.lock().1,
            connection_id: self.connection.id.clone(),
            command_count: self.history.lock().len(),
            terminal_attached: self.terminal_attached(),
        }
    }
}

pub struct SessionManager {
    pool: Arc<ConnectionPool>,
    hosts: Arc<dyn HostRegistry>,
    config: SessionConfig,
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    /// Live sessions plus creations in flight
    reserved: AtomicUsize,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        pool: Arc<ConnectionPool>,
        hosts: Arc<dyn HostRegistry>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            pool,
            hosts,
            config,
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Create a session on `host_id`, optionally owned by a gateway client
    pub async fn create_session(
        &self,
        host_id: HostId,
        owner: Option<ClientId>,
    ) -> Result<SessionId, SessionError> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::Pool(crate::ssh::PoolError::ShutDown));
        }

        let max = self.config.max_sessions;
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .map_err(|_| {
                warn!("Session limit reached ({})", max);
                SessionError::LimitReached { max }
            })?;

        match self.open_session(host_id, owner).await {
            Ok(id) => Ok(id),
            Err(e) => {
                self.reserved.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        host_id: HostId,
        owner: Option<ClientId>,
    ) -> Result<SessionId, SessionError> {
        let host = self.hosts.get(host_id).await?;
        let connection = self.pool.acquire(&host).await?;

        let timeout = Duration::from_secs(self.config.execute_timeout_secs);
        let opened = match tokio::time::timeout(timeout, CommandShell::open(connection.transport(), None)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(self.config.execute_timeout_secs)),
        };
        let (shell, cwd) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Failed to open command shell on host {}: {}", host_id, e);
                self.pool.release(&connection);
                return Err(e);
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            host_id,
            host_name: host.display_name(),
            owner,
            created_at: Utc::now(),
            connection,
            cwd: RwLock::new(cwd),
            last_activity: Mutex::new((Instant::now(), Utc::now())),
            history: Mutex::new(CommandHistory::new(self.config.history_capacity)),
            shell: tokio::sync::Mutex::new(Some(shell)),
            terminal_attached: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            cancel: self.shutdown.child_token(),
        });
        self.sessions.insert(id.clone(), entry.clone());

        info!(
            "Session {} created on host {} (connection {})",
            id, entry.host_name, entry.connection.id
        );
        Ok(id)
    }

    /// Look up a live session, checking ownership when a requester is given
    pub fn authorize(
        &self,
        session_id: &str,
        requester: Option<&ClientId>,
    ) -> Result<Arc<SessionEntry>, SessionError> {
        let entry = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if let (Some(requester), Some(owner)) = (requester, entry.owner.as_ref()) {
            if requester != owner {
                return Err(SessionError::Forbidden(session_id.to_string()));
            }
        }
        Ok(entry)
    }

    /// Run one command and wait for it to finish.
    ///
    /// Calls on the same session are serialized. The timeout starts once
    /// the shell is ours, not while queued behind another call. On timeout
    /// the command shell is dropped and a fresh one is opened by the next
    /// call in the same working directory; the connection is not touched.
    pub async fn execute(
        &self,
        session_id: &str,
        command: &str,
        requester: Option<&ClientId>,
    ) -> Result<ExecResult, SessionError> {
        let entry = self.authorize(session_id, requester)?;
        entry.touch();

        let cancel = entry.cancel.clone();
        let limit = Duration::from_secs(self.config.execute_timeout_secs);
        let outcome = tokio::select! {
            result = run_in_shell(&entry, command, limit) => result,
            _ = cancel.cancelled() => return Err(SessionError::Closed(session_id.to_string())),
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Command on session {} failed: {}", session_id, e);
                entry.record(command, None);
                return Err(e);
            }
        };

        if let Some(cwd) = outcome.cwd.as_ref().filter(|c| !c.is_empty()) {
            *entry.cwd.write() = cwd.clone();
        }
        entry.record(command, outcome.exit_code);
        entry.touch();

        Ok(ExecResult {
            output: sanitize_output(&outcome.stdout),
            error: sanitize_output(&outcome.stderr),
            exit_code: outcome.exit_code,
            timestamp: Utc::now(),
            current_path: entry.current_path(),
        })
    }

    pub async fn close_session(&self, session_id: &str, reason: &str) -> Result<(), SessionError> {
        let (_, entry) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        self.finish(entry, reason);
        Ok(())
    }

    /// Close a session if the requester may; used by the gateway
    pub async fn close_owned(
        &self,
        session_id: &str,
        requester: Option<&ClientId>,
        reason: &str,
    ) -> Result<(), SessionError> {
        self.authorize(session_id, requester)?;
        self.close_session(session_id, reason).await
    }

    /// Single exit path for every session
    fn finish(&self, entry: Arc<SessionEntry>, reason: &str) {
        *entry.close_reason.lock() = Some(reason.to_string());
        entry.cancel.cancel();
        if let Ok(mut shell) = entry.shell.try_lock() {
            if let Some(shell) = shell.take() {
                shell.close();
            }
        }
        self.pool.release(&entry.connection);
        self.reserved.fetch_sub(1, Ordering::SeqCst);

        info!("Session {} closed: {}", entry.id, reason);
        let _ = self.events.send(SessionEvent::Closed {
            session_id: entry.id.clone(),
            host_id: entry.host_id,
            owner: entry.owner.clone(),
            reason: reason.to_string(),
        });
    }

    fn close_where(&self, reason: &str, predicate: impl Fn(&SessionEntry) -> bool) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.key().clone())
            .collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, entry)) = self.sessions.remove(&id) {
                self.finish(entry, reason);
                closed += 1;
            }
        }
        closed
    }

    /// Close every session created by `client_id`
    pub fn close_client_sessions(&self, client_id: &ClientId) -> usize {
        let closed = self.close_where("client disconnected", |s| s.owner.as_ref() == Some(client_id));
        if closed > 0 {
            info!("Closed {} session(s) of client {}", closed, client_id);
        }
        closed
    }

    /// Cascade a closed connection to its sessions
    pub fn close_connection_sessions(&self, connection_id: &str, reason: &str) -> usize {
        let reason = format!("connection closed: {}", reason);
        self.close_where(&reason, |s| s.connection.id == connection_id)
    }

    /// Close sessions idle past `idle_timeout_secs`
    pub fn evict_idle(&self) -> usize {
        let threshold = Duration::from_secs(self.config.idle_timeout_secs);
        let closed = self.close_where("idle timeout", |s| s.idle_for() >= threshold);
        if closed > 0 {
            info!("Idle sweep closed {} session(s)", closed);
        }
        closed
    }

    pub fn get_session_info(&self, session_id: &str) -> Result<SessionInfo, SessionError> {
        self.sessions
            .get(session_id)
            .map(|e| e.info())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.iter().map(|e| e.info()).collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// Oldest first
    pub fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|e| e.history.lock().to_vec())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active_sessions: self.sessions.len(),
            attached_terminals: self.sessions.iter().filter(|e| e.terminal_attached()).count(),
            max_sessions: self.config.max_sessions,
        }
    }

    /// Spawn the idle sweep and the pool-event cascade
    pub fn spawn_maintenance(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![self.spawn_sweeper(), self.spawn_pool_listener()]
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
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
                let Some(manager) = manager.upgrade() else { break };
                manager.evict_idle();
            }
            debug!("Session sweeper stopped");
        })
    }

    fn spawn_pool_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let mut events = self.pool.subscribe_events();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.cancelled() => break,
                };
                let Some(manager) = manager.upgrade() else { break };
                match event {
                    Ok(PoolEvent::Closed { connection_id, reason, .. }) => {
                        let closed = manager.close_connection_sessions(&connection_id, &reason);
                        if closed > 0 {
                            info!(
                                "Connection {} closed, terminated {} session(s)",
                                connection_id, closed
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} pool events, checking sessions against the pool", n);
                        let pool = manager.pool.clone();
                        manager.close_where("connection closed", |s| pool.get(&s.connection.id).is_none());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Pool event listener stopped");
        })
    }

    /// Close every session and stop background tasks
    pub fn shutdown(&self) {
        let closed = self.close_where("shutdown", |_| true);
        self.shutdown.cancel();
        info!("Session manager shut down ({} session(s) closed)", closed);
    }
}

impl SessionEntry {
    fn record(&self, command: &str, exit_code: Option<i32>) {
        self.history.lock().push(HistoryEntry {
            command: command.to_string(),
            exit_code,
            executed_at: Utc::now(),
        });
    }
}

/// Run `command` in the session's shell, reopening it first if needed.
/// Any failure, timeout included, drops the shell before the lock is
/// released so the next caller starts from a clean one.
async fn run_in_shell(
    entry: &SessionEntry,
    command: &str,
    limit: Duration,
) -> Result<super::shell::RawOutcome, SessionError> {
    let mut guard = entry.shell.lock().await;
    let result = match tokio::time::timeout(limit, run_in_slot(&mut guard, entry, command)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Command on session {} timed out after {}s, resetting shell",
                entry.id,
                limit.as_secs()
            );
            Err(SessionError::Timeout(limit.as_secs()))
        }
    };
    if result.is_err() {
        *guard = None;
    }
    result
}

async fn run_in_slot(
    slot: &mut Option<CommandShell>,
    entry: &SessionEntry,
    command: &str,
) -> Result<super::shell::RawOutcome, SessionError> {
    if slot.is_none() {
        let cwd = entry.current_path();
        debug!("Reopening command shell for session {} in {}", entry.id, cwd);
        let (shell, _) = CommandShell::open(entry.connection.transport(), Some(&cwd)).await?;
        *slot = Some(shell);
    }
    match slot.as_mut() {
        Some(shell) => shell.run(command).await,
        None => Err(SessionError::Closed(entry.id.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::hosts::StaticHostRegistry;
    use crate::ssh::PoolConfig;
    use crate::testing::{host, MockConnector};

    struct Fixture {
        connector: Arc<MockConnector>,
        pool: Arc<ConnectionPool>,
        manager: Arc<SessionManager>,
    }

    fn fixture(config: SessionConfig) -> Fixture {
        let connector = MockConnector::new();
        let pool = ConnectionPool::new(connector.clone(), PoolConfig::default());
        let hosts = Arc::new(StaticHostRegistry::new([host(1), host(2)]));
        let manager = SessionManager::new(pool.clone(), hosts, config);
        Fixture {
            connector,
            pool,
            manager,
        }
    }

    #[tokio::test]
    async fn test_execute_sanitizes_output() {
        let f = fixture(SessionConfig::default());
        let id = f.manager.create_session(1, None).await.unwrap();

        let result = f.manager.execute(&id, "ansi", None).await.unwrap();
        assert_eq!(result.output, "test");
        assert_eq!(result.error, "");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_execute_captures_stderr_and_cwd() {
        let f = fixture(SessionConfig::default());
        let id = f.manager.create_session(1, None).await.unwrap();

        let failed = f.manager.execute(&id, "fail", None).await.unwrap();
        assert_eq!(failed.error, "boom");
        assert_eq!(failed.exit_code, Some(1));

        let moved = f.manager.execute(&id, "cd /srv", None).await.unwrap();
        assert_eq!(moved.current_path, "/srv");
        let info = f.manager.get_session_info(&id).unwrap();
        assert_eq!(info.current_path, "/srv");
        assert_eq!(info.host_name, "docker-01");
        assert_eq!(info.command_count, 2);
    }

    #[tokio::test]
    async fn test_sessions_share_one_connection() {
        let f = fixture(SessionConfig::default());
        let a = f.manager.create_session(1, None).await.unwrap();
        let b = f.manager.create_session(1, None).await.unwrap();

        assert_eq!(f.connector.handshakes(), 1);
        let conn_id = f.manager.get_session_info(&a).unwrap().connection_id;
        assert_eq!(f.manager.get_session_info(&b).unwrap().connection_id, conn_id);
        assert_eq!(f.pool.get(&conn_id).unwrap().channel_count(), 2);

        f.manager.close_session(&a, "done").await.unwrap();
        assert_eq!(f.pool.get(&conn_id).unwrap().channel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resets_shell_and_keeps_directory() {
        let config = SessionConfig {
            execute_timeout_secs: 2,
            ..Default::default()
        };
        let f = fixture(config);
        let id = f.manager.create_session(1, None).await.unwrap();
        f.manager.execute(&id, "cd /opt", None).await.unwrap();

        let err = f.manager.execute(&id, "hang", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(2)));
        assert_eq!(err.code(), ErrorCode::SessionTimeout);

        let opened = f.connector.shells_opened();
        let result = f.manager.execute(&id, "pwd", None).await.unwrap();
        assert_eq!(result.output, "/opt");
        assert_eq!(f.connector.shells_opened(), opened + 1);

        let conn_id = f.manager.get_session_info(&id).unwrap().connection_id;
        assert!(f.pool.get(&conn_id).is_some());
        let history = f.manager.history(&id).unwrap();
        assert_eq!(history[1].command, "hang");
        assert_eq!(history[1].exit_code, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resets_shell_with_a_caller_queued() {
        let config = SessionConfig {
            execute_timeout_secs: 2,
            ..Default::default()
        };
        let f = fixture(config);
        let id = f.manager.create_session(1, None).await.unwrap();
        let opened = f.connector.shells_opened();

        let stuck = {
            let manager = f.manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.execute(&id, "hang", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = {
            let manager = f.manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.execute(&id, "echo ok", None).await })
        };

        let err = stuck.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Timeout(2)));
        let result = queued.await.unwrap().unwrap();
        assert_eq!(result.output, "ok");
        assert_eq!(f.connector.shells_opened(), opened + 1);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_commands() {
        let f = fixture(SessionConfig::default());
        let id = f.manager.create_session(1, None).await.unwrap();
        f.manager.close_session(&id, "client request").await.unwrap();

        let opened = f.connector.shells_opened();
        let err = f.manager.execute(&id, "echo hi", None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(f.connector.shells_opened(), opened);
        assert!(f.manager.close_session(&id, "again").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_creates_no_session() {
        let f = fixture(SessionConfig::default());
        f.connector.set_unreachable(1, true);

        let err = f.manager.create_session(1, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransportFailure);
        assert_eq!(f.manager.session_count(), 0);
        assert_eq!(f.manager.stats().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let f = fixture(SessionConfig::default());
        let err = f.manager.create_session(42, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::HostNotFound);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let config = SessionConfig {
            max_sessions: 1,
            ..Default::default()
        };
        let f = fixture(config);
        let first = f.manager.create_session(1, None).await.unwrap();
        let err = f.manager.create_session(2, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Capacity);

        f.manager.close_session(&first, "done").await.unwrap();
        assert!(f.manager.create_session(2, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_ownership_checks() {
        let f = fixture(SessionConfig::default());
        let alice = "client-a".to_string();
        let bob = "client-b".to_string();
        let id = f.manager.create_session(1, Some(alice.clone())).await.unwrap();

        let err = f.manager.execute(&id, "pwd", Some(&bob)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
        let err = f.manager.close_owned(&id, Some(&bob), "nope").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        assert!(f.manager.execute(&id, "pwd", Some(&alice)).await.is_ok());
        // Request/response callers are trusted
        assert!(f.manager.execute(&id, "pwd", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_client_sessions() {
        let f = fixture(SessionConfig::default());
        let owner = "client-a".to_string();
        f.manager.create_session(1, Some(owner.clone())).await.unwrap();
        f.manager.create_session(2, Some(owner.clone())).await.unwrap();
        let other = f.manager.create_session(1, Some("client-b".into())).await.unwrap();
        let mut events = f.manager.subscribe_events();

        assert_eq!(f.manager.close_client_sessions(&owner), 2);
        assert_eq!(f.manager.session_count(), 1);
        assert!(f.manager.get_session_info(&other).is_ok());

        let SessionEvent::Closed { reason, owner: closed_owner, .. } = events.recv().await.unwrap();
        assert_eq!(reason, "client disconnected");
        assert_eq!(closed_owner, Some(owner));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_are_evicted() {
        let config = SessionConfig {
            idle_timeout_secs: 60,
            ..Default::default()
        };
        let f = fixture(config);
        let stale = f.manager.create_session(1, None).await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        let fresh = f.manager.create_session(2, None).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(f.manager.evict_idle(), 1);
        assert!(f.manager.get_session_info(&stale).is_err());
        assert!(f.manager.get_session_info(&fresh).is_ok());
    }

    #[tokio::test]
    async fn test_connection_loss_cascades() {
        let f = fixture(SessionConfig::default());
        let tasks = f.manager.spawn_maintenance();
        let mut events = f.manager.subscribe_events();
        let id = f.manager.create_session(1, None).await.unwrap();

        f.connector.last_transport().unwrap().drop_link();

        let SessionEvent::Closed { session_id, reason, .. } =
            tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(session_id, id);
        assert!(reason.starts_with("connection closed"));
        assert_eq!(f.manager.session_count(), 0);

        f.manager.shutdown();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = SessionConfig {
            history_capacity: 2,
            ..Default::default()
        };
        let f = fixture(config);
        let id = f.manager.create_session(1, None).await.unwrap();
        for cmd in ["echo a", "echo b", "echo c"] {
            f.manager.execute(&id, cmd, None).await.unwrap();
        }
        let commands: Vec<String> = f.manager.history(&id).unwrap().into_iter().map(|e| e.command).collect();
        assert_eq!(commands, vec!["echo b", "echo c"]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let f = fixture(SessionConfig::default());
        f.manager.create_session(1, None).await.unwrap();
        f.manager.shutdown();
        assert_eq!(f.manager.session_count(), 0);
        assert!(f.manager.create_session(1, None).await.is_err());
    }
}
