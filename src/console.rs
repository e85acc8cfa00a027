//! Console lifecycle
//!
//! Wires the pool, sessions, terminals, monitoring and gateway together,
//! owns their background tasks and exposes the request/response API used
//! by in-process callers.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge::{Authenticator, Gateway};
use crate::config::ConsoleConfig;
use crate::container::{ContainerControl, SshContainerControl};
use crate::hosts::HostRegistry;
use crate::monitor::{MonitoringAggregator, MonitoringSnapshot};
use crate::router::SubscriptionRegistry;
use crate::session::{
    ExecResult, HistoryEntry, SessionError, SessionEvent, SessionId, SessionInfo, SessionManager,
    TerminalStreamer,
};
use crate::ssh::{ConnectionInfo, ConnectionPool, Connector, HostId};

pub const CLOSED_BY_REQUEST: &str = "closed by request";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleStats {
    pub active_connections: usize,
    pub active_sessions: usize,
    pub poll_interval_ms: u64,
}

pub struct Console {
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionManager>,
    terminals: Arc<TerminalStreamer>,
    monitor: Arc<MonitoringAggregator>,
    subscriptions: Arc<SubscriptionRegistry>,
    gateway: Arc<Gateway>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Console {
    /// Build every component and start the maintenance tasks.
    ///
    /// `container_control` defaults to running `docker` over the pool.
    /// Must be called from inside a tokio runtime.
    pub fn initialize(
        config: ConsoleConfig,
        host_registry: Arc<dyn HostRegistry>,
        authenticator: Arc<dyn Authenticator>,
        container_control: Option<Arc<dyn ContainerControl>>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let pool = ConnectionPool::new(connector, config.pool);
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let sessions = SessionManager::new(pool.clone(), host_registry.clone(), config.sessions);
        let terminals = TerminalStreamer::new(sessions.clone());
        let monitor = MonitoringAggregator::new(
            pool.clone(),
            host_registry.clone(),
            subscriptions.clone(),
            config.monitoring,
        );
        let containers = container_control.unwrap_or_else(|| {
            Arc::new(SshContainerControl::with_config(
                pool.clone(),
                host_registry,
                config.containers,
            ))
        });
        let gateway = Gateway::new(
            config.gateway,
            sessions.clone(),
            terminals.clone(),
            monitor.clone(),
            subscriptions.clone(),
            containers,
            authenticator,
        );

        let mut tasks = vec![pool.spawn_sweeper()];
        tasks.extend(sessions.spawn_maintenance());
        tasks.extend(monitor.spawn());
        tasks.extend(gateway.spawn());
        info!("Console initialized ({} background task(s))", tasks.len());

        Arc::new(Self {
            pool,
            sessions,
            terminals,
            monitor,
            subscriptions,
            gateway,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn terminals(&self) -> &Arc<TerminalStreamer> {
        &self.terminals
    }

    pub fn monitor(&self) -> &Arc<MonitoringAggregator> {
        &self.monitor
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    // ─── Request/response API ─────────────────────────────────────────────

    pub async fn create_session(&self, host_id: HostId) -> Result<SessionId, SessionError> {
        self.sessions.create_session(host_id, None).await
    }

    pub async fn execute(&self, session_id: &str, command: &str) -> Result<ExecResult, SessionError> {
        self.sessions.execute(session_id, command, None).await
    }

    pub fn get_session_info(&self, session_id: &str) -> Result<SessionInfo, SessionError> {
        self.sessions.get_session_info(session_id)
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list_sessions()
    }

    pub fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, SessionError> {
        self.sessions.history(session_id)
    }

    pub async fn close_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.sessions.close_session(session_id, CLOSED_BY_REQUEST).await
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.pool.list()
    }

    pub fn current_snapshot(
        &self,
        host_id: HostId,
        container_id: Option<&str>,
    ) -> Option<MonitoringSnapshot> {
        self.monitor.current_snapshot(host_id, container_id)
    }

    pub fn subscribe_session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe_events()
    }

    pub fn stats(&self) -> ConsoleStats {
        ConsoleStats {
            active_connections: self.pool.connection_count(),
            active_sessions: self.sessions.session_count(),
            poll_interval_ms: self.monitor.config().host_interval_ms,
        }
    }

    /// Disconnect clients, stop polling, close sessions then connections
    pub async fn shutdown(&self) {
        info!("Console shutting down");
        self.gateway.shutdown();
        self.monitor.shutdown();
        self.sessions.shutdown();
        self.pool.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        debug!("Console background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bridge::{Identity, ServerEvent, StaticTokenAuthenticator};
    use crate::container::ContainerAction;
    use crate::error::ErrorCode;
    use crate::hosts::StaticHostRegistry;
    use crate::testing::{host, MockConnector};

    fn console(connector: &Arc<MockConnector>) -> Arc<Console> {
        let mut config = ConsoleConfig::default();
        config.gateway.tokens.insert("tok".into(), "alice".into());
        let authenticator = Arc::new(StaticTokenAuthenticator::new(&config.gateway.tokens));
        let hosts = Arc::new(StaticHostRegistry::new([host(1), host(2)]));
        Console::initialize(config, hosts, authenticator, None, connector.clone())
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let connector = MockConnector::new();
        let console = console(&connector);

        let id = console.create_session(1).await.unwrap();
        let result = console.execute(&id, "ansi").await.unwrap();
        assert_eq!(result.output, "test");

        let info = console.get_session_info(&id).unwrap();
        assert_eq!(info.host_id, 1);
        assert_eq!(info.host_name, "docker-01");
        assert_eq!(console.history(&id).unwrap().len(), 1);
        assert_eq!(console.list_sessions().len(), 1);

        console.close_session(&id).await.unwrap();
        let err = console.execute(&id, "echo hi").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(console.stats().active_sessions, 0);

        console.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_wire_format() {
        let connector = MockConnector::new();
        let console = console(&connector);
        let _id = console.create_session(2).await.unwrap();

        let stats = console.stats();
        assert_eq!(stats.active_sessions, 1);
        assert!(stats.active_connections >= 1);
        assert!(console.list_connections().iter().any(|c| c.host_id == 2));

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["activeSessions"], 1);
        assert_eq!(json["pollIntervalMs"], 5000);
        assert!(json.get("activeConnections").is_some());

        console.shutdown().await;
    }

    #[tokio::test]
    async fn test_monitoring_runs_after_initialize() {
        let connector = MockConnector::new();
        let console = console(&connector);

        let mut snapshot = None;
        for _ in 0..200 {
            snapshot = console.current_snapshot(1, None);
            if snapshot.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = snapshot.expect("host 1 was never polled");
        assert!(!snapshot.error);
        assert!(snapshot.metrics.memory_total.is_some());

        console.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_link_closes_sessions() {
        let connector = MockConnector::new();
        let console = console(&connector);
        let mut events = console.subscribe_session_events();

        let id = console.create_session(1).await.unwrap();
        let conn_id = console.get_session_info(&id).unwrap().connection_id;
        console.pool().get(&conn_id).unwrap().transport().disconnect().await;

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let SessionEvent::Closed { session_id, .. } = event;
        assert_eq!(session_id, id);
        assert!(console.get_session_info(&id).is_err());

        console.shutdown().await;
    }

    #[tokio::test]
    async fn test_default_container_control() {
        let connector = MockConnector::new();
        let console = console(&connector);

        let mut client = console
            .gateway()
            .connect_client(Identity { user: "alice".into() });
        let message = serde_json::json!({
            "type": "container_action",
            "hostId": 1,
            "containerId": "web",
            "action": "restart",
        });
        console
            .gateway()
            .handle_text(&client.client_id, &message.to_string())
            .await;

        let updated = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), client.events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ServerEvent::ContainerUpdated { action, success, .. } = event {
                break (action, success);
            }
        };
        assert_eq!(updated, (ContainerAction::Restart, true));
        assert_eq!(connector.exec_count(1, "docker restart web"), 1);

        console.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let connector = MockConnector::new();
        let console = console(&connector);
        let id = console.create_session(1).await.unwrap();

        console.shutdown().await;
        assert!(console.get_session_info(&id).is_err());
        assert_eq!(console.pool().connection_count(), 0);
        assert!(console.create_session(1).await.is_err());
    }
}
