//! Monitoring Aggregator
//!
//! Two timers: host metrics every `host_interval_ms`, container metrics
//! every `container_interval_ms` (only for hosts someone subscribed to).
//! Each tick spawns one cycle; within a cycle every host is polled on its
//! own task, bounded by a semaphore. A host whose previous poll is still
//! running is skipped, so there is a single writer per cache key.
//!
//! Snapshots are replaced whole and only by newer ones.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::probe::{
    parse_docker_stats, parse_host_metrics, PreviousSample, CONTAINER_PROBE_COMMAND,
    HOST_PROBE_COMMAND,
};
use super::types::{now_ms, MonitoringConfig, MonitoringSnapshot, SnapshotKey};
use crate::hosts::HostRegistry;
use crate::router::{SubscriptionRegistry, TopicKind};
use crate::ssh::{ConnectionPool, ExecOutput, HostConfig, HostId};

/// Snapshots kept per key
pub const HISTORY_CAPACITY: usize = 60;

const EVENT_CAPACITY: usize = 1024;

const STOPPED: &str = "monitoring stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PollKind {
    Host,
    Containers,
}

/// Removes the in-flight mark when the poll ends, however it ends
struct InFlight<'a> {
    set: &'a DashSet<(HostId, PollKind)>,
    key: (HostId, PollKind),
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

pub struct MonitoringAggregator {
    pool: Arc<ConnectionPool>,
    hosts: Arc<dyn HostRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    config: MonitoringConfig,
    cache: DashMap<SnapshotKey, MonitoringSnapshot>,
    history: DashMap<SnapshotKey, VecDeque<MonitoringSnapshot>>,
    previous: DashMap<HostId, PreviousSample>,
    in_flight: DashSet<(HostId, PollKind)>,
    permits: Semaphore,
    events: broadcast::Sender<MonitoringSnapshot>,
    shutdown: CancellationToken,
}

impl MonitoringAggregator {
    pub fn new(
        pool: Arc<ConnectionPool>,
        hosts: Arc<dyn HostRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
        config: MonitoringConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let permits = Semaphore::new(config.max_concurrent_polls.max(1));
        Arc::new(Self {
            pool,
            hosts,
            subscriptions,
            config,
            cache: DashMap::new(),
            history: DashMap::new(),
            previous: DashMap::new(),
            in_flight: DashSet::new(),
            permits,
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Every published snapshot, in publish order
    pub fn subscribe(&self) -> broadcast::Receiver<MonitoringSnapshot> {
        self.events.subscribe()
    }

    /// Cached snapshot with its `stale` flag computed now
    pub fn current_snapshot(
        &self,
        host_id: HostId,
        container_id: Option<&str>,
    ) -> Option<MonitoringSnapshot> {
        let key = SnapshotKey {
            host_id,
            container_id: container_id.map(str::to_string),
        };
        let mut snapshot = self.cache.get(&key)?.clone();
        snapshot.stale = self.is_stale(&snapshot, now_ms());
        Some(snapshot)
    }

    /// Cached snapshots of a host, host-level first then containers by id
    pub fn host_snapshots(&self, host_id: HostId) -> Vec<MonitoringSnapshot> {
        let now = now_ms();
        let mut snapshots: Vec<MonitoringSnapshot> = self
            .cache
            .iter()
            .filter(|e| e.key().host_id == host_id)
            .map(|e| {
                let mut s = e.value().clone();
                s.stale = self.is_stale(&s, now);
                s
            })
            .collect();
        snapshots.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        snapshots
    }

    /// Oldest first, at most `HISTORY_CAPACITY`
    pub fn history(&self, host_id: HostId, container_id: Option<&str>) -> Vec<MonitoringSnapshot> {
        let key = SnapshotKey {
            host_id,
            container_id: container_id.map(str::to_string),
        };
        self.history
            .get(&key)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop everything known about a host
    pub fn forget_host(&self, host_id: HostId) {
        self.cache.retain(|k, _| k.host_id != host_id);
        self.history.retain(|k, _| k.host_id != host_id);
        self.previous.remove(&host_id);
        debug!("Forgot monitoring state of host {}", host_id);
    }

    fn is_stale(&self, snapshot: &MonitoringSnapshot, now: u64) -> bool {
        let interval = if snapshot.container_id.is_some() {
            self.config.container_interval_ms
        } else {
            self.config.host_interval_ms
        };
        let max_age = interval.saturating_mul(self.config.stale_after_intervals.max(1) as u64);
        now.saturating_sub(snapshot.captured_at) > max_age
    }

    /// Store and broadcast a snapshot unless a newer one is already cached
    pub(crate) fn publish(&self, snapshot: MonitoringSnapshot) -> bool {
        let key = snapshot.key();
        let accepted = match self.cache.entry(key.clone()) {
            Entry::Occupied(mut cached) => {
                if snapshot.captured_at < cached.get().captured_at {
                    false
                } else {
                    cached.insert(snapshot.clone());
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(snapshot.clone());
                true
            }
        };
        if !accepted {
            debug!("Discarding out-of-order snapshot for host {}", key.host_id);
            return false;
        }

        {
            let mut history = self.history.entry(key).or_default();
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }

        let _ = self.events.send(snapshot);
        true
    }

    // ─── Host cycle ───────────────────────────────────────────────────────

    /// Poll every enabled host once; returns the snapshots published
    pub async fn poll_hosts(self: &Arc<Self>) -> usize {
        let hosts = match self.hosts.list().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("Cannot list hosts for monitoring: {}", e);
                return 0;
            }
        };
        self.prune_missing(&hosts);

        let mut tasks = JoinSet::new();
        for host in hosts {
            let this = self.clone();
            tasks.spawn(async move { this.poll_host(&host).await });
        }
        let mut published = 0;
        while let Some(result) = tasks.join_next().await {
            if matches!(result, Ok(true)) {
                published += 1;
            }
        }
        published
    }

    /// Forget hosts that left the registry
    fn prune_missing(&self, hosts: &[HostConfig]) {
        let listed: HashSet<HostId> = hosts.iter().map(|h| h.id).collect();
        let known: HashSet<HostId> = self.cache.iter().map(|e| e.key().host_id).collect();
        for host_id in known.difference(&listed) {
            self.forget_host(*host_id);
        }
    }

    /// Poll one host; false if skipped or superseded
    pub async fn poll_host(&self, host: &HostConfig) -> bool {
        let Some(_guard) = self.begin(host.id, PollKind::Host) else {
            debug!("Host {} still being polled, skipping", host.id);
            return false;
        };

        if let Some(reason) = self.pool.unreachable_reason(host) {
            return self.publish(MonitoringSnapshot::failed(
                host.id,
                format!("host unreachable: {}", reason),
            ));
        }

        let snapshot = match self.probe(host, HOST_PROBE_COMMAND).await {
            Ok(output) => {
                let now = now_ms();
                let prev = self.previous.get(&host.id).map(|p| p.clone());
                let (metrics, sample) = parse_host_metrics(&output.stdout, prev.as_ref(), now);
                self.previous.insert(host.id, sample);
                MonitoringSnapshot::ok(host.id, metrics)
            }
            Err(message) => {
                warn!("Host {} poll failed: {}", host.id, message);
                MonitoringSnapshot::failed(host.id, message)
            }
        };
        self.publish(snapshot)
    }

    // ─── Container cycle ──────────────────────────────────────────────────

    /// Poll containers of every host with a container-metrics subscriber
    pub async fn poll_containers(self: &Arc<Self>) -> usize {
        let interested = self.subscriptions.interested_hosts(TopicKind::ContainerMetrics);
        if interested.is_empty() {
            return 0;
        }
        let hosts = match self.hosts.list().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("Cannot list hosts for container monitoring: {}", e);
                return 0;
            }
        };

        let mut tasks = JoinSet::new();
        for host in hosts.into_iter().filter(|h| interested.contains(&h.id)) {
            let this = self.clone();
            tasks.spawn(async move { this.poll_host_containers(&host).await });
        }
        let mut published = 0;
        while let Some(result) = tasks.join_next().await {
            published += result.unwrap_or(0);
        }
        published
    }

    pub async fn poll_host_containers(&self, host: &HostConfig) -> usize {
        let Some(_guard) = self.begin(host.id, PollKind::Containers) else {
            debug!("Containers of host {} still being polled, skipping", host.id);
            return 0;
        };

        let failure = match self.pool.unreachable_reason(host) {
            Some(reason) => Err(format!("host unreachable: {}", reason)),
            None => self.probe(host, CONTAINER_PROBE_COMMAND).await,
        };

        match failure {
            Ok(output) => {
                let samples = parse_docker_stats(&output.stdout);
                let seen: HashSet<&str> = samples.iter().map(|s| s.id.as_str()).collect();
                // Containers that disappeared
                self.cache.retain(|k, _| {
                    k.host_id != host.id
                        || k.container_id.as_deref().map_or(true, |id| seen.contains(id))
                });

                let mut published = 0;
                for sample in samples {
                    let snapshot = MonitoringSnapshot::ok(host.id, sample.metrics)
                        .for_container(sample.id, Some(sample.name));
                    if self.publish(snapshot) {
                        published += 1;
                    }
                }
                published
            }
            Err(message) => {
                warn!("Container poll of host {} failed: {}", host.id, message);
                let mut containers: HashSet<String> = self
                    .cache
                    .iter()
                    .filter(|e| e.key().host_id == host.id)
                    .filter_map(|e| e.key().container_id.clone())
                    .collect();
                containers.extend(self.subscribed_containers(host.id));

                let mut published = 0;
                for container_id in containers {
                    let snapshot = MonitoringSnapshot::failed(host.id, message.clone())
                        .for_container(container_id, None);
                    if self.publish(snapshot) {
                        published += 1;
                    }
                }
                published
            }
        }
    }

    fn subscribed_containers(&self, host_id: HostId) -> Vec<String> {
        self.subscriptions
            .all_topics()
            .into_iter()
            .filter(|t| t.host_id == host_id && t.kind == TopicKind::ContainerMetrics)
            .filter_map(|t| t.container_id)
            .collect()
    }

    // ─── Shared ───────────────────────────────────────────────────────────

    fn begin(&self, host_id: HostId, kind: PollKind) -> Option<InFlight<'_>> {
        let key = (host_id, kind);
        self.in_flight.insert(key).then_some(InFlight {
            set: &self.in_flight,
            key,
        })
    }

    /// Run `command` on a pooled connection, bounded by the semaphore and
    /// the poll timeout
    async fn probe(&self, host: &HostConfig, command: &str) -> Result<ExecOutput, String> {
        let Ok(_permit) = self.permits.acquire().await else {
            return Err(STOPPED.to_string());
        };
        let timeout = Duration::from_secs(self.config.poll_timeout_secs);
        let deadline = Instant::now() + timeout;
        let timed_out = || format!("poll timed out after {}s", timeout.as_secs());

        let conn = tokio::select! {
            result = tokio::time::timeout_at(deadline, self.pool.acquire(host)) => match result {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => return Err(timed_out()),
            },
            _ = self.shutdown.cancelled() => return Err(STOPPED.to_string()),
        };

        let result = tokio::select! {
            result = tokio::time::timeout_at(deadline, conn.transport().exec(command)) => match result {
                Ok(output) => output.map_err(|e| e.to_string()),
                Err(_) => Err(timed_out()),
            },
            _ = self.shutdown.cancelled() => Err(STOPPED.to_string()),
        };
        self.pool.release(&conn);
        result
    }

    /// Spawn the host and container poll loops
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let host_period = Duration::from_millis(self.config.host_interval_ms.max(100));
        let container_period = Duration::from_millis(self.config.container_interval_ms.max(100));
        info!(
            "Monitoring started (hosts every {:?}, containers every {:?})",
            host_period, container_period
        );
        vec![
            self.spawn_loop(host_period, PollKind::Host),
            self.spawn_loop(container_period, PollKind::Containers),
        ]
    }

    fn spawn_loop(self: &Arc<Self>, period: Duration, kind: PollKind) -> JoinHandle<()> {
        let aggregator = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                let Some(aggregator) = aggregator.upgrade() else { break };
                // Cycles may overlap; the in-flight guard keeps hosts apart
                tokio::spawn(async move {
                    match kind {
                        PollKind::Host => aggregator.poll_hosts().await,
                        PollKind::Containers => aggregator.poll_containers().await,
                    };
                });
            }
            debug!("{:?} poll loop stopped", kind);
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.permits.close();
        info!("Monitoring stopped");
    }
}
