//! Monitoring types

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::ssh::HostId;

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_host_interval_ms")]
    pub host_interval_ms: u64,

    #[serde(default = "default_container_interval_ms")]
    pub container_interval_ms: u64,

    /// Remote probes running at the same time across all hosts
    #[serde(default = "default_max_concurrent_polls")]
    pub max_concurrent_polls: usize,

    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// A snapshot older than this many intervals is reported stale
    #[serde(default = "default_stale_after_intervals")]
    pub stale_after_intervals: u32,
}

fn default_host_interval_ms() -> u64 {
    5000
}

fn default_container_interval_ms() -> u64 {
    10000
}

fn default_max_concurrent_polls() -> usize {
    8
}

fn default_poll_timeout_secs() -> u64 {
    10
}

fn default_stale_after_intervals() -> u32 {
    3
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            host_interval_ms: default_host_interval_ms(),
            container_interval_ms: default_container_interval_ms(),
            max_concurrent_polls: default_max_concurrent_polls(),
            poll_timeout_secs: default_poll_timeout_secs(),
            stale_after_intervals: default_stale_after_intervals(),
        }
    }
}

/// Every field is optional: a probe may only partly succeed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSet {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub memory_used: Option<u64>,
    pub memory_total: Option<u64>,
    pub disk_percent: Option<f64>,
    pub net_rx_bytes_per_sec: Option<u64>,
    pub net_tx_bytes_per_sec: Option<u64>,
    /// Cumulative counters
    pub net_rx_bytes: Option<u64>,
    pub net_tx_bytes: Option<u64>,
    pub load_avg_1: Option<f64>,
    pub load_avg_5: Option<f64>,
    pub load_avg_15: Option<f64>,
    pub uptime_secs: Option<u64>,
}

/// Cache key: a host, or one container on it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub host_id: HostId,
    pub container_id: Option<String>,
}

/// Latest sample for a host or container, published whole
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSnapshot {
    pub host_id: HostId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    pub metrics: MetricSet,
    /// Unix milliseconds
    pub captured_at: u64,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Computed on read
    pub stale: bool,
}

impl MonitoringSnapshot {
    pub fn ok(host_id: HostId, metrics: MetricSet) -> Self {
        Self {
            host_id,
            container_id: None,
            container_name: None,
            metrics,
            captured_at: now_ms(),
            error: false,
            error_message: None,
            stale: false,
        }
    }

    pub fn failed(host_id: HostId, message: impl Into<String>) -> Self {
        Self {
            error: true,
            error_message: Some(message.into()),
            ..Self::ok(host_id, MetricSet::default())
        }
    }

    pub fn for_container(mut self, container_id: impl Into<String>, name: Option<String>) -> Self {
        self.container_id = Some(container_id.into());
        self.container_name = name.filter(|n| !n.is_empty());
        self
    }

    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            host_id: self.host_id,
            container_id: self.container_id.clone(),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_snapshot_has_no_metrics() {
        let snapshot = MonitoringSnapshot::failed(1, "connection refused");
        assert!(snapshot.error);
        assert_eq!(snapshot.metrics, MetricSet::default());
        assert_eq!(snapshot.key(), SnapshotKey { host_id: 1, container_id: None });
    }

    #[test]
    fn test_snapshot_wire_format() {
        let snapshot = MonitoringSnapshot::ok(
            2,
            MetricSet {
                cpu_percent: Some(42.0),
                ..Default::default()
            },
        )
        .for_container("abc", Some("web".into()));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["hostId"], 2);
        assert_eq!(json["containerId"], "abc");
        assert_eq!(json["metrics"]["cpuPercent"], 42.0);
        assert!(json.get("errorMessage").is_none());
    }
}
