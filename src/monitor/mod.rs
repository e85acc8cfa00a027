//! Host and container monitoring
//!
//! - `probe`: remote commands and their parsers (`/proc`, `df`, `docker stats`)
//! - `MonitoringAggregator`: poll loops, snapshot cache, history and the
//!   snapshot broadcast consumed by the gateway

mod aggregator;
pub mod probe;
mod types;

pub use aggregator::{MonitoringAggregator, HISTORY_CAPACITY};
pub use types::{MetricSet, MonitoringConfig, MonitoringSnapshot, SnapshotKey};
