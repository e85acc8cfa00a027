//! Console configuration file
//!
//! Every section has `#[serde(default)]`, so a file only needs the keys it
//! changes. Section types live with the component they configure.

use serde::{Deserialize, Serialize};

use crate::bridge::GatewayConfig;
use crate::container::ContainerConfig;
use crate::monitor::MonitoringConfig;
use crate::session::SessionConfig;
use crate::ssh::{HostConfig, PoolConfig};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub containers: ContainerConfig,

    /// Hosts served by the built-in static registry
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            gateway: GatewayConfig::default(),
            pool: PoolConfig::default(),
            sessions: SessionConfig::default(),
            monitoring: MonitoringConfig::default(),
            containers: ContainerConfig::default(),
            hosts: Vec::new(),
        }
    }
}
