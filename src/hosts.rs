//! Host registry collaborator
//!
//! Host records (address, port, auth material, proxy) are owned by the CRUD
//! layer. The console only reads them through `HostRegistry`.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::ErrorCode;
use crate::ssh::{HostConfig, HostId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum HostRegistryError {
    #[error("Host not found: {0}")]
    NotFound(HostId),

    #[error("Host {0} is disabled")]
    Disabled(HostId),

    #[error("Host registry unavailable: {0}")]
    Unavailable(String),
}

impl HostRegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HostRegistryError::NotFound(_) | HostRegistryError::Disabled(_) => {
                ErrorCode::HostNotFound
            }
            HostRegistryError::Unavailable(_) => ErrorCode::Internal,
        }
    }
}

#[async_trait]
pub trait HostRegistry: Send + Sync {
    /// Look up one host; disabled hosts are reported as such
    async fn get(&self, host_id: HostId) -> Result<HostConfig, HostRegistryError>;

    /// Every enabled host, for the monitoring cycle
    async fn list(&self) -> Result<Vec<HostConfig>, HostRegistryError>;
}

/// In-memory registry fed from the config file
#[derive(Default)]
pub struct StaticHostRegistry {
    hosts: RwLock<HashMap<HostId, HostConfig>>,
}

impl StaticHostRegistry {
    pub fn new(hosts: impl IntoIterator<Item = HostConfig>) -> Self {
        Self {
            hosts: RwLock::new(hosts.into_iter().map(|h| (h.id, h)).collect()),
        }
    }

    /// Insert or replace a host record
    pub fn upsert(&self, host: HostConfig) {
        self.hosts.write().insert(host.id, host);
    }

    pub fn remove(&self, host_id: HostId) -> Option<HostConfig> {
        self.hosts.write().remove(&host_id)
    }
}

#[async_trait]
impl HostRegistry for StaticHostRegistry {
    async fn get(&self, host_id: HostId) -> Result<HostConfig, HostRegistryError> {
        let host = self
            .hosts
            .read()
            .get(&host_id)
            .cloned()
            .ok_or(HostRegistryError::NotFound(host_id))?;
        if !host.enabled {
            return Err(HostRegistryError::Disabled(host_id));
        }
        Ok(host)
    }

    async fn list(&self) -> Result<Vec<HostConfig>, HostRegistryError> {
        let mut hosts: Vec<HostConfig> = self
            .hosts
            .read()
            .values()
            .filter(|h| h.enabled)
            .cloned()
            .collect();
        hosts.sort_by_key(|h| h.id);
        Ok(hosts)
    }
}
