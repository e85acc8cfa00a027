//! Container control collaborator
//!
//! Container lifecycle calls are one-shot remote commands. The gateway only
//! sees `ContainerControl`; `SshContainerControl` runs `docker <action>`
//! over a pooled connection.

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ErrorCode;
use crate::hosts::{HostRegistry, HostRegistryError};
use crate::ssh::{ConnectionPool, HostId, PoolError};

static CONTAINER_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("container id pattern is valid")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Upper bound on the remote `docker` call, not counting the handshake
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
}

fn default_action_timeout_secs() -> u64 {
    60
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            action_timeout_secs: default_action_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    Remove,
}

impl ContainerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
            ContainerAction::Remove => "remove",
        }
    }

    /// `docker` subcommand for this action
    fn docker_command(self) -> &'static str {
        match self {
            ContainerAction::Remove => "rm",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ContainerError {
    #[error("Invalid container id: {0:?}")]
    InvalidId(String),

    #[error("docker {action} {container_id} failed: {message}")]
    Failed {
        container_id: String,
        action: ContainerAction,
        message: String,
    },

    #[error("docker {action} {container_id} timed out after {secs}s")]
    Timeout {
        container_id: String,
        action: ContainerAction,
        secs: u64,
    },

    #[error(transparent)]
    Host(#[from] HostRegistryError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ContainerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ContainerError::InvalidId(_) => ErrorCode::BadRequest,
            ContainerError::Failed { .. } | ContainerError::Timeout { .. } => {
                ErrorCode::ContainerFailure
            }
            ContainerError::Host(e) => e.code(),
            ContainerError::Pool(e) => e.code(),
        }
    }
}

pub fn is_valid_container_id(container_id: &str) -> bool {
    CONTAINER_ID.is_match(container_id)
}

#[async_trait]
pub trait ContainerControl: Send + Sync {
    /// Run `action` on one container; returns the remote output on success
    async fn perform(
        &self,
        host_id: HostId,
        container_id: &str,
        action: ContainerAction,
    ) -> Result<String, ContainerError>;
}

/// Runs `docker` on the host through the connection pool
pub struct SshContainerControl {
    pool: Arc<ConnectionPool>,
    hosts: Arc<dyn HostRegistry>,
    config: ContainerConfig,
}

impl SshContainerControl {
    pub fn new(pool: Arc<ConnectionPool>, hosts: Arc<dyn HostRegistry>) -> Self {
        Self::with_config(pool, hosts, ContainerConfig::default())
    }

    pub fn with_config(
        pool: Arc<ConnectionPool>,
        hosts: Arc<dyn HostRegistry>,
        config: ContainerConfig,
    ) -> Self {
        Self { pool, hosts, config }
    }
}

#[async_trait]
impl ContainerControl for SshContainerControl {
    async fn perform(
        &self,
        host_id: HostId,
        container_id: &str,
        action: ContainerAction,
    ) -> Result<String, ContainerError> {
        if !is_valid_container_id(container_id) {
            return Err(ContainerError::InvalidId(container_id.to_string()));
        }
        let host = self.hosts.get(host_id).await?;
        let connection = self.pool.acquire(&host).await?;
        let command = format!("docker {} {}", action.docker_command(), container_id);
        let secs = self.config.action_timeout_secs.max(1);
        let result = tokio::time::timeout(
            Duration::from_secs(secs),
            connection.transport().exec(&command),
        )
        .await;
        self.pool.release(&connection);

        let Ok(result) = result else {
            warn!("{} on host {} timed out after {}s", command, host_id, secs);
            return Err(ContainerError::Timeout {
                container_id: container_id.to_string(),
                action,
                secs,
            });
        };

        let failed = |message: String| ContainerError::Failed {
            container_id: container_id.to_string(),
            action,
            message,
        };
        let output = result.map_err(|e| failed(e.to_string()))?;
        match output.exit_code {
            Some(0) | None => {
                info!("docker {} {} on host {} succeeded", action, container_id, host_id);
                Ok(output.stdout.trim().to_string())
            }
            Some(code) => {
                let message = match output.stderr.trim() {
                    "" => format!("exit status {}", code),
                    stderr => stderr.to_string(),
                };
                warn!("docker {} {} on host {} failed: {}", action, container_id, host_id, message);
                Err(failed(message))
            }
        }
    }
}
