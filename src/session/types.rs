//! Session types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::hosts::HostRegistryError;
use crate::router::ClientId;
use crate::ssh::{HostId, PoolError, SshError};

pub type SessionId = String;

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_execute_timeout_secs")]
    pub execute_timeout_secs: u64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_terminal_cols")]
    pub terminal_cols: u32,

    #[serde(default = "default_terminal_rows")]
    pub terminal_rows: u32,

    /// Terminal output events buffered per attached stream
    #[serde(default = "default_output_queue")]
    pub output_queue: usize,
}

fn default_max_sessions() -> usize {
    64
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_execute_timeout_secs() -> u64 {
    30
}

fn default_history_capacity() -> usize {
    100
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_terminal_cols() -> u32 {
    80
}

fn default_terminal_rows() -> u32 {
    24
}

fn default_output_queue() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout_secs(),
            execute_timeout_secs: default_execute_timeout_secs(),
            history_capacity: default_history_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
            terminal_cols: default_terminal_cols(),
            terminal_rows: default_terminal_rows(),
            output_queue: default_output_queue(),
        }
    }
}

/// Result of one `execute` call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub output: String,
    pub error: String,
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
    /// Working directory after the command ran
    pub current_path: String,
}

/// Session info for the CRUD layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub host_id: HostId,
    pub host_name: String,
    pub current_path: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connection_id: String,
    pub command_count: usize,
    pub terminal_attached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub command: String,
    /// None when the command timed out
    pub exit_code: Option<i32>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Closed {
        session_id: SessionId,
        host_id: HostId,
        owner: Option<ClientId>,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub active_sessions: usize,
    pub attached_terminals: usize,
    pub max_sessions: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session limit reached ({max})")]
    LimitReached { max: usize },

    #[error("Session {0} belongs to another client")]
    Forbidden(SessionId),

    #[error("Command timed out after {0}s")]
    Timeout(u64),

    #[error("Session {0} is closed")]
    Closed(SessionId),

    #[error("Remote shell exited")]
    ShellExited,

    #[error("Terminal already attached to session {0}")]
    AlreadyAttached(SessionId),

    #[error("No terminal attached to session {0}")]
    NotAttached(SessionId),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Host(#[from] HostRegistryError),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound(_) | SessionError::Closed(_) => ErrorCode::SessionNotFound,
            SessionError::LimitReached { .. } => ErrorCode::Capacity,
            SessionError::Forbidden(_) => ErrorCode::Forbidden,
            SessionError::Timeout(_) => ErrorCode::SessionTimeout,
            SessionError::ShellExited => ErrorCode::TransportFailure,
            SessionError::AlreadyAttached(_) | SessionError::NotAttached(_) => {
                ErrorCode::BadRequest
            }
            SessionError::Pool(e) => e.code(),
            SessionError::Host(e) => e.code(),
            SessionError::Ssh(e) => e.code(),
        }
    }
}
