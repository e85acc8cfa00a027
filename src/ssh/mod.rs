//! SSH module - pooled connections to managed hosts
//!
//! # Features
//! - Direct and jump-host (SSH-over-SSH) connections
//! - Password, key file and inline key authentication
//! - Optional host key pinning
//! - Connection pool with coalesced handshakes, backoff and idle eviction

mod backoff;
mod channel;
mod client;
mod config;
pub mod connection_pool;
mod error;
mod handle_owner;
mod transport;

pub use backoff::BackoffPolicy;
pub use channel::{ChannelCommand, ChannelOutput, ChannelWriter, ShellChannel};
pub use client::{fingerprint, ClientHandler, SshClient};
pub use config::{AuthMethod, HostConfig, HostId, HostIdentity, ProxyConfig, PtySize};
pub use connection_pool::{
    Connection, ConnectionId, ConnectionInfo, ConnectionPool, ConnectionState, PoolConfig,
    PoolError, PoolEvent, PoolStats,
};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use transport::{Connector, ExecOutput, RusshConnector, SshTransport, Transport};
