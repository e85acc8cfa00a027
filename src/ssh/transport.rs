//! Transport seam between the pool and the SSH library
//!
//! The pool, sessions and monitoring only see `Transport` and `Connector`.
//! `RusshConnector` is the production implementation; tests plug in an
//! in-memory one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::broadcast;
use tracing::debug;

use super::channel::{spawn_channel_pump, ChannelOutput, ShellChannel};
use super::client::SshClient;
use super::config::{HostConfig, PtySize};
use super::error::SshError;
use super::handle_owner::{HandleController, PingResult};

/// Collected result of a one-shot remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

/// One authenticated connection to a host
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a shell channel; with `pty` the shell is interactive
    async fn open_shell(&self, pty: Option<PtySize>) -> Result<ShellChannel, SshError>;

    /// Run a command on its own channel and collect its output
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError>;

    async fn ping(&self) -> PingResult;

    fn is_connected(&self) -> bool;

    /// Fires once when the connection drops
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;

    async fn disconnect(&self);
}

/// Establishes transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &HostConfig,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, SshError>;
}

/// Connector backed by russh
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        host: &HostConfig,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, SshError> {
        let label = host.identity().to_string();
        let connection = SshClient::new(host.clone(), timeout).connect().await?;
        Ok(Arc::new(SshTransport {
            label,
            controller: connection.target,
            jump: connection.jump,
        }))
    }
}

/// russh connection, optionally tunnelled through a jump host
pub struct SshTransport {
    label: String,
    controller: HandleController,
    jump: Option<HandleController>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_shell(&self, pty: Option<PtySize>) -> Result<ShellChannel, SshError> {
        let channel = self.controller.open_session_channel().await?;

        if let Some(size) = pty {
            channel
                .request_pty(false, "xterm-256color", size.cols, size.rows, 0, 0, &[])
                .await
                .map_err(|e| SshError::ChannelError(format!("Failed to request PTY: {}", e)))?;
        }
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to request shell: {}", e)))?;

        debug!("Shell opened on {} (pty: {})", self.label, pty.is_some());
        Ok(spawn_channel_pump(channel, format!("shell@{}", self.label)))
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        let channel = self.controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to exec: {}", e)))?;

        let (writer, mut output) =
            spawn_channel_pump(channel, format!("exec@{}", self.label)).split();
        // No stdin for exec channels
        drop(writer);

        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();
        let mut exit_code = None;
        while let Some(event) = output.recv().await {
            match event {
                ChannelOutput::Stdout(data) => stdout.extend_from_slice(&data),
                ChannelOutput::Stderr(data) => stderr.extend_from_slice(&data),
                ChannelOutput::Exit(code) => exit_code = Some(code),
                ChannelOutput::Closed => break,
            }
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn ping(&self) -> PingResult {
        self.controller.ping().await
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    async fn disconnect(&self) {
        self.controller.disconnect().await;
        if let Some(jump) = &self.jump {
            jump.disconnect().await;
        }
    }
}
