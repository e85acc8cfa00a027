//! Handle Owner Task
//!
//! Exactly one task owns the russh `Handle<ClientHandler>` of a connection.
//! Transports, the pool's liveness check and jump-host tunnels talk to it
//! through a cloneable `HandleController`: a command goes over an mpsc
//! queue and the answer comes back on a oneshot. Nothing holds a lock
//! across an `.await` on the handle.
//!
//! When russh reports the handle closed the owner exits and every
//! `subscribe_disconnect` receiver fires; the pool turns that into
//! `PoolEvent::Closed`.

use std::ops::ControlFlow;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

const COMMAND_QUEUE: usize = 64;
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping outcome, distinguishing slow links from dead ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No answer in time; the link may recover
    Timeout,
    /// Connection is gone
    IoError,
}

type ChannelReply = oneshot::Sender<Result<Channel<Msg>, russh::Error>>;

pub enum HandleCommand {
    /// Session channel for a shell or an exec
    OpenSession { reply_tx: ChannelReply },
    /// Tunnel to the next hop of a jump chain
    OpenDirectTcpip {
        host: String,
        port: u32,
        reply_tx: ChannelReply,
    },
    Ping { reply_tx: oneshot::Sender<PingResult> },
    Disconnect,
}

impl HandleCommand {
    /// Answer without touching the handle; used once the owner is exiting
    fn refuse(self) {
        match self {
            HandleCommand::OpenSession { reply_tx }
            | HandleCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Fires once when the owner exits.
    ///
    /// A receiver created after that never fires; check `is_connected()`
    /// after subscribing.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Whether the owner task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HandleCommand,
    ) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(build(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        self.request(|reply_tx| HandleCommand::OpenSession { reply_tx })
            .await
            .ok_or(SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Channel<Msg>, SshError> {
        let host = host.to_string();
        self.request(|reply_tx| HandleCommand::OpenDirectTcpip {
            host,
            port: u32::from(port),
            reply_tx,
        })
        .await
        .ok_or(SshError::Disconnected)?
        .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn ping(&self) -> PingResult {
        self.request(|reply_tx| HandleCommand::Ping { reply_tx })
            .await
            .unwrap_or(PingResult::IoError)
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }
}

struct HandleOwner {
    handle: Handle<ClientHandler>,
    label: String,
}

impl HandleOwner {
    async fn run(self, mut cmd_rx: mpsc::Receiver<HandleCommand>, disconnect_tx: broadcast::Sender<()>) {
        let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!("Handle owner started for {}", self.label);

        loop {
            let flow = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.serve(cmd).await,
                    None => {
                        debug!("Every controller of {} dropped", self.label);
                        ControlFlow::Break(())
                    }
                },
                _ = liveness.tick() => {
                    if self.handle.is_closed() {
                        warn!("SSH connection {} closed by remote", self.label);
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
            };
            if flow.is_break() {
                break;
            }
        }

        // Close the queue before signalling so late subscribers see
        // is_connected() == false
        refuse_pending(&mut cmd_rx);
        let _ = disconnect_tx.send(());

        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "connection closed", "en")
            .await;
        info!("SSH connection {} released", self.label);
    }

    async fn serve(&self, cmd: HandleCommand) -> ControlFlow<()> {
        match cmd {
            HandleCommand::OpenSession { reply_tx } => {
                let result = self.handle.channel_open_session().await;
                if reply_tx.send(result).is_err() {
                    // The channel is dropped here and closed by the server
                    debug!("Caller left before its session channel opened on {}", self.label);
                }
            }
            HandleCommand::OpenDirectTcpip { host, port, reply_tx } => {
                let result = self
                    .handle
                    .channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
                    .await;
                let _ = reply_tx.send(result);
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(self.keepalive().await);
            }
            HandleCommand::Disconnect => {
                debug!("Disconnect requested for {}", self.label);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn keepalive(&self) -> PingResult {
        match tokio::time::timeout(KEEPALIVE_TIMEOUT, self.handle.send_keepalive(true)).await {
            Ok(Ok(())) => PingResult::Ok,
            Ok(Err(e)) if self.handle.is_closed() => {
                warn!("Keepalive failed on {}: {}", self.label, e);
                PingResult::IoError
            }
            Ok(Err(e)) => {
                warn!("Keepalive failed on {}: {}", self.label, e);
                PingResult::Timeout
            }
            Err(_) => {
                warn!("Keepalive timed out on {}", self.label);
                PingResult::Timeout
            }
        }
    }
}

/// Move the handle into its owner task and return the controller
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (disconnect_tx, _) = broadcast::channel(1);

    let owner = HandleOwner { handle, label };
    tokio::spawn(owner.run(cmd_rx, disconnect_tx.clone()));

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

fn refuse_pending(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        cmd.refuse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_commands_are_refused() {
        let (tx, mut rx) = mpsc::channel(4);
        let (ping_tx, ping_rx) = oneshot::channel();
        let (open_tx, open_rx) = oneshot::channel();
        tx.send(HandleCommand::Ping { reply_tx: ping_tx }).await.unwrap();
        tx.send(HandleCommand::OpenSession { reply_tx: open_tx })
            .await
            .unwrap();
        tx.send(HandleCommand::Disconnect).await.unwrap();

        refuse_pending(&mut rx);

        assert_eq!(ping_rx.await.unwrap(), PingResult::IoError);
        assert!(open_rx.await.unwrap().is_err());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_controller_without_owner() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (disconnect_tx, _) = broadcast::channel(1);
        let controller = HandleController {
            cmd_tx,
            disconnect_tx,
        };
        drop(cmd_rx);

        assert!(!controller.is_connected());
        assert_eq!(controller.ping().await, PingResult::IoError);
        assert!(matches!(
            controller.open_session_channel().await,
            Err(SshError::Disconnected)
        ));
    }
}
