//! Channel pump
//!
//! Every russh channel is owned by one pump task. Callers never touch the
//! `Channel<Msg>` directly: they push `ChannelCommand`s and read
//! `ChannelOutput`s through bounded mpsc queues, so output order is the
//! order the remote produced it and a slow reader applies backpressure to
//! the SSH window instead of buffering without bound.
//!
//! Dropping every `ChannelWriter` sends EOF to the remote side; dropping the
//! output receiver closes the channel.

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::error::SshError;

/// Queue depth between the pump task and its consumer
const OUTPUT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 256;

/// Commands sent to a channel pump
#[derive(Debug)]
pub enum ChannelCommand {
    /// Data to send to the remote stdin
    Data(Bytes),
    /// Resize the PTY (cols, rows)
    Resize { cols: u32, rows: u32 },
    /// Close the channel immediately
    Close,
}

/// Output produced by the remote side, in production order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutput {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(u32),
    Closed,
}

/// Cloneable write half of a channel
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    commands: mpsc::Sender<ChannelCommand>,
}

impl ChannelWriter {
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), SshError> {
        self.commands
            .send(ChannelCommand::Data(data.into()))
            .await
            .map_err(|_| SshError::ChannelError("channel closed".to_string()))
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.commands
            .send(ChannelCommand::Resize { cols, rows })
            .await
            .map_err(|_| SshError::ChannelError("channel closed".to_string()))
    }

    /// Best-effort close; never blocks
    pub fn close(&self) {
        let _ = self.commands.try_send(ChannelCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// A logical channel on a connection: write half plus ordered output
#[derive(Debug)]
pub struct ShellChannel {
    writer: ChannelWriter,
    output: mpsc::Receiver<ChannelOutput>,
}

impl ShellChannel {
    /// Assemble a channel from raw queues (the pump, or an in-memory transport)
    pub fn from_parts(
        commands: mpsc::Sender<ChannelCommand>,
        output: mpsc::Receiver<ChannelOutput>,
    ) -> Self {
        Self {
            writer: ChannelWriter { commands },
            output,
        }
    }

    pub fn writer(&self) -> &ChannelWriter {
        &self.writer
    }

    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), SshError> {
        self.writer.write(data).await
    }

    /// Next output event; `None` once the pump has finished
    pub async fn recv(&mut self) -> Option<ChannelOutput> {
        self.output.recv().await
    }

    pub fn close(&self) {
        self.writer.close();
    }

    #[must_use = "dropping the receiver closes the channel"]
    pub fn split(self) -> (ChannelWriter, mpsc::Receiver<ChannelOutput>) {
        (self.writer, self.output)
    }
}

/// Spawn the pump task for an opened russh channel
pub fn spawn_channel_pump(mut channel: Channel<Msg>, label: String) -> ShellChannel {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ChannelCommand>(COMMAND_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel::<ChannelOutput>(OUTPUT_CAPACITY);

    tokio::spawn(async move {
        debug!("Channel pump started for {}", label);
        let mut input_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv(), if input_open => {
                    match cmd {
                        Some(ChannelCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                warn!("Failed to send data on {}: {}", label, e);
                                break;
                            }
                        }
                        Some(ChannelCommand::Resize { cols, rows }) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                // Resize failure leaves the channel usable
                                warn!("Failed to resize PTY on {}: {}", label, e);
                            } else {
                                debug!("PTY resized to {}x{} on {}", cols, rows, label);
                            }
                        }
                        Some(ChannelCommand::Close) => {
                            debug!("Close requested on {}", label);
                            break;
                        }
                        None => {
                            // All writers dropped: signal EOF but keep draining output
                            input_open = false;
                            let _ = channel.eof().await;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if out_tx.send(ChannelOutput::Stdout(Bytes::copy_from_slice(&data))).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            if ext == 1
                                && out_tx.send(ChannelOutput::Stderr(Bytes::copy_from_slice(&data))).await.is_err()
                            {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            trace!("Exit status {} on {}", exit_status, label);
                            let _ = out_tx.send(ChannelOutput::Exit(exit_status)).await;
                        }
                        Some(ChannelMsg::Eof) => {
                            trace!("EOF on {}", label);
                        }
                        Some(ChannelMsg::Close) | None => {
                            debug!("Channel {} closed by remote", label);
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        let _ = channel.close().await;
        let _ = out_tx.send(ChannelOutput::Closed).await;
        debug!("Channel pump terminated for {}", label);
    });

    ShellChannel::from_parts(cmd_tx, out_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_reports_closed_channel() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (_out_tx, out_rx) = mpsc::channel(1);
        let channel = ShellChannel::from_parts(cmd_tx, out_rx);
        drop(cmd_rx);
        assert!(channel.writer().is_closed());
        assert!(channel.write("ls\n").await.is_err());
    }

    #[tokio::test]
    async fn test_output_order_preserved() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let (out_tx, out_rx) = mpsc::channel(8);
        let mut channel = ShellChannel::from_parts(cmd_tx, out_rx);
        for chunk in ["a", "b", "c"] {
            out_tx
                .send(ChannelOutput::Stdout(Bytes::from(chunk)))
                .await
                .unwrap();
        }
        drop(out_tx);
        let mut seen = Vec::new();
        while let Some(ChannelOutput::Stdout(b)) = channel.recv().await {
            seen.push(b);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }
}
