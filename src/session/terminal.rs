//! Terminal Streamer
//!
//! Bridges a session's interactive PTY to a stream of sanitized output
//! events. One PTY and one stream per session; output keeps the order the
//! remote produced it, and a slow consumer slows the pump down instead of
//! losing bytes.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::manager::SessionManager;
use super::sanitize::StreamSanitizer;
use super::types::{SessionError, SessionId};
use crate::router::ClientId;
use crate::ssh::{ChannelOutput, ChannelWriter, PtySize};

pub const SHELL_EXITED: &str = "remote shell exited";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    Output {
        session_id: SessionId,
        seq: u64,
        data: String,
    },
    /// Always the last event of a stream
    Closed { session_id: SessionId, reason: String },
}

pub struct TerminalStreamer {
    sessions: Arc<SessionManager>,
    writers: DashMap<SessionId, ChannelWriter>,
    pty: PtySize,
    output_queue: usize,
}

impl TerminalStreamer {
    pub fn new(sessions: Arc<SessionManager>) -> Arc<Self> {
        let config = sessions.config();
        let pty = PtySize {
            cols: config.terminal_cols,
            rows: config.terminal_rows,
        };
        let output_queue = config.output_queue.max(1);
        Arc::new(Self {
            sessions,
            writers: DashMap::new(),
            pty,
            output_queue,
        })
    }

    /// Open the session's PTY and start streaming its output
    pub async fn attach(
        self: &Arc<Self>,
        session_id: &str,
        requester: Option<&ClientId>,
    ) -> Result<mpsc::Receiver<TerminalEvent>, SessionError> {
        let entry = self.sessions.authorize(session_id, requester)?;
        if !entry.claim_terminal() {
            return Err(SessionError::AlreadyAttached(session_id.to_string()));
        }

        let channel = match entry.connection().transport().open_shell(Some(self.pty)).await {
            Ok(channel) => channel,
            Err(e) => {
                entry.release_terminal();
                return Err(e.into());
            }
        };
        let (writer, mut output) = channel.split();
        self.writers.insert(entry.id.clone(), writer.clone());
        entry.touch();
        info!("Terminal attached to session {} ({}x{})", entry.id, self.pty.cols, self.pty.rows);

        let (tx, rx) = mpsc::channel(self.output_queue);
        let streamer = Arc::downgrade(self);
        let cancel = entry.cancel_token();

        tokio::spawn(async move {
            let session_id = entry.id.clone();
            let mut sanitizer = StreamSanitizer::new();
            let mut seq: u64 = 0;
            let mut consumer_gone = false;

            let shell_exited = loop {
                let msg = tokio::select! {
                    msg = output.recv() => msg,
                    _ = cancel.cancelled() => break false,
                };
                let data = match msg {
                    Some(ChannelOutput::Stdout(data)) | Some(ChannelOutput::Stderr(data)) => data,
                    Some(ChannelOutput::Exit(code)) => {
                        debug!("Terminal shell of session {} exited with status {}", session_id, code);
                        continue;
                    }
                    Some(ChannelOutput::Closed) | None => break true,
                };
                let clean = sanitizer.feed(&data);
                if clean.is_empty() {
                    continue;
                }
                seq += 1;
                let event = TerminalEvent::Output {
                    session_id: session_id.clone(),
                    seq,
                    data: String::from_utf8_lossy(&clean).into_owned(),
                };
                if tx.send(event).await.is_err() {
                    consumer_gone = true;
                    break false;
                }
            };

            writer.close();
            let rest = sanitizer.flush();
            if !rest.is_empty() && !consumer_gone {
                seq += 1;
                let _ = tx
                    .send(TerminalEvent::Output {
                        session_id: session_id.clone(),
                        seq,
                        data: String::from_utf8_lossy(&rest).into_owned(),
                    })
                    .await;
            }

            let streamer = streamer.upgrade();
            if let Some(streamer) = streamer.as_ref() {
                streamer.writers.remove(&session_id);
            }

            let reason = if let Some(reason) = entry.close_reason() {
                reason
            } else if shell_exited {
                if let Some(streamer) = streamer.as_ref() {
                    if let Err(e) = streamer.sessions.close_session(&session_id, SHELL_EXITED).await {
                        debug!("Session {} already gone after shell exit: {}", session_id, e);
                    }
                }
                SHELL_EXITED.to_string()
            } else {
                // Consumer dropped the stream; the session stays usable
                entry.release_terminal();
                "detached".to_string()
            };

            if !consumer_gone {
                let _ = tx
                    .send(TerminalEvent::Closed {
                        session_id: session_id.clone(),
                        reason: reason.clone(),
                    })
                    .await;
            }
            debug!("Terminal stream of session {} ended: {}", session_id, reason);
        });

        Ok(rx)
    }

    /// Forward client keystrokes to the session's PTY
    pub async fn write(
        &self,
        session_id: &str,
        data: impl Into<Bytes>,
        requester: Option<&ClientId>,
    ) -> Result<(), SessionError> {
        let entry = self.sessions.authorize(session_id, requester)?;
        let writer = self
            .writers
            .get(session_id)
            .map(|w| w.value().clone())
            .ok_or_else(|| SessionError::NotAttached(session_id.to_string()))?;
        entry.touch();
        writer.write(data).await.map_err(|e| {
            warn!("Terminal write to session {} failed: {}", session_id, e);
            SessionError::from(e)
        })
    }

    pub async fn resize(
        &self,
        session_id: &str,
        cols: u32,
        rows: u32,
        requester: Option<&ClientId>,
    ) -> Result<(), SessionError> {
        self.sessions.authorize(session_id, requester)?;
        let writer = self
            .writers
            .get(session_id)
            .map(|w| w.value().clone())
            .ok_or_else(|| SessionError::NotAttached(session_id.to_string()))?;
        debug!("Resizing terminal of session {} to {}x{}", session_id, cols, rows);
        writer.resize(cols, rows).await.map_err(SessionError::from)
    }

    pub fn attached_count(&self) -> usize {
        self.writers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::hosts::StaticHostRegistry;
    use crate::session::SessionConfig;
    use crate::ssh::{ConnectionPool, PoolConfig};
    use crate::testing::{host, MockConnector};
    use std::time::Duration;

    async fn setup() -> (Arc<MockConnector>, Arc<SessionManager>, Arc<TerminalStreamer>, SessionId) {
        let connector = MockConnector::new();
        let pool = ConnectionPool::new(connector.clone(), PoolConfig::default());
        let hosts = Arc::new(StaticHostRegistry::new([host(1)]));
        let manager = SessionManager::new(pool, hosts, SessionConfig::default());
        let streamer = TerminalStreamer::new(manager.clone());
        let id = manager.create_session(1, None).await.unwrap();
        (connector, manager, streamer, id)
    }

    async fn next(rx: &mut mpsc::Receiver<TerminalEvent>) -> TerminalEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_attach_streams_sanitized_output_in_order() {
        let (_connector, _manager, streamer, id) = setup().await;
        let mut rx = streamer.attach(&id, None).await.unwrap();

        assert_eq!(
            next(&mut rx).await,
            TerminalEvent::Output {
                session_id: id.clone(),
                seq: 1,
                data: "ops@docker:~$ ".to_string(),
            }
        );

        streamer.write(&id, "ls\n", None).await.unwrap();
        streamer.write(&id, "pwd\n", None).await.unwrap();
        let TerminalEvent::Output { seq, data, .. } = next(&mut rx).await else {
            panic!("expected output");
        };
        assert_eq!((seq, data.as_str()), (2, "ls\n"));
        let TerminalEvent::Output { seq, data, .. } = next(&mut rx).await else {
            panic!("expected output");
        };
        assert_eq!((seq, data.as_str()), (3, "pwd\n"));
    }

    #[tokio::test]
    async fn test_single_stream_per_session() {
        let (_connector, manager, streamer, id) = setup().await;
        let _rx = streamer.attach(&id, None).await.unwrap();
        let err = streamer.attach(&id, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert_eq!(streamer.attached_count(), 1);
        assert!(manager.get_session_info(&id).unwrap().terminal_attached);
    }

    #[tokio::test]
    async fn test_resize_reaches_pty() {
        let (connector, _manager, streamer, id) = setup().await;
        let _rx = streamer.attach(&id, None).await.unwrap();
        streamer.resize(&id, 120, 40, None).await.unwrap();

        let transport = connector.last_transport().unwrap();
        for _ in 0..50 {
            if !transport.resizes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.resizes(), vec![(120, 40)]);
    }

    #[tokio::test]
    async fn test_write_requires_attach() {
        let (_connector, _manager, streamer, id) = setup().await;
        let err = streamer.write(&id, "ls\n", None).await.unwrap_err();
        assert!(matches!(err, SessionError::NotAttached(_)));
        let err = streamer.write("missing", "ls\n", None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn test_shell_exit_closes_session() {
        let (_connector, manager, streamer, id) = setup().await;
        let mut rx = streamer.attach(&id, None).await.unwrap();
        streamer.write(&id, "exit\n", None).await.unwrap();

        let mut last = next(&mut rx).await;
        while matches!(last, TerminalEvent::Output { .. }) {
            last = next(&mut rx).await;
        }
        assert_eq!(
            last,
            TerminalEvent::Closed {
                session_id: id.clone(),
                reason: SHELL_EXITED.to_string(),
            }
        );
        assert!(rx.recv().await.is_none());
        assert!(manager.get_session_info(&id).is_err());
    }

    #[tokio::test]
    async fn test_session_close_ends_stream_with_reason() {
        let (_connector, manager, streamer, id) = setup().await;
        let mut rx = streamer.attach(&id, None).await.unwrap();
        assert!(matches!(next(&mut rx).await, TerminalEvent::Output { .. }));

        manager.close_session(&id, "closed by client").await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            TerminalEvent::Closed {
                session_id: id.clone(),
                reason: "closed by client".to_string(),
            }
        );
        let err = streamer.write(&id, "ls\n", None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
    }
}
