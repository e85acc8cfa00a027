//! Command shell protocol
//!
//! A session runs its commands in one long-lived non-PTY shell, so `cd` and
//! exported variables carry over between calls. Every command is followed
//! by a unique end marker written to both streams:
//!
//! ```text
//! stdout: <output>\n<marker>:<exit status>:<cwd>\n
//! stderr: <errors>\n<marker>\n
//! ```
//!
//! `run` returns once both markers have been seen. It is not cancel safe: a
//! shell whose `run` was abandoned may still print the old command's output
//! and must be dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::types::SessionError;
use crate::ssh::{ChannelOutput, ChannelWriter, Transport};

/// Silences prompts so only command output reaches stdout
const INIT_COMMAND: &str = "export PS1='' PS2='' LANG=C LC_ALL=C";

#[derive(Debug, Default)]
pub struct RawOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub cwd: Option<String>,
}

pub struct CommandShell {
    writer: ChannelWriter,
    output: mpsc::Receiver<ChannelOutput>,
}

impl CommandShell {
    /// Open a shell, silence it and optionally move to `cwd`.
    /// Returns the shell and its working directory.
    pub async fn open(
        transport: &Arc<dyn Transport>,
        cwd: Option<&str>,
    ) -> Result<(Self, String), SessionError> {
        let channel = transport.open_shell(None).await?;
        let (writer, output) = channel.split();
        let mut shell = Self { writer, output };

        let init = match cwd {
            Some(dir) => format!("{}\ncd {}", INIT_COMMAND, quote(dir)),
            None => INIT_COMMAND.to_string(),
        };
        let outcome = shell.run(&init).await?;
        let cwd = outcome.cwd.unwrap_or_default();
        debug!("Command shell ready in {}", cwd);
        Ok((shell, cwd))
    }

    pub async fn run(&mut self, command: &str) -> Result<RawOutcome, SessionError> {
        let marker = format!("__DOCKYARD_END_{}__", Uuid::new_v4().simple());
        self.writer
            .write(wrap(command, &marker))
            .await
            .map_err(|_| SessionError::ShellExited)?;

        let stdout_tag = format!("\n{}:", marker);
        let stderr_tag = format!("\n{}\n", marker);
        let mut outcome = RawOutcome::default();
        let mut status_seen = false;
        let mut stderr_done = false;

        while !(status_seen && stderr_done) {
            match self.output.recv().await {
                Some(ChannelOutput::Stdout(data)) if !status_seen => {
                    outcome.stdout.extend_from_slice(&data);
                    if let Some((pos, exit_code, cwd)) = parse_status(&outcome.stdout, &stdout_tag) {
                        outcome.stdout.truncate(pos);
                        outcome.exit_code = exit_code;
                        outcome.cwd = Some(cwd);
                        status_seen = true;
                    }
                }
                Some(ChannelOutput::Stderr(data)) if !stderr_done => {
                    outcome.stderr.extend_from_slice(&data);
                    if let Some(pos) = find(&outcome.stderr, stderr_tag.as_bytes()) {
                        outcome.stderr.truncate(pos);
                        stderr_done = true;
                    }
                }
                Some(ChannelOutput::Stdout(_)) | Some(ChannelOutput::Stderr(_)) => {
                    trace!("Ignoring output after end marker");
                }
                Some(ChannelOutput::Exit(code)) => {
                    debug!("Command shell exited with status {}", code);
                    return Err(SessionError::ShellExited);
                }
                Some(ChannelOutput::Closed) | None => return Err(SessionError::ShellExited),
            }
        }
        Ok(outcome)
    }

    pub fn close(&self) {
        self.writer.close();
    }
}

fn wrap(command: &str, marker: &str) -> String {
    format!(
        "{command}\n__dy_rc=$?; printf '\\n{marker}:%s:%s\\n' \"$__dy_rc\" \"$(pwd)\"; printf '\\n{marker}\\n' >&2\n"
    )
}

/// Single-quote for the shell
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Locate `\n<marker>:<exit>:<cwd>\n`; needs the full line to have arrived
fn parse_status(buf: &[u8], tag: &str) -> Option<(usize, Option<i32>, String)> {
    let pos = find(buf, tag.as_bytes())?;
    let rest = &buf[pos + tag.len()..];
    let end = rest.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&rest[..end]);
    let (exit, cwd) = line.split_once(':')?;
    Some((pos, exit.trim().parse().ok(), cwd.to_string()))
}
