//! In-memory transport for tests
//!
//! `MockConnector` hands out `MockTransport`s whose shells speak just enough
//! of the command protocol used by sessions, and whose `exec` answers the
//! monitoring probes with canned `/proc` and `docker stats` output.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::ssh::{
    AuthMethod, ChannelCommand, ChannelOutput, Connector, ExecOutput, HostConfig, HostId,
    PingResult, PtySize, ShellChannel, SshError, Transport,
};

pub const HOST_PROBE_OUTPUT: &str = r#"===STAT===
cpu  10132153 290696 3084719 46828483 16683 0 25195 0 0 0
===MEMINFO===
MemTotal:       16384000 kB
MemAvailable:    8192000 kB
===LOADAVG===
0.52 0.58 0.59 2/345 12345
===NETDEV===
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1234567     890    0    0    0     0          0         0  1234567     890    0    0    0     0       0          0
  eth0: 987654321  12345    0    0    0     0          0         0 123456789   6789    0    0    0     0       0          0
===UPTIME===
350735.47 234388.90
===DISK===
Filesystem     1024-blocks     Used Available Capacity Mounted on
/dev/sda1         41152736 12345678  26688276      32% /
===END==="#;

pub const DOCKER_STATS_OUTPUT: &str = concat!(
    r#"{"BlockIO":"0B / 0B","CPUPerc":"1.25%","Container":"a1b2c3d4e5f6","ID":"a1b2c3d4e5f6","MemPerc":"3.40%","MemUsage":"52.1MiB / 1.5GiB","Name":"web","NetIO":"1.2kB / 648B","PIDs":"4"}"#,
    "\n",
    r#"{"BlockIO":"0B / 0B","CPUPerc":"0.00%","Container":"ffeeddccbbaa","ID":"ffeeddccbbaa","MemPerc":"0.50%","MemUsage":"8MiB / 1.5GiB","Name":"db","NetIO":"0B / 0B","PIDs":"1"}"#,
    "\n"
);

/// A host record pointing at a fake address
pub fn host(id: HostId) -> HostConfig {
    HostConfig {
        id,
        name: Some(format!("docker-{:02}", id)),
        host: format!("10.0.0.{}", id),
        port: 22,
        username: "ops".to_string(),
        auth: AuthMethod::password("secret"),
        proxy: None,
        host_key_fingerprint: None,
        enabled: true,
    }
}

#[derive(Default)]
struct MockState {
    handshakes: AtomicUsize,
    handshake_delay: Mutex<Duration>,
    unreachable: Mutex<HashSet<HostId>>,
    auth_rejected: Mutex<HashSet<HostId>>,
    exec_failures: Mutex<HashSet<HostId>>,
    exec_delays: Mutex<HashMap<HostId, Duration>>,
    exec_log: Mutex<Vec<(HostId, String)>>,
    shells_opened: AtomicUsize,
}

#[derive(Default)]
pub struct MockConnector {
    state: Arc<MockState>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn shells_opened(&self) -> usize {
        self.state.shells_opened.load(Ordering::SeqCst)
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.state.handshake_delay.lock() = delay;
    }

    pub fn set_unreachable(&self, host_id: HostId, unreachable: bool) {
        toggle(&self.state.unreachable, host_id, unreachable);
    }

    pub fn set_auth_rejected(&self, host_id: HostId, rejected: bool) {
        toggle(&self.state.auth_rejected, host_id, rejected);
    }

    pub fn set_exec_failure(&self, host_id: HostId, failing: bool) {
        toggle(&self.state.exec_failures, host_id, failing);
    }

    pub fn set_exec_delay(&self, host_id: HostId, delay: Duration) {
        self.state.exec_delays.lock().insert(host_id, delay);
    }

    /// Commands run through `exec` on a host whose text contains `needle`
    pub fn exec_count(&self, host_id: HostId, needle: &str) -> usize {
        self.state
            .exec_log
            .lock()
            .iter()
            .filter(|(h, cmd)| *h == host_id && cmd.contains(needle))
            .count()
    }

    pub fn exec_log(&self) -> Vec<(HostId, String)> {
        self.state.exec_log.lock().clone()
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }
}

fn toggle(set: &Mutex<HashSet<HostId>>, host_id: HostId, on: bool) {
    let mut set = set.lock();
    if on {
        set.insert(host_id);
    } else {
        set.remove(&host_id);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        host: &HostConfig,
        _timeout: Duration,
    ) -> Result<Arc<dyn Transport>, SshError> {
        self.state.handshakes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.handshake_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.unreachable.lock().contains(&host.id) {
            return Err(SshError::ConnectionFailed(format!(
                "Connection refused: {}:{}",
                host.host, host.port
            )));
        }
        if self.state.auth_rejected.lock().contains(&host.id) {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        let (disconnect_tx, _) = broadcast::channel(1);
        let transport = Arc::new(MockTransport {
            host_id: host.id,
            state: self.state.clone(),
            connected: AtomicBool::new(true),
            silent: AtomicBool::new(false),
            disconnect_tx,
            resizes: Arc::new(Mutex::new(Vec::new())),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

pub struct MockTransport {
    host_id: HostId,
    state: Arc<MockState>,
    connected: AtomicBool,
    /// Half-open link: still looks connected but keepalives go unanswered
    silent: AtomicBool,
    disconnect_tx: broadcast::Sender<()>,
    resizes: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl MockTransport {
    /// Simulate the remote end going away
    pub fn drop_link(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.disconnect_tx.send(());
        }
    }

    pub fn go_silent(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.resizes.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_shell(&self, pty: Option<PtySize>) -> Result<ShellChannel, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        self.state.shells_opened.fetch_add(1, Ordering::SeqCst);

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let disconnect_rx = self.disconnect_tx.subscribe();
        if pty.is_some() {
            tokio::spawn(run_pty_shell(cmd_rx, out_tx, disconnect_rx, self.resizes.clone()));
        } else {
            tokio::spawn(run_command_shell(cmd_rx, out_tx, disconnect_rx));
        }
        Ok(ShellChannel::from_parts(cmd_tx, out_rx))
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        self.state
            .exec_log
            .lock()
            .push((self.host_id, command.to_string()));

        let delay = self.state.exec_delays.lock().get(&self.host_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.exec_failures.lock().contains(&self.host_id) {
            return Err(SshError::ChannelError("exec failed".to_string()));
        }

        let stdout = if command.contains("/proc/stat") {
            HOST_PROBE_OUTPUT.to_string()
        } else if command.contains("docker stats") {
            DOCKER_STATS_OUTPUT.to_string()
        } else if let Some(rest) = command.strip_prefix("docker ") {
            rest.split_whitespace().last().unwrap_or_default().to_string() + "\n"
        } else {
            String::new()
        };
        Ok(ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn ping(&self) -> PingResult {
        if self.is_connected() && !self.silent.load(Ordering::SeqCst) {
            PingResult::Ok
        } else {
            PingResult::IoError
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    async fn disconnect(&self) {
        self.drop_link();
    }
}

/// Reply of the fake command shell
struct ShellReply {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

impl ShellReply {
    fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }
}

/// `None` means the command never finishes
fn run_fake_command(command: &str, cwd: &mut String) -> Option<ShellReply> {
    let mut last = ShellReply::ok("");
    for line in command.lines() {
        let line = line.trim();
        if let Some(dir) = line.strip_prefix("cd ") {
            *cwd = dir.trim_matches('\'').to_string();
            last = ShellReply::ok("");
        } else if let Some(text) = line.strip_prefix("echo ") {
            last = ShellReply::ok(format!("{}\n", text));
        } else if line == "pwd" {
            last = ShellReply::ok(format!("{}\n", cwd));
        } else if line == "ansi" {
            last = ShellReply::ok("\x1b[2J\x1b[31mtest\x1b[0m\r\n");
        } else if line == "fail" {
            last = ShellReply {
                stdout: String::new(),
                stderr: "boom\n".to_string(),
                exit_code: 1,
            };
        } else if line == "hang" || line.starts_with("sleep ") {
            return None;
        }
    }
    Some(last)
}

/// Marker extraction for `__dy_rc=$?; printf '\n<marker>:%s:%s\n' ...`
fn marker_of(line: &str) -> Option<String> {
    let start = line.find("printf '\\n")? + "printf '\\n".len();
    let rest = &line[start..];
    let end = rest.find(":%s:%s")?;
    Some(rest[..end].to_string())
}

async fn run_command_shell(
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
    out_tx: mpsc::Sender<ChannelOutput>,
    mut disconnect_rx: broadcast::Receiver<()>,
) {
    let mut cwd = "/home/ops".to_string();
    let mut buffer = String::new();
    let mut pending: Vec<String> = Vec::new();
    let mut hung = false;

    loop {
        let cmd = tokio::select! {
            cmd = cmd_rx.recv() => cmd,
            _ = disconnect_rx.recv() => break,
        };
        match cmd {
            Some(ChannelCommand::Data(data)) => {
                buffer.push_str(&String::from_utf8_lossy(&data));
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    let line = line.trim_end_matches('\n').to_string();
                    if line.trim() == "exit" {
                        let _ = out_tx.send(ChannelOutput::Exit(0)).await;
                        let _ = out_tx.send(ChannelOutput::Closed).await;
                        return;
                    }
                    let Some(marker) = marker_of(&line) else {
                        pending.push(line);
                        continue;
                    };
                    let command = pending.join("\n");
                    pending.clear();
                    if hung {
                        continue;
                    }
                    let Some(reply) = run_fake_command(&command, &mut cwd) else {
                        hung = true;
                        continue;
                    };
                    let stdout = format!("{}\n{}:{}:{}\n", reply.stdout, marker, reply.exit_code, cwd);
                    let stderr = format!("{}\n{}\n", reply.stderr, marker);
                    let _ = out_tx.send(ChannelOutput::Stdout(Bytes::from(stdout))).await;
                    let _ = out_tx.send(ChannelOutput::Stderr(Bytes::from(stderr))).await;
                }
            }
            Some(ChannelCommand::Resize { .. }) => {}
            Some(ChannelCommand::Close) | None => break,
        }
    }
    let _ = out_tx.send(ChannelOutput::Closed).await;
}

/// Echoes input like a terminal with echo on; `exit` ends the shell
async fn run_pty_shell(
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
    out_tx: mpsc::Sender<ChannelOutput>,
    mut disconnect_rx: broadcast::Receiver<()>,
    resizes: Arc<Mutex<Vec<(u32, u32)>>>,
) {
    let _ = out_tx
        .send(ChannelOutput::Stdout(Bytes::from_static(b"\x1b[?2004hops@docker:~$ ")))
        .await;
    loop {
        let cmd = tokio::select! {
            cmd = cmd_rx.recv() => cmd,
            _ = disconnect_rx.recv() => break,
        };
        match cmd {
            Some(ChannelCommand::Data(data)) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                if out_tx.send(ChannelOutput::Stdout(data)).await.is_err() {
                    return;
                }
                if text.trim_end() == "exit" {
                    let _ = out_tx.send(ChannelOutput::Exit(0)).await;
                    break;
                }
            }
            Some(ChannelCommand::Resize { cols, rows }) => resizes.lock().push((cols, rows)),
            Some(ChannelCommand::Close) | None => break,
        }
    }
    let _ = out_tx.send(ChannelOutput::Closed).await;
}
