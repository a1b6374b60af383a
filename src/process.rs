//! Backend subprocess launching and supervision
//!
//! Each backend is spawned once at startup and owned by the [`Supervisor`].
//! A monitor task per child records its exit; shutdown sends one termination
//! signal per child and does not wait for it to exit.

use crate::config::{BackendConfig, StdioMode};
use crate::error::GatewayError;
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Interval between readiness connection attempts
const READY_POLL_INTERVAL_MS: u64 = 100;

/// Lifecycle state of a managed subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubprocessState {
    /// Spawn requested, not yet confirmed by the OS
    Starting,
    /// Process is alive
    Running,
    /// Process terminated, normally or killed
    Exited,
}

/// A child process owned by the gateway
pub struct ManagedSubprocess {
    name: String,
    command: String,
    args: Vec<String>,
    port: u16,
    pid: Option<u32>,
    state_rx: watch::Receiver<SubprocessState>,
    exit_status: Arc<Mutex<Option<ExitStatus>>>,
    kill_sent: Arc<AtomicBool>,
    /// Wakes the monitor; dropping it kills the child
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for ManagedSubprocess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSubprocess")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl ManagedSubprocess {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Arguments as passed to the child (placeholders expanded)
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SubprocessState {
        *self.state_rx.borrow()
    }

    /// Exit status, once the monitor has observed termination
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_status.lock()
    }

    pub fn kill_sent(&self) -> bool {
        self.kill_sent.load(Ordering::SeqCst)
    }

    /// Send the termination signal without waiting for exit.
    ///
    /// Returns `true` only for the call that actually signalled the child.
    pub fn kill(&self) -> bool {
        let Some(tx) = self.kill_tx.lock().take() else {
            return false;
        };
        if self.kill_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        if self.state() == SubprocessState::Exited {
            debug!(name = %self.name, "Backend already exited, nothing to kill");
            return false;
        }

        info!(name = %self.name, pid = ?self.pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }

        let _ = tx.send(());
        true
    }

    /// Resolve once the process has exited
    pub async fn wait_exited(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|s| *s == SubprocessState::Exited).await;
    }
}

/// Spawn a backend process as described by `config`.
///
/// Must be called from within a Tokio runtime. No readiness check is made;
/// see [`wait_for_port`].
pub fn launch(config: &BackendConfig) -> Result<ManagedSubprocess, GatewayError> {
    let args = config.resolved_args();
    let (state_tx, state_rx) = watch::channel(SubprocessState::Starting);

    info!(
        name = %config.name,
        command = %config.command,
        port = config.port,
        stdio = ?config.stdio,
        "Starting backend"
    );

    let mut cmd = Command::new(&config.command);
    cmd.args(&args);
    cmd.stdin(Stdio::null());
    // Drop-kill is handled by `ChildGuard` so it can be disarmed after SIGTERM
    cmd.kill_on_drop(false);

    match config.stdio {
        StdioMode::Inherit => {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
        StdioMode::Capture => {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
    }

    if let Some(ref working_dir) = config.working_dir {
        cmd.current_dir(working_dir);
    }

    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    cmd.env(&config.port_env, config.port.to_string());

    let mut child = cmd.spawn().map_err(|source| GatewayError::Spawn {
        name: config.name.clone(),
        command: config.command.clone(),
        source,
    })?;
    let pid = child.id();
    let kill_sent = Arc::new(AtomicBool::new(false));

    if config.stdio == StdioMode::Capture {
        let tag = output_prefix(&config.name, config.port);
        if let Some(stdout) = child.stdout.take() {
            let tag = tag.clone();
            tokio::spawn(async move {
                let mut out = tokio::io::stdout();
                if let Err(e) = relay_lines(stdout, &tag, &mut out).await {
                    debug!(tag, error = %e, "Stdout relay stopped");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut err = tokio::io::stderr();
                if let Err(e) = relay_lines(stderr, &tag, &mut err).await {
                    debug!(tag, error = %e, "Stderr relay stopped");
                }
            });
        }
    }

    state_tx.send_replace(SubprocessState::Running);
    info!(name = %config.name, pid, port = config.port, "Backend process spawned");

    let exit_status = Arc::new(Mutex::new(None));
    let (kill_tx, kill_rx) = oneshot::channel();

    let guard = ChildGuard {
        child,
        kill_sent: Arc::clone(&kill_sent),
    };
    tokio::spawn(monitor(
        config.name.clone(),
        guard,
        kill_rx,
        state_tx,
        Arc::clone(&exit_status),
    ));

    Ok(ManagedSubprocess {
        name: config.name.clone(),
        command: config.command.clone(),
        args,
        port: config.port,
        pid,
        state_rx,
        exit_status,
        kill_sent,
        kill_tx: Mutex::new(Some(kill_tx)),
    })
}

/// Owns a child and kills it when dropped, unless SIGTERM was already sent.
///
/// Dropping happens when the runtime shuts down under the monitor task; a
/// child that was signalled keeps running its own shutdown instead of
/// receiving a second, forced kill.
struct ChildGuard {
    child: Child,
    kill_sent: Arc<AtomicBool>,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if cfg!(unix) && self.kill_sent.load(Ordering::SeqCst) {
            return;
        }
        // Errors here mean the child was already reaped
        let _ = self.child.start_kill();
    }
}

/// Watch a child until it exits, forcing termination if its handle is dropped
async fn monitor(
    name: String,
    mut guard: ChildGuard,
    kill_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<SubprocessState>,
    exit_status: Arc<Mutex<Option<ExitStatus>>>,
) {
    let child = &mut guard.child;
    let result = tokio::select! {
        result = child.wait() => result,
        signal = kill_rx => {
            match signal {
                // Unix children were already signalled by `kill`
                Ok(()) => {
                    #[cfg(not(unix))]
                    {
                        let _ = child.start_kill();
                    }
                }
                Err(_) => {
                    debug!(name, "Backend handle dropped, killing process");
                    let _ = child.start_kill();
                }
            }
            child.wait().await
        }
    };

    match result {
        Ok(status) => {
            if guard.kill_sent.load(Ordering::SeqCst) {
                info!(name, ?status, "Backend process exited after kill");
            } else {
                warn!(name, ?status, "Backend process exited");
            }
            *exit_status.lock() = Some(status);
        }
        Err(e) => {
            warn!(name, error = %e, "Error waiting for backend to exit");
        }
    }

    state_tx.send_replace(SubprocessState::Exited);
}

/// Prefix written before each captured output line
pub fn output_prefix(name: &str, port: u16) -> String {
    format!("[{}:{}]", name, port)
}

/// Copy `reader` to `writer` line by line, prefixing every line with `prefix`.
///
/// Returns the number of lines relayed once the reader reaches EOF.
pub async fn relay_lines<R, W>(reader: R, prefix: &str, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        // Backends may print arbitrary bytes; never stop draining the pipe
        let line = String::from_utf8_lossy(&buf);
        writer
            .write_all(format!("{} {}\n", prefix, line.trim_end()).as_bytes())
            .await?;
        writer.flush().await?;
        count += 1;
    }
    Ok(count)
}

/// Poll a local port until it accepts TCP connections or `timeout` elapses
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let addr = format!("127.0.0.1:{}", port);
    let start = Instant::now();
    while start.elapsed() < timeout {
        if tokio::net::TcpStream::connect(&addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(READY_POLL_INTERVAL_MS)).await;
    }
    false
}

/// The set of subprocesses owned by one gateway
#[derive(Debug, Default)]
pub struct Supervisor {
    subprocesses: Vec<ManagedSubprocess>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch every backend in order, stopping at the first spawn failure.
    ///
    /// Children launched before the failure are killed when the partially
    /// built supervisor is dropped.
    pub fn launch_all(configs: &[BackendConfig]) -> Result<Self, GatewayError> {
        let mut supervisor = Self::new();
        for config in configs {
            supervisor.push(launch(config)?);
        }
        Ok(supervisor)
    }

    pub fn push(&mut self, subprocess: ManagedSubprocess) {
        self.subprocesses.push(subprocess);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedSubprocess> {
        self.subprocesses.iter()
    }

    pub fn len(&self) -> usize {
        self.subprocesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subprocesses.is_empty()
    }

    /// Signal every subprocess that has not been signalled yet.
    ///
    /// Returns how many were signalled by this call.
    pub fn kill_all(&self) -> usize {
        self.subprocesses.iter().filter(|s| s.kill()).count()
    }

    /// Wait until every subprocess has exited; `false` on timeout
    pub async fn wait_all_exited(&self, timeout: Duration) -> bool {
        let all = async {
            for subprocess in &self.subprocesses {
                subprocess.wait_exited().await;
            }
        };
        tokio::time::timeout(timeout, all).await.is_ok()
    }
}
