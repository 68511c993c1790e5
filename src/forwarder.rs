//! Forwarding subprocess lifecycle.
//!
//! The packet forwarder is an external binary bound to the tunnel adapter.
//! The core starts it, drains its output into the log, watches for an
//! unexpected exit and stops it on teardown.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ForwarderConfig;
use crate::error::{Error, Result};
use crate::supervisor::Fault;
use crate::types::{unix_millis, UdpMode};

const STOP_BUDGET: Duration = Duration::from_secs(10);

/// Everything needed to start one forwarder.
#[derive(Clone)]
pub struct ForwarderSpec {
    pub session_id: Uuid,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub tcp_only_args: Vec<String>,
    pub device: String,
    /// Contains credentials; never logged.
    pub proxy_url: String,
    pub mtu: u16,
    pub udp_mode: UdpMode,
    pub log_level: String,
    pub settle: Duration,
}

impl ForwarderSpec {
    pub fn new(
        session_id: Uuid,
        config: &ForwarderConfig,
        device: impl Into<String>,
        proxy_url: impl Into<String>,
        mtu: u16,
        udp_mode: UdpMode,
    ) -> Self {
        Self {
            session_id,
            program: config.program.clone(),
            args: config.args.clone(),
            tcp_only_args: config.tcp_only_args.clone(),
            device: device.into(),
            proxy_url: proxy_url.into(),
            mtu,
            udp_mode,
            log_level: config.log_level.clone(),
            settle: Duration::from_millis(config.settle_ms),
        }
    }

    /// Argument template with every placeholder substituted.
    pub fn render_args(&self) -> Vec<String> {
        let mtu = self.mtu.to_string();
        let udp_mode = self.udp_mode.to_string();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{device}", &self.device)
                    .replace("{proxy}", &self.proxy_url)
                    .replace("{mtu}", &mtu)
                    .replace("{udp_mode}", &udp_mode)
                    .replace("{log_level}", &self.log_level)
            })
            .collect();
        if self.udp_mode == UdpMode::TcpOnly {
            args.extend(self.tcp_only_args.iter().cloned());
        }
        args
    }
}

impl std::fmt::Debug for ForwarderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderSpec")
            .field("session_id", &self.session_id)
            .field("program", &self.program)
            .field("device", &self.device)
            .field("mtu", &self.mtu)
            .field("udp_mode", &self.udp_mode)
            .finish()
    }
}

/// A running forwarder.
#[async_trait]
pub trait ForwarderHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn is_running(&self) -> bool;

    /// Stop the process and wait for it to exit. Idempotent.
    async fn stop(&self) -> Result<()>;
}

/// Starts forwarders. An unexpected exit is reported on `faults`.
#[async_trait]
pub trait ForwarderLauncher: Send + Sync {
    async fn launch(
        &self,
        spec: &ForwarderSpec,
        faults: mpsc::UnboundedSender<Fault>,
    ) -> Result<Arc<dyn ForwarderHandle>>;
}

/// Launches the forwarder as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl ForwarderLauncher for ProcessLauncher {
    async fn launch(
        &self,
        spec: &ForwarderSpec,
        faults: mpsc::UnboundedSender<Fault>,
    ) -> Result<Arc<dyn ForwarderHandle>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.render_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Forwarder(format!("failed to start {}: {e}", spec.program.display()))
        })?;
        let pid = child.id();
        info!(
            pid = ?pid,
            program = %spec.program.display(),
            device = %spec.device,
            udp_mode = %spec.udp_mode,
            "Forwarder started"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, true));
        }

        let stop = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel::<Option<Option<i32>>>(None);
        let session_id = spec.session_id;
        let token = stop.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    warn!(code = ?code, "Forwarder exited");
                    let _ = exit_tx.send(Some(code));
                    let _ = faults.send(Fault::ForwarderExited {
                        session_id,
                        code,
                        timestamp: unix_millis(),
                    });
                }
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill forwarder");
                    }
                    let code = child.try_wait().ok().flatten().and_then(|s| s.code());
                    let _ = exit_tx.send(Some(code));
                    debug!("Forwarder stopped");
                }
            }
        });

        let handle = Arc::new(ProcessHandle {
            pid,
            stop,
            exit: exit_rx.clone(),
            task: Mutex::new(Some(task)),
        });

        // The process must survive the settle window.
        let mut exited = exit_rx;
        tokio::select! {
            _ = sleep(spec.settle) => {}
            _ = exited.changed() => {
                let code = (*exited.borrow()).flatten();
                return Err(Error::Forwarder(format!(
                    "{} exited during startup (code: {code:?})",
                    spec.program.display()
                )));
            }
        }
        Ok(handle)
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let lower = line.to_lowercase();
        if is_stderr && (lower.contains("error") || lower.contains("fatal") || lower.contains("panic")) {
            warn!(target: "proxytun::forwarder", "{}", line);
        } else {
            debug!(target: "proxytun::forwarder", "{}", line);
        }
    }
}

struct ProcessHandle {
    pid: Option<u32>,
    stop: CancellationToken,
    exit: watch::Receiver<Option<Option<i32>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ForwarderHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    async fn stop(&self) -> Result<()> {
        self.stop.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            timeout(STOP_BUDGET, task)
                .await
                .map_err(|_| Error::timeout("forwarder stop", STOP_BUDGET))?
                .map_err(|e| Error::Forwarder(format!("watcher task failed: {e}")))?;
        }
        Ok(())
    }
}
