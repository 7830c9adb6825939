//! Encoder subprocess plumbing shared by segment sessions and direct pipes.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::metrics::ENCODER_CPU_USAGE;

const OUTPUT_RING_LINES: usize = 50;
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Full command line, for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Ran to completion with a zero status.
    Succeeded,
    /// Terminated because a stop was requested.
    Stopped,
    Failed { status: String, detail: String },
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Succeeded => f.write_str("completed"),
            ExitOutcome::Stopped => f.write_str("stopped"),
            ExitOutcome::Failed { status, .. } => write!(f, "failed ({status})"),
        }
    }
}

/// Resolves once the launched process has exited and its output is drained.
pub type ExitFuture = BoxFuture<'static, ExitOutcome>;

/// Starts encoder processes.
///
/// `launch` must return as soon as the process exists; the returned future
/// owns the process for the rest of its life. Flipping `stop` to `true` (or
/// dropping its sender) terminates it.
pub trait Launcher: Send + Sync + 'static {
    fn launch(
        &self,
        label: &str,
        command: &EncoderCommand,
        stop: watch::Receiver<bool>,
    ) -> Result<ExitFuture, StreamError>;
}

/// Bounded tail of a process output stream.
#[derive(Clone, Default)]
pub struct OutputRing {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputRing {
    pub async fn push(&self, line: String) {
        let mut ring = self.lines.lock().await;
        if ring.len() >= OUTPUT_RING_LINES {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    pub async fn contents(&self) -> String {
        self.lines
            .lock()
            .await
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Reads `reader` line by line until EOF so the child can never block on a
/// full pipe.
pub fn drain_output<R>(reader: R, ring: OutputRing, label: String, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer).trim_end().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    // `RUST_LOG=vodstream::process=debug` shows encoder output.
                    debug!("ffmpeg[{}] {}: {}", label, stream, line);
                    ring.push(line).await;
                }
                Err(e) => {
                    debug!("ffmpeg[{}] {} read error: {}", label, stream, e);
                    break;
                }
            }
        }
    })
}

/// Picks the diagnostic text for an abnormal exit: stderr, else stdout.
pub async fn exit_detail(stderr: &OutputRing, stdout: &OutputRing) -> String {
    let err = stderr.contents().await;
    if err.trim().is_empty() {
        stdout.contents().await
    } else {
        err
    }
}

/// Samples the encoder's CPU usage into [`ENCODER_CPU_USAGE`] until `stop`
/// fires or the process disappears.
pub fn spawn_cpu_monitor(pid: u32, label: String, mut stop: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(CPU_SAMPLE_INTERVAL) => {
                    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                    match sys.process(pid) {
                        Some(process) => {
                            ENCODER_CPU_USAGE
                                .with_label_values(&[label.as_str()])
                                .set(process.cpu_usage() as f64);
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = ENCODER_CPU_USAGE.remove_label_values(&[label.as_str()]);
    });
}

/// Waits for `child` to exit, killing it first if `stop` fires.
///
/// Returns the exit status and whether the exit was requested.
pub async fn wait_or_kill(
    child: &mut Child,
    stop: &mut watch::Receiver<bool>,
) -> (std::io::Result<ExitStatus>, bool) {
    if *stop.borrow() {
        let _ = child.start_kill();
        return (child.wait().await, true);
    }
    tokio::select! {
        status = child.wait() => (status, false),
        // Err means the sender was dropped; treat it as a stop too.
        _ = stop.changed() => {
            if let Err(e) = child.start_kill() {
                debug!("kill failed (process already gone?): {}", e);
            }
            (child.wait().await, true)
        }
    }
}

/// Launches ffmpeg for segment sessions.
#[derive(Debug, Default, Clone)]
pub struct FfmpegLauncher;

impl Launcher for FfmpegLauncher {
    fn launch(
        &self,
        label: &str,
        command: &EncoderCommand,
        mut stop: watch::Receiver<bool>,
    ) -> Result<ExitFuture, StreamError> {
        let command_line = command.command_line();
        let mut child = command.to_command().spawn().map_err(|e| {
            error!("Failed to spawn encoder for {}: {} (command: {})", label, e, command_line);
            StreamError::ProcessSpawn(format!("{}: {e}", command.program.display()))
        })?;

        let label = label.to_string();
        if let Some(pid) = child.id() {
            info!("ffmpeg spawned: pid={} key={}", pid, label);
            spawn_cpu_monitor(pid, label.clone(), stop.clone());
        }

        let stderr = OutputRing::default();
        let stdout = OutputRing::default();
        let mut drains = Vec::new();
        if let Some(pipe) = child.stderr.take() {
            drains.push(drain_output(pipe, stderr.clone(), label.clone(), "stderr"));
        }
        if let Some(pipe) = child.stdout.take() {
            drains.push(drain_output(pipe, stdout.clone(), label.clone(), "stdout"));
        }

        Ok(async move {
            let (status, stop_requested) = wait_or_kill(&mut child, &mut stop).await;
            for drain in drains {
                let _ = drain.await;
            }

            match status {
                Ok(_) if stop_requested => {
                    info!("ffmpeg stopped (requested): key={}", label);
                    ExitOutcome::Stopped
                }
                Ok(status) if status.success() => {
                    info!("ffmpeg finished: key={}", label);
                    ExitOutcome::Succeeded
                }
                Ok(status) => {
                    let detail = exit_detail(&stderr, &stdout).await;
                    error!(
                        "ffmpeg error: key={} status={} command=<{}> output=\n{}",
                        label, status, command_line, detail
                    );
                    ExitOutcome::Failed {
                        status: status.to_string(),
                        detail,
                    }
                }
                Err(e) => {
                    warn!("ffmpeg wait() failed: key={} err={}", label, e);
                    ExitOutcome::Failed {
                        status: "unknown".to_string(),
                        detail: e.to_string(),
                    }
                }
            }
        }
        .boxed())
    }
}
