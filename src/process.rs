use crate::config::ProcessConfig;
use crate::output::{OutputBuffer, OutputSink, Stream};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// How long `kill` waits for the exit to be recorded
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Read size for output pumps
const PUMP_CHUNK: usize = 8 * 1024;

/// How long an exited process's output may keep draining before the exit is published
const PUMP_DRAIN: Duration = Duration::from_secs(1);

/// Liveness of a spawned process, as last observed by its waiter task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Exited; status is unknown if waiting on the child failed
    Exited(Option<ExitStatus>),
}

impl Liveness {
    pub fn is_running(&self) -> bool {
        matches!(self, Liveness::Running)
    }
}

/// Spawns shell commands for the supervisor with a shared environment
pub struct ProcessRunner {
    /// Shell program followed by its leading arguments, e.g. ["bash", "-c"]
    shell: Vec<String>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    output: OutputBuffer,
    passthrough: bool,
}

impl ProcessRunner {
    pub fn new(config: &ProcessConfig, output: OutputBuffer, passthrough: bool) -> anyhow::Result<Self> {
        Ok(Self {
            shell: config.shell_argv()?,
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
            env: config.env.clone(),
            output,
            passthrough,
        })
    }

    /// Add an environment variable for every command (builder pattern)
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    fn command(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.shell[0]);
        cmd.args(&self.shell[1..]);
        cmd.arg(script);
        cmd.stdin(Stdio::null());

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }

    /// Run a command to completion with its output discarded
    pub async fn status(&self, script: &str) -> std::io::Result<ExitStatus> {
        let mut cmd = self.command(script);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);
        cmd.status().await
    }

    /// Run a command to completion, capturing its output
    ///
    /// Output streams are drained (within `PUMP_DRAIN`) before this returns.
    pub async fn run_to_completion(&self, script: &str) -> std::io::Result<ExitStatus> {
        let mut cmd = self.command(script);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pumps = self.attach_pumps(&mut child);
        let status = child.wait().await;
        drain(pumps).await;

        status
    }

    /// Launch a long-lived command and return as soon as it is running
    ///
    /// The child gets its own process group so that `kill` also reaches
    /// whatever the shell started.
    pub fn spawn(&self, script: &str) -> std::io::Result<ProcessHandle> {
        let mut cmd = self.command(script);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        let pumps = self.attach_pumps(&mut child);

        let (exit_tx, exit_rx) = watch::channel(Liveness::Running);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(wait_for_exit(child, pid, pumps, exit_tx, kill_rx));

        Ok(ProcessHandle {
            pid,
            exit_rx,
            kill_tx: Some(kill_tx),
        })
    }

    fn attach_pumps(&self, child: &mut Child) -> Vec<tokio::task::JoinHandle<()>> {
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let sink = self.output.sink(Stream::Stdout);
            pumps.push(tokio::spawn(pump(stdout, sink, self.passthrough)));
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = self.output.sink(Stream::Stderr);
            pumps.push(tokio::spawn(pump(stderr, sink, self.passthrough)));
        }
        pumps
    }
}

/// Copy a child stream into the capture buffer and, optionally, to our own stream
async fn pump<R>(mut reader: R, sink: OutputSink, passthrough: bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; PUMP_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Error reading child output");
                break;
            }
        };
        let chunk = &buf[..n];

        // Keep draining a superseded stream so the child never blocks on a full pipe
        let current = sink.write(chunk);

        if passthrough && current {
            let result = match sink.stream() {
                Stream::Stdout => tokio::io::stdout().write_all(chunk).await,
                Stream::Stderr => tokio::io::stderr().write_all(chunk).await,
            };
            if let Err(e) = result {
                debug!(error = %e, "Failed to mirror child output");
            }
        }
    }
}

/// Background waiter: records the exit, or kills the child when asked
///
/// The exit is published only after the output pumps have drained (or
/// `PUMP_DRAIN` has passed), so whoever reacts to it sees the last words.
async fn wait_for_exit(
    mut child: Child,
    pid: u32,
    pumps: Vec<tokio::task::JoinHandle<()>>,
    exit_tx: watch::Sender<Liveness>,
    kill_rx: oneshot::Receiver<()>,
) {
    // A dropped handle closes the channel, which counts as a kill request
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    let status = match waited {
        Some(status) => status,
        None => {
            kill_process_group(pid);
            if let Err(e) = child.start_kill() {
                debug!(pid, error = %e, "Kill failed, process probably already exited");
            }
            child.wait().await
        }
    };

    let status = match status {
        Ok(status) => {
            info!(pid, %status, "Process exited");
            Some(status)
        }
        Err(e) => {
            warn!(pid, error = %e, "Error waiting for process");
            None
        }
    };

    drain(pumps).await;
    let _ = exit_tx.send(Liveness::Exited(status));
}

/// Wait for output pumps of an exited child, giving up after `PUMP_DRAIN`
async fn drain(pumps: Vec<tokio::task::JoinHandle<()>>) {
    let drained = tokio::time::timeout(PUMP_DRAIN, async {
        for pump in pumps {
            let _ = pump.await;
        }
    })
    .await;

    // A background descendant can keep the pipe open indefinitely
    if drained.is_err() {
        debug!("Output still open after exit");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    if pid == 0 {
        return;
    }
    // The child leads its own group, so the group id is its pid
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Handle to a running child process
///
/// Dropping the handle kills the process.
pub struct ProcessHandle {
    pid: u32,
    exit_rx: watch::Receiver<Liveness>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn liveness(&self) -> Liveness {
        *self.exit_rx.borrow()
    }

    /// True until the waiter task has recorded an exit
    pub fn is_running(&self) -> bool {
        self.liveness().is_running()
    }

    /// Resolves once the process has been observed to exit
    pub async fn exited(&self) -> Liveness {
        let mut rx = self.exit_rx.clone();
        let liveness = match rx.wait_for(|l| !l.is_running()).await {
            Ok(liveness) => *liveness,
            // Sender gone without publishing: the waiter task was torn down
            Err(_) => Liveness::Exited(None),
        };
        liveness
    }

    /// Forcibly terminate the process and wait for the exit to be recorded
    pub async fn kill(mut self) -> Liveness {
        info!(pid = self.pid, "Stopping pid");
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }

        match tokio::time::timeout(KILL_WAIT, self.exited()).await {
            Ok(liveness) => liveness,
            Err(_) => {
                warn!(pid = self.pid, "Process did not exit after kill");
                self.liveness()
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // The waiter kills the group only while the child is unreaped, so the
        // pid cannot have been reused
        if let Some(kill_tx) = self.kill_tx.take() {
            if self.is_running() {
                debug!(pid = self.pid, "Process handle dropped, killing process");
            }
            let _ = kill_tx.send(());
        }
    }
}
