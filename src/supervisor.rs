//! The supervision state machine
//!
//! Every proxied request first passes through [`Supervisor::prepare_for_request`],
//! which runs the freshness check and, depending on its answer and on whether
//! the backend is alive, rebuilds and/or restarts the backend and waits for it
//! to listen. The whole sequence runs under one async mutex, so concurrent
//! requests queue behind an in-flight rebuild instead of racing it.

use crate::config::Config;
use crate::error::{diagnostic_body, SupervisorError};
use crate::freshness::{Action, FreshnessChecker};
use crate::output::OutputBuffer;
use crate::process::{ProcessHandle, ProcessRunner};
use crate::readiness::ReadinessPoller;
use hyper::Uri;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// What a successful `prepare_for_request` did to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Backend was running and fresh
    Unchanged,
    /// Backend was killed and started again without building
    Restarted,
    /// Build command ran, then the backend was (re)started
    Rebuilt,
}

/// A failed `prepare_for_request`, with the output captured for the attempt
#[derive(Debug)]
pub struct PrepareFailure {
    pub error: SupervisorError,
    pub output: String,
}

impl fmt::Display for PrepareFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&diagnostic_body(&self.error.to_string(), &self.output))
    }
}

impl std::error::Error for PrepareFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Default)]
struct SupervisorState {
    /// The current process generation, if any
    current: Option<ProcessHandle>,
}

impl SupervisorState {
    fn is_running(&self) -> bool {
        self.current.as_ref().map(|p| p.is_running()).unwrap_or(false)
    }
}

/// Owns the backend process and gates requests on its freshness.
///
/// Constructed once and shared behind an `Arc` by every request handler.
pub struct Supervisor {
    checker: FreshnessChecker,
    build_command: String,
    run_command: String,
    runner: ProcessRunner,
    readiness: ReadinessPoller,
    output: OutputBuffer,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    pub fn new(config: &Config) -> anyhow::Result<Arc<Self>> {
        let target = config.process.target_uri()?;
        let output = OutputBuffer::new(config.capture.max_bytes);

        let mut runner = ProcessRunner::new(&config.process, output.clone(), config.capture.passthrough)?;
        if let Some(port) = target.port_u16() {
            runner = runner.with_env("PORT", &port.to_string());
        }

        Ok(Arc::new(Self {
            checker: FreshnessChecker::new(&config.process.check),
            build_command: config.process.build.clone(),
            run_command: config.process.run.clone(),
            runner,
            readiness: ReadinessPoller::new(target, &config.readiness),
            output,
            state: Mutex::new(SupervisorState::default()),
        }))
    }

    /// The backend URL
    pub fn target(&self) -> &Uri {
        self.readiness.target()
    }

    /// The capture buffer of the current process generation
    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_running()
    }

    /// Pid of the associated process, whether or not it is still alive
    pub async fn pid(&self) -> Option<u32> {
        self.state.lock().await.current.as_ref().map(|p| p.pid())
    }

    /// Make sure the backend is fresh and listening before a request is forwarded
    pub async fn prepare_for_request(&self) -> Result<Transition, PrepareFailure> {
        let mut state = self.state.lock().await;

        match self.prepare_locked(&mut state).await {
            Ok(transition) => {
                if transition != Transition::Unchanged {
                    info!(?transition, "Backend ready");
                }
                Ok(transition)
            }
            Err(error) => {
                error!(error = %error, "Failed to prepare backend");
                Err(PrepareFailure {
                    error,
                    output: self.output.take(),
                })
            }
        }
    }

    async fn prepare_locked(&self, state: &mut SupervisorState) -> Result<Transition, SupervisorError> {
        let action = self.checker.check(&self.runner).await?;
        let running = state.is_running();
        debug!(command = self.checker.command(), %action, running, "Freshness checked");

        if !running || action == Action::Rebuild {
            self.rebuild_and_restart(state).await?;
            Ok(Transition::Rebuilt)
        } else if action == Action::Restart {
            self.restart(state).await?;
            Ok(Transition::Restarted)
        } else {
            Ok(Transition::Unchanged)
        }
    }

    /// Run the freshness check on its own
    pub async fn check(&self) -> Result<Action, SupervisorError> {
        let _state = self.state.lock().await;
        self.checker.check(&self.runner).await
    }

    /// Start the run command. Fails if a process is already running.
    pub async fn start(&self) -> Result<u32, SupervisorError> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state)
    }

    /// Drain the capture buffer for a diagnostic response
    ///
    /// Waits for any rebuild or restart in progress, so the text returned is
    /// never a partial generation and never steals output from a failing
    /// `prepare_for_request`.
    pub async fn take_output(&self) -> String {
        let _state = self.state.lock().await;
        self.output.take()
    }

    /// Kill the current process, if any, and clear the capture buffer
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await;
    }

    async fn rebuild_and_restart(&self, state: &mut SupervisorState) -> Result<(), SupervisorError> {
        self.begin_generation(state).await;
        self.rebuild().await?;
        self.start_and_wait(state).await
    }

    async fn restart(&self, state: &mut SupervisorState) -> Result<(), SupervisorError> {
        self.begin_generation(state).await;
        self.start_and_wait(state).await
    }

    /// Stop whatever is running and start a fresh capture generation
    async fn begin_generation(&self, state: &mut SupervisorState) {
        self.stop_locked(state).await;
        let generation = self.output.reset();
        debug!(generation, "New process generation");
    }

    async fn rebuild(&self) -> Result<(), SupervisorError> {
        info!(command = %self.build_command, "Build");

        let status = self
            .runner
            .run_to_completion(&self.build_command)
            .await
            .map_err(SupervisorError::BuildLaunch)?;

        if !status.success() {
            return Err(SupervisorError::BuildFailed { status });
        }

        info!("Build finished");
        Ok(())
    }

    async fn start_and_wait(&self, state: &mut SupervisorState) -> Result<(), SupervisorError> {
        self.start_locked(state)?;

        let Some(process) = state.current.as_ref() else {
            return Err(SupervisorError::NotRunning);
        };

        if let Err(e) = self.readiness.wait_until_up(process).await {
            // Drop the association so the next request tries again. The
            // output stays for the caller's diagnostics.
            if let Some(process) = state.current.take() {
                process.kill().await;
            }
            return Err(e);
        }

        Ok(())
    }

    fn start_locked(&self, state: &mut SupervisorState) -> Result<u32, SupervisorError> {
        info!(command = %self.run_command, "Start");

        if let Some(process) = state.current.as_ref() {
            if process.is_running() {
                return Err(SupervisorError::AlreadyRunning { pid: process.pid() });
            }
        }

        let process = self
            .runner
            .spawn(&self.run_command)
            .map_err(SupervisorError::StartLaunch)?;

        let pid = process.pid();
        info!(pid, "Started pid");
        state.current = Some(process);
        Ok(pid)
    }

    async fn stop_locked(&self, state: &mut SupervisorState) {
        if let Some(process) = state.current.take() {
            process.kill().await;
            self.output.reset();
        }
    }
}
