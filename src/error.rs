//! Supervisor errors and the plain-text error responses built from them

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Failures of the supervision state machine
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The check command could not be executed at all
    #[error("Check command could not be launched: {0}")]
    CheckLaunch(#[source] std::io::Error),

    /// The build command could not be executed at all
    #[error("Build command could not be launched: {0}")]
    BuildLaunch(#[source] std::io::Error),

    /// The build command ran and exited unsuccessfully
    #[error("Build failed: {status}")]
    BuildFailed { status: ExitStatus },

    /// The run command could not be executed at all
    #[error("Run command could not be launched: {0}")]
    StartLaunch(#[source] std::io::Error),

    /// Start was requested while a process is still running
    #[error("Can't start, already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// Readiness was requested but no process is running
    #[error("Process is not running")]
    NotRunning,

    /// The process exited before it became reachable
    #[error("Process exited while waiting for it to listen ({})", describe_exit(.status))]
    ExitedDuringStartup { status: Option<ExitStatus> },

    /// The process stayed alive but never became reachable
    #[error("Process did not listen after waiting {attempts}*{}ms", .interval.as_millis())]
    ReadinessTimeout { attempts: u32, interval: Duration },
}

fn describe_exit(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "exit status unknown".to_string(),
    }
}

impl SupervisorError {
    /// Error code reported in the X-Proxy-Error header
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            SupervisorError::CheckLaunch(_) => ProxyErrorCode::CheckFailed,
            SupervisorError::BuildLaunch(_) | SupervisorError::BuildFailed { .. } => {
                ProxyErrorCode::BuildFailed
            }
            SupervisorError::StartLaunch(_) | SupervisorError::AlreadyRunning { .. } => {
                ProxyErrorCode::StartFailed
            }
            SupervisorError::NotRunning | SupervisorError::ExitedDuringStartup { .. } => {
                ProxyErrorCode::BackendExited
            }
            SupervisorError::ReadinessTimeout { .. } => ProxyErrorCode::ReadinessTimeout,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Check command could not be launched
    CheckFailed,
    /// Build command failed or could not be launched
    BuildFailed,
    /// Run command could not be launched
    StartFailed,
    /// Backend exited before becoming reachable
    BackendExited,
    /// Backend never became reachable
    ReadinessTimeout,
    /// Forwarding to the backend failed at the connection level
    ConnectionFailed,
    /// Backend did not answer a forwarded request in time
    RequestTimeout,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::CheckFailed
            | ProxyErrorCode::BuildFailed
            | ProxyErrorCode::StartFailed
            | ProxyErrorCode::BackendExited
            | ProxyErrorCode::ReadinessTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::CheckFailed => "CHECK_FAILED",
            ProxyErrorCode::BuildFailed => "BUILD_FAILED",
            ProxyErrorCode::StartFailed => "START_FAILED",
            ProxyErrorCode::BackendExited => "BACKEND_EXITED",
            ProxyErrorCode::ReadinessTimeout => "READINESS_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }
}

/// Render an error message followed by captured process output
pub fn diagnostic_body(message: &str, output: &str) -> String {
    format!("{}\n\n{}", message, output)
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn diagnostic_response(
    code: ProxyErrorCode,
    message: &str,
    output: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = diagnostic_body(message, output);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
