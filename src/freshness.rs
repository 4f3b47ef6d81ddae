//! Freshness check: an external command whose exit code says what to do
//!
//! | exit code | action  |
//! |-----------|---------|
//! | 0         | none    |
//! | 1         | rebuild |
//! | 2         | restart |
//! | other     | none    |
//!
//! Codes outside the contract, and termination by signal, are treated as
//! "nothing to do" rather than as errors. Only a check command that cannot be
//! launched at all is an error.

use crate::error::SupervisorError;
use crate::process::ProcessRunner;
use std::fmt;
use std::process::ExitStatus;
use tracing::debug;

/// Exit code requesting a rebuild followed by a restart
pub const EXIT_REBUILD: i32 = 1;
/// Exit code requesting a restart without rebuilding
pub const EXIT_RESTART: i32 = 2;

/// What the check command asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Rebuild,
    Restart,
}

impl Action {
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(EXIT_REBUILD) => Action::Rebuild,
            Some(EXIT_RESTART) => Action::Restart,
            _ => Action::None,
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        Self::from_exit_code(status.code())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::None => write!(f, "none"),
            Action::Rebuild => write!(f, "rebuild"),
            Action::Restart => write!(f, "restart"),
        }
    }
}

pub struct FreshnessChecker {
    command: String,
}

impl FreshnessChecker {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub async fn check(&self, runner: &ProcessRunner) -> Result<Action, SupervisorError> {
        let status = runner
            .status(&self.command)
            .await
            .map_err(SupervisorError::CheckLaunch)?;

        let action = Action::from_status(status);
        if !status.success() {
            debug!(%status, %action, "Check: got exit status");
        }
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::output::OutputBuffer;

    fn runner(shell: &str) -> ProcessRunner {
        let config = ProcessConfig::new("true", "true", "true", "http://127.0.0.1:1").with_shell(shell);
        ProcessRunner::new(&config, OutputBuffer::new(1024), false).unwrap()
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(Action::from_exit_code(Some(0)), Action::None);
        assert_eq!(Action::from_exit_code(Some(1)), Action::Rebuild);
        assert_eq!(Action::from_exit_code(Some(2)), Action::Restart);
        assert_eq!(Action::from_exit_code(None), Action::None);

        for code in [3, 4, 42, 126, 127, 255, -1] {
            assert_eq!(Action::from_exit_code(Some(code)), Action::None, "code {}", code);
        }
    }

    #[test]
    fn test_action_display() {
        assert_eq!(Action::None.to_string(), "none");
        assert_eq!(Action::Rebuild.to_string(), "rebuild");
        assert_eq!(Action::Restart.to_string(), "restart");
    }

    #[tokio::test]
    async fn test_check_runs_command() {
        let runner = runner("bash -c");

        for (script, expected) in [
            ("exit 0", Action::None),
            ("exit 1", Action::Rebuild),
            ("exit 2", Action::Restart),
            ("exit 3", Action::None),
            ("exit 99", Action::None),
            ("this-command-does-not-exist-anywhere", Action::None),
        ] {
            let action = FreshnessChecker::new(script).check(&runner).await.unwrap();
            assert_eq!(action, expected, "script {:?}", script);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_killed_by_signal_is_none() {
        let runner = runner("bash -c");
        let action = FreshnessChecker::new("kill -9 $$").check(&runner).await.unwrap();
        assert_eq!(action, Action::None);
    }

    #[tokio::test]
    async fn test_check_launch_failure_is_error() {
        let runner = runner("/nonexistent/shell -c");
        let result = FreshnessChecker::new("exit 0").check(&runner).await;

        assert!(matches!(result, Err(SupervisorError::CheckLaunch(_))));
    }
}
