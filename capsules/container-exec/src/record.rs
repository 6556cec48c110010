use crate::error::ExecError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Lifecycle of one container invocation.
///
/// `Idle -> Launching -> Running -> {Succeeded, Failed, TimedOut}`. Terminal
/// states admit no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionState {
    Idle,
    Launching,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Failed | ExecutionState::TimedOut
        )
    }

    pub fn can_advance_to(self, next: ExecutionState) -> bool {
        matches!(
            (self, next),
            (ExecutionState::Idle, ExecutionState::Launching)
                | (ExecutionState::Launching, ExecutionState::Running)
                | (
                    ExecutionState::Running,
                    ExecutionState::Succeeded | ExecutionState::Failed | ExecutionState::TimedOut
                )
        )
    }
}

/// Outcome of one container invocation, including verbatim stdout/stderr.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    container_name: String,
    image: String,
    state: ExecutionState,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    started_at: DateTime<Utc>,
    duration_ms: f64,
    timeout_ms: f64,
}

impl ExecutionRecord {
    pub(crate) fn start(container_name: &str, image: &str, timeout: Duration) -> Self {
        Self {
            container_name: container_name.to_string(),
            image: image.to_string(),
            state: ExecutionState::Idle,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at: Utc::now(),
            duration_ms: 0.0,
            timeout_ms: timeout.as_secs_f64() * 1000.0,
        }
    }

    pub(crate) fn advance(&mut self, next: ExecutionState) -> Result<(), ExecError> {
        if !self.state.can_advance_to(next) {
            return Err(ExecError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(container = %self.container_name, from = ?self.state, to = ?next, "execution state");
        self.state = next;
        Ok(())
    }

    pub(crate) fn finish(
        mut self,
        state: ExecutionState,
        exit_code: Option<i32>,
        logs: CommandLogs,
        elapsed: Duration,
    ) -> Result<Self, ExecError> {
        self.advance(state)?;
        self.exit_code = exit_code;
        self.stdout = logs.stdout;
        self.stderr = logs.stderr;
        self.duration_ms = elapsed.as_secs_f64() * 1000.0;
        Ok(self)
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    pub fn timeout_ms(&self) -> f64 {
        self.timeout_ms
    }

    pub fn is_success(&self) -> bool {
        self.state == ExecutionState::Succeeded
    }

    /// Text to surface when the run failed: stderr, or stdout when stderr is blank.
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CommandLogs {
    pub stdout: String,
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        let mut record = ExecutionRecord::start("c1", "img:latest", Duration::from_secs(1));
        record.advance(ExecutionState::Launching).unwrap();
        record.advance(ExecutionState::Running).unwrap();
        let record = record
            .finish(
                ExecutionState::Succeeded,
                Some(0),
                CommandLogs {
                    stdout: "done\n".into(),
                    stderr: String::new(),
                },
                Duration::from_millis(1500),
            )
            .unwrap();

        assert!(record.is_success());
        assert_eq!(record.duration_ms(), 1500.0);
        assert_eq!(record.diagnostic(), "done\n");
    }

    #[test]
    fn skipping_launch_is_rejected() {
        let mut record = ExecutionRecord::start("c1", "img", Duration::from_secs(1));
        let err = record.advance(ExecutionState::Running).unwrap_err();
        assert!(matches!(
            err,
            ExecError::InvalidTransition {
                from: ExecutionState::Idle,
                to: ExecutionState::Running
            }
        ));
    }

    #[test]
    fn terminal_states_are_final() {
        for state in [
            ExecutionState::Succeeded,
            ExecutionState::Failed,
            ExecutionState::TimedOut,
        ] {
            assert!(state.is_terminal());
            assert!(!state.can_advance_to(ExecutionState::Running));
            assert!(!state.can_advance_to(ExecutionState::Succeeded));
        }
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = ExecutionRecord::start("c1", "img", Duration::from_secs(2));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["containerName"], "c1");
        assert_eq!(json["state"], "idle");
        assert_eq!(json["timeoutMs"], 2000.0);
    }
}
