use capsules_container_exec::{ExecError, ExecutionRecord};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Terminal failure of one pipeline request. None of these are retried.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Container runtime '{runtime}' is not available")]
    RuntimeUnavailable { runtime: String },

    #[error("Staging failed: {message}")]
    Staging { message: String },

    #[error("Segmentation container timed out after {}", format_timeout(.timeout))]
    ExecutionTimeout {
        timeout: Duration,
        record: Box<ExecutionRecord>,
    },

    #[error("Segmentation container failed{}", exit_suffix(.exit_code))]
    ExecutionFailure {
        exit_code: Option<i32>,
        diagnostics: String,
        record: Option<Box<ExecutionRecord>>,
    },

    #[error("No prediction (.mha or .nii.gz) found under {}", .output_dir.display())]
    OutputNotFound { output_dir: PathBuf },

    #[error("Prediction at {} could not be used: {message}", .path.display())]
    OutputRead { path: PathBuf, message: String },

    #[error("{} prediction candidates found; expected exactly one", .candidates.len())]
    AmbiguousOutput { candidates: Vec<PathBuf> },
}

fn format_timeout(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {}", code),
        None => " without an exit code".to_string(),
    }
}

impl PipelineError {
    pub(crate) fn staging(message: impl Into<String>) -> Self {
        PipelineError::Staging {
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::RuntimeUnavailable { .. } => "RUNTIME_UNAVAILABLE",
            PipelineError::Staging { .. } => "STAGING_ERROR",
            PipelineError::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            PipelineError::ExecutionFailure { .. } => "EXECUTION_FAILURE",
            PipelineError::OutputNotFound { .. } => "OUTPUT_NOT_FOUND",
            PipelineError::OutputRead { .. } => "OUTPUT_READ_ERROR",
            PipelineError::AmbiguousOutput { .. } => "AMBIGUOUS_OUTPUT",
        }
    }

    /// Captured container output, when the failure happened at or after launch.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            PipelineError::ExecutionTimeout { record, .. } => Some(record.diagnostic()),
            PipelineError::ExecutionFailure { diagnostics, .. } => Some(diagnostics.as_str()),
            _ => None,
        }
        .filter(|text| !text.trim().is_empty())
    }

    pub fn execution(&self) -> Option<&ExecutionRecord> {
        match self {
            PipelineError::ExecutionTimeout { record, .. } => Some(&**record),
            PipelineError::ExecutionFailure { record, .. } => record.as_deref(),
            _ => None,
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            status: "error".to_string(),
            code: self.code().to_string(),
            message: self.to_string(),
            diagnostics: self.diagnostics().map(str::to_string),
        }
    }

    /// Classify an executor failure that happened before a process outcome existed.
    pub(crate) fn from_exec(err: ExecError) -> Self {
        match err {
            ExecError::RuntimeUnavailable { runtime } | ExecError::Spawn { runtime, .. } => {
                PipelineError::RuntimeUnavailable { runtime }
            }
            ExecError::InvalidMount { path, source } => PipelineError::staging(format!(
                "workspace mount {} cannot be resolved: {}",
                path.display(),
                source
            )),
            other => PipelineError::ExecutionFailure {
                exit_code: None,
                diagnostics: other.to_string(),
                record: None,
            },
        }
    }
}

/// Serializable form of a [`PipelineError`] handed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub status: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_carries_code_and_message() {
        let err = PipelineError::OutputNotFound {
            output_dir: PathBuf::from("/ws/output"),
        };
        let report = err.to_report();
        assert_eq!(report.status, "error");
        assert_eq!(report.code, "OUTPUT_NOT_FOUND");
        assert!(report.message.contains("/ws/output"));
        assert_eq!(report.diagnostics, None);
    }

    #[test]
    fn failure_report_includes_stderr() {
        let err = PipelineError::ExecutionFailure {
            exit_code: Some(137),
            diagnostics: "Killed\n".to_string(),
            record: None,
        };
        assert_eq!(err.to_string(), "Segmentation container failed with exit code 137");
        assert_eq!(err.to_report().diagnostics.as_deref(), Some("Killed\n"));
    }

    #[test]
    fn spawn_errors_classify_as_runtime_unavailable() {
        let err = PipelineError::from_exec(ExecError::Spawn {
            runtime: "docker".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert_eq!(err.code(), "RUNTIME_UNAVAILABLE");
    }
}
