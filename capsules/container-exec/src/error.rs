use crate::record::ExecutionState;
use std::path::PathBuf;
use thiserror::Error;

/// Failures raised before a container process outcome exists.
///
/// Once the runtime client has been spawned every outcome (success, non-zero
/// exit, timeout) is reported through [`crate::ExecutionRecord`] instead.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Container runtime '{runtime}' is not available")]
    RuntimeUnavailable { runtime: String },

    #[error("Invalid container spec: {message}")]
    InvalidSpec { message: String },

    #[error("Mount source {path} cannot be resolved: {source}")]
    InvalidMount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn container runtime {runtime}: {source}")]
    Spawn {
        runtime: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting on container runtime: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid execution state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ExecutionState,
        to: ExecutionState,
    },
}

impl ExecError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::RuntimeUnavailable { .. } => "CONTAINER_EXEC_RUNTIME_UNAVAILABLE",
            ExecError::InvalidSpec { .. } => "CONTAINER_EXEC_INVALID_SPEC",
            ExecError::InvalidMount { .. } => "CONTAINER_EXEC_INVALID_MOUNT",
            ExecError::Spawn { .. } => "CONTAINER_EXEC_RUNTIME_ERROR",
            ExecError::Wait { .. } => "CONTAINER_EXEC_WAIT_ERROR",
            ExecError::InvalidTransition { .. } => "CONTAINER_EXEC_INVALID_TRANSITION",
        }
    }
}
