use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

/// Checks that the container runtime binary answers a version query.
#[derive(Debug, Clone)]
pub struct RuntimeProbe {
    runtime_bin: String,
    timeout: Duration,
}

impl RuntimeProbe {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(runtime_bin: impl Into<String>) -> Self {
        Self {
            runtime_bin: runtime_bin.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn runtime_bin(&self) -> &str {
        &self.runtime_bin
    }

    /// False on a missing executable, a non-zero exit, a hung query or any
    /// other invocation error. Never fails.
    pub fn is_runtime_available(&self) -> bool {
        self.runtime_version().is_some()
    }

    /// First line of `<runtime> --version`, if the query succeeds in time.
    pub fn runtime_version(&self) -> Option<String> {
        let mut command = Command::new(&self.runtime_bin);
        command
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                debug!(runtime = %self.runtime_bin, error = %err, "runtime probe could not spawn");
                return None;
            }
        };

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                debug!(runtime = %self.runtime_bin, timeout = ?self.timeout, "runtime probe timed out");
                crate::terminate(&mut child);
                return None;
            }
            Err(err) => {
                debug!(runtime = %self.runtime_bin, error = %err, "runtime probe wait failed");
                crate::terminate(&mut child);
                return None;
            }
        };

        if !status.success() {
            debug!(runtime = %self.runtime_bin, ?status, "runtime probe exited non-zero");
            return None;
        }

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            let _ = pipe.read_to_string(&mut stdout);
        }
        Some(stdout.lines().next().unwrap_or_default().trim().to_string())
    }
}
