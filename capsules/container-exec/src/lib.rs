//! Bounded, single-shot execution of an OCI image through a container runtime CLI.

mod error;
mod probe;
mod record;
mod spec;

pub use error::ExecError;
pub use probe::RuntimeProbe;
pub use record::{ExecutionRecord, ExecutionState};
pub use spec::{BindMount, ContainerSpec};

use record::CommandLogs;
use spec::{command_line_string, configure_command};
use std::io::{ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs containers through a runtime CLI (`docker` or a compatible binary).
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    runtime_bin: String,
    probe: RuntimeProbe,
}

impl ContainerExecutor {
    pub fn new(runtime_bin: impl Into<String>) -> Self {
        let runtime_bin = runtime_bin.into();
        Self {
            probe: RuntimeProbe::new(runtime_bin.clone()),
            runtime_bin,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe = self.probe.with_timeout(timeout);
        self
    }

    pub fn runtime_bin(&self) -> &str {
        &self.runtime_bin
    }

    pub fn probe(&self) -> &RuntimeProbe {
        &self.probe
    }

    /// Run `spec` once, blocking the calling thread for at most `timeout`.
    ///
    /// Errors are only returned while launching; once the runtime client is
    /// running, success, non-zero exit and timeout all come back as an
    /// [`ExecutionRecord`]. There is no retry.
    pub fn execute(
        &self,
        spec: &ContainerSpec,
        timeout: Duration,
    ) -> Result<ExecutionRecord, ExecError> {
        spec.validate()?;

        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("container-exec-{}", Uuid::new_v4().simple()));
        let mut record = ExecutionRecord::start(&name, &spec.image, timeout);
        record.advance(ExecutionState::Launching)?;

        if !self.probe.is_runtime_available() {
            return Err(ExecError::RuntimeUnavailable {
                runtime: self.runtime_bin.clone(),
            });
        }

        let mut command = Command::new(&self.runtime_bin);
        configure_command(&mut command, spec, &name)?;
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so a timeout can take down anything the client forked.
            command.process_group(0);
        }
        debug!(command = %command_line_string(&command), "launching container");

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            runtime: self.runtime_bin.clone(),
            source,
        })?;
        record.advance(ExecutionState::Running)?;
        info!(container = %name, image = %spec.image, timeout = ?timeout, "container running");

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let (state, exit_code) = match child.wait_timeout(timeout) {
            Ok(Some(status)) if status.success() => (ExecutionState::Succeeded, status.code()),
            Ok(Some(status)) => (ExecutionState::Failed, status.code()),
            Ok(None) => {
                warn!(container = %name, timeout = ?timeout, "container exceeded timeout; terminating");
                self.stop_container(&name);
                terminate(&mut child);
                (ExecutionState::TimedOut, None)
            }
            Err(source) => {
                terminate(&mut child);
                return Err(ExecError::Wait { source });
            }
        };
        let elapsed = start.elapsed();

        // A process that outlives the client can hold the pipes open.
        let deadline = Instant::now() + PIPE_GRACE;
        let logs = CommandLogs {
            stdout: collect(stdout, deadline),
            stderr: collect(stderr, deadline),
        };

        let record = record.finish(state, exit_code, logs, elapsed)?;
        match record.state() {
            ExecutionState::Succeeded => {
                info!(container = %name, duration_ms = record.duration_ms(), "container succeeded");
                if !record.stdout().trim().is_empty() {
                    debug!(stdout = %truncate(record.stdout(), 2048), "container stdout");
                }
            }
            ExecutionState::Failed => {
                warn!(
                    container = %name,
                    exit_code = ?record.exit_code(),
                    stderr = %truncate(record.stderr(), 2048),
                    "container exited non-zero"
                );
            }
            _ => {}
        }

        Ok(record)
    }

    /// Best-effort `<runtime> kill <name>`: killing the client alone leaves the
    /// container running inside the daemon.
    fn stop_container(&self, name: &str) {
        let child = Command::new(&self.runtime_bin)
            .arg("kill")
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                warn!(container = %name, error = %err, "failed to request container kill");
                return;
            }
        };

        match child.wait_timeout(RuntimeProbe::DEFAULT_TIMEOUT) {
            Ok(Some(status)) if status.success() => debug!(container = %name, "container killed"),
            Ok(Some(status)) => warn!(container = %name, ?status, "container kill exited non-zero"),
            Ok(None) | Err(_) => {
                warn!(container = %name, "container kill did not complete");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

impl Default for ContainerExecutor {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// How long log collection waits for the pipes to close once the client exits.
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// SIGKILL the child's process group, then the child itself, and reap it.
/// The child must have been spawned with `process_group(0)`.
pub(crate) fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let pgid = child.id() as libc::pid_t;
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
            debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Forward everything read from `pipe` as chunks until EOF.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<Vec<u8>>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(chunk[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
        rx
    })
}

/// Gather chunks until the pipe closes or `deadline` passes, keeping
/// whatever arrived in time.
fn collect(stream: Option<Receiver<Vec<u8>>>, deadline: Instant) -> String {
    let Some(stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    loop {
        match stream.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                warn!(grace = ?PIPE_GRACE, "output pipe still open after exit; logs may be incomplete");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Cap `text` at `limit` bytes (on a char boundary) for log output.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = text[..end].to_string();
    truncated.push_str("… (truncated)");
    truncated
}
