use crate::error::PipelineError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

const LOCK_FILE: &str = ".segmentation.lock";

static CASE_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid case id regex"));

/// Identifier used to name staged files: `<case_id>_<modality>.mha`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    /// Fresh request-scoped identifier, always `case_` plus 12 hex characters.
    pub fn generate() -> Self {
        let token = Uuid::new_v4().simple().to_string();
        CaseId(format!("case_{}", &token[..12]))
    }

    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        if CASE_ID_PATTERN.is_match(raw) {
            Ok(CaseId(raw.to_string()))
        } else {
            Err(PipelineError::staging(format!(
                "case id '{}' must be 1-64 ASCII letters, digits, '_' or '-', starting alphanumeric",
                raw
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Directory tree owned by exactly one pipeline invocation.
///
/// Ownership is enforced with a lock file created at claim time; a second
/// claim of the same root fails until the first workspace is dropped.
/// The lock holds the owner's pid. A process killed without unwinding
/// leaves it behind, and the root stays unclaimable until an operator
/// removes `.segmentation.lock` by hand.
/// Removing the tree itself is the owner's responsibility, except for
/// [`RequestWorkspace::temporary`] workspaces which are removed on drop.
#[derive(Debug)]
pub struct RequestWorkspace {
    root: PathBuf,
    lock_path: PathBuf,
    temp: Option<TempDir>,
}

impl RequestWorkspace {
    pub fn claim(root: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|err| {
            PipelineError::staging(format!(
                "failed to create workspace {}: {}",
                root.display(),
                err
            ))
        })?;
        let root = fs::canonicalize(root).map_err(|err| {
            PipelineError::staging(format!(
                "failed to resolve workspace {}: {}",
                root.display(),
                err
            ))
        })?;

        let lock_path = root.join(LOCK_FILE);
        let mut lock = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    PipelineError::staging(format!(
                        "workspace {} is already in use by another request",
                        root.display()
                    ))
                } else {
                    PipelineError::staging(format!(
                        "failed to lock workspace {}: {}",
                        root.display(),
                        err
                    ))
                }
            })?;
        if let Err(err) = writeln!(lock, "{}", std::process::id()) {
            drop(lock);
            let _ = fs::remove_file(&lock_path);
            return Err(PipelineError::staging(format!(
                "failed to write workspace lock {}: {}",
                lock_path.display(),
                err
            )));
        }

        debug!(root = %root.display(), "claimed workspace");
        Ok(Self {
            root,
            lock_path,
            temp: None,
        })
    }

    /// Claim a fresh directory under the system temp dir, removed on drop.
    pub fn temporary() -> Result<Self, PipelineError> {
        let temp = tempfile::Builder::new()
            .prefix("segmentation-")
            .tempdir()
            .map_err(|err| {
                PipelineError::staging(format!("failed to create temporary workspace: {}", err))
            })?;
        let mut workspace = Self::claim(temp.path())?;
        workspace.temp = Some(temp);
        Ok(workspace)
    }

    /// Release the lock and keep the tree on disk, returning its root.
    pub fn persist(mut self) -> PathBuf {
        if let Some(temp) = self.temp.take() {
            #[allow(deprecated)]
            let _ = temp.into_path();
        }
        self.root.clone()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mounted at `/input`.
    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.input_dir().join("images")
    }

    /// Mounted at `/output`.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Recreate empty input/output trees plus `output_subdirs` and open them
    /// to every principal, since the container may run under any uid.
    /// Anything left by an earlier run in this workspace is removed first.
    pub fn prepare(&self, output_subdirs: &[String]) -> Result<(), PipelineError> {
        let output = self.output_dir();
        for stale in [self.input_dir(), output.clone()] {
            match fs::remove_dir_all(&stale) {
                Ok(()) => debug!(dir = %stale.display(), "cleared previous run"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(PipelineError::staging(format!(
                        "failed to clear {}: {}",
                        stale.display(),
                        err
                    )))
                }
            }
        }

        let mut dirs = vec![self.input_dir(), self.images_dir(), output.clone()];
        for subdir in output_subdirs {
            let mut current = output.clone();
            for component in Path::new(subdir).components() {
                current.push(component);
                if !dirs.contains(&current) {
                    dirs.push(current.clone());
                }
            }
        }

        for dir in &dirs {
            fs::create_dir_all(dir).map_err(|err| {
                PipelineError::staging(format!(
                    "failed to create directory {}: {}",
                    dir.display(),
                    err
                ))
            })?;

            #[cfg(unix)]
            fs::set_permissions(dir, fs::Permissions::from_mode(0o777)).map_err(|err| {
                PipelineError::staging(format!(
                    "failed to set permissions on {}: {}",
                    dir.display(),
                    err
                ))
            })?;
        }

        Ok(())
    }
}

impl Drop for RequestWorkspace {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.lock_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(lock = %self.lock_path.display(), error = %err, "failed to release workspace lock");
            }
        }
    }
}
