use crate::error::ExecError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Host directory bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    #[serde(default)]
    pub readonly: bool,
}

impl BindMount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            readonly: false,
        }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
}

/// Everything needed to render one `<runtime> run` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub mounts: Vec<BindMount>,
    #[serde(default)]
    pub name: Option<String>,
    /// `host` runs as the effective uid:gid of this process.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            mounts: Vec::new(),
            name: None,
            user: None,
            network: None,
            env: BTreeMap::new(),
            command: Vec::new(),
        }
    }

    pub fn mount(mut self, mount: BindMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<(), ExecError> {
        if self.image.trim().is_empty() {
            return Err(ExecError::InvalidSpec {
                message: "Container image reference cannot be empty".to_string(),
            });
        }

        let mut targets = BTreeSet::new();
        for mount in &self.mounts {
            if !mount.target.starts_with('/') {
                return Err(ExecError::InvalidSpec {
                    message: format!("Mount target '{}' must be absolute", mount.target),
                });
            }
            if !targets.insert(mount.target.as_str()) {
                return Err(ExecError::InvalidSpec {
                    message: format!("Mount target '{}' is bound twice", mount.target),
                });
            }
        }

        if let Some(name) = &self.name {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
            if !valid {
                return Err(ExecError::InvalidSpec {
                    message: format!("Container name '{}' is not a valid name", name),
                });
            }
        }

        Ok(())
    }
}

/// Append `run` arguments for `spec` to `command`.
///
/// Mount sources are canonicalized, so a missing host directory fails here,
/// before anything is spawned.
pub(crate) fn configure_command(
    command: &mut Command,
    spec: &ContainerSpec,
    name: &str,
) -> Result<(), ExecError> {
    command.arg("run");
    command.arg("--rm");
    command.arg("--name").arg(name);

    if let Some(network) = &spec.network {
        command.arg("--network").arg(network);
    }

    if let Some(user) = &spec.user {
        command.arg("--user").arg(container_user(user));
    }

    for mount in &spec.mounts {
        let source = fs::canonicalize(&mount.source).map_err(|source| ExecError::InvalidMount {
            path: mount.source.clone(),
            source,
        })?;
        command.arg("--mount").arg(format!(
            "type=bind,source={},target={},readonly={}",
            source.display(),
            mount.target,
            mount.readonly
        ));
    }

    for (key, value) in &spec.env {
        command.arg("--env").arg(format!("{}={}", key, value));
    }

    command.arg(&spec.image);
    for part in &spec.command {
        command.arg(part);
    }

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    Ok(())
}

fn container_user(requested: &str) -> String {
    if requested != "host" {
        return requested.to_string();
    }
    #[cfg(unix)]
    {
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        format!("{}:{}", uid, gid)
    }
    #[cfg(not(unix))]
    {
        // No host identity to borrow; fall back to nobody.
        "65534:65534".to_string()
    }
}

pub(crate) fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

pub(crate) fn command_line_string(cmd: &Command) -> String {
    let mut s = String::new();
    s.push_str(&cmd.get_program().to_string_lossy());
    for a in cmd.get_args() {
        s.push(' ');
        let a = a.to_string_lossy();
        if a.is_empty() || a.contains(' ') || a.contains('"') || a.contains('\'') {
            s.push_str(&shell_escape(&a));
        } else {
            s.push_str(&a);
        }
    }
    s
}
