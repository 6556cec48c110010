use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use volume_io::{read_volume, Volume};
use walkdir::WalkDir;

const ACCEPTED_SUFFIXES: [&str; 2] = [".mha", ".nii.gz"];

/// What to do when the model leaves more than one candidate behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputPolicy {
    /// Take the lexicographically first path and log the rest.
    #[default]
    FirstSorted,
    /// Fail with `AmbiguousOutput`.
    RequireUnique,
}

#[derive(Debug, Clone)]
pub struct ResolvedOutput {
    pub path: PathBuf,
    pub volume: Volume,
    /// Candidates that were found but not selected.
    pub alternatives: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct OutputResolver {
    policy: OutputPolicy,
}

impl OutputResolver {
    pub fn new(policy: OutputPolicy) -> Self {
        Self { policy }
    }

    /// Every `.mha` / `.nii.gz` file under `output_dir`, sorted by full path.
    pub fn candidates(&self, output_dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = WalkDir::new(output_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry in output tree");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_accepted(entry.path()))
            .map(|entry| entry.into_path())
            .collect();
        found.sort();
        found
    }

    pub fn resolve(&self, output_dir: &Path) -> Result<ResolvedOutput, PipelineError> {
        let mut candidates = self.candidates(output_dir);
        if candidates.is_empty() {
            return Err(PipelineError::OutputNotFound {
                output_dir: output_dir.to_path_buf(),
            });
        }

        if candidates.len() > 1 {
            match self.policy {
                OutputPolicy::RequireUnique => {
                    return Err(PipelineError::AmbiguousOutput { candidates });
                }
                OutputPolicy::FirstSorted => warn!(
                    count = candidates.len(),
                    selected = %candidates[0].display(),
                    "multiple prediction candidates; selecting the first by path"
                ),
            }
        }

        let path = candidates.remove(0);
        let volume = read_volume(&path).map_err(|err| PipelineError::OutputRead {
            path: path.clone(),
            message: err.to_string(),
        })?;
        info!(path = %path.display(), shape = ?volume.shape(), "resolved prediction");

        Ok(ResolvedOutput {
            path,
            volume,
            alternatives: candidates,
        })
    }
}

fn is_accepted(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| {
            let name = name.to_ascii_lowercase();
            ACCEPTED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        })
        .unwrap_or(false)
}
