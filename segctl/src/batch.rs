use anyhow::{bail, Context, Result};
use capsules_segmentation::{
    CaseId, ErrorReport, Pipeline, PipelineError, PipelineResult, RequestWorkspace, SourcePaths,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BatchCase {
    #[serde(default)]
    pub case_id: Option<String>,
    pub t2w: PathBuf,
    pub adc: PathBuf,
    pub hbv: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CaseOutcome {
    Success(Box<PipelineResult>),
    Failure {
        #[serde(skip_serializing_if = "Option::is_none")]
        case_id: Option<CaseId>,
        #[serde(flatten)]
        report: ErrorReport,
    },
}

#[derive(Debug, Serialize)]
pub struct BatchEntry {
    pub index: usize,
    #[serde(flatten)]
    pub outcome: CaseOutcome,
}

impl BatchEntry {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CaseOutcome::Success(_))
    }
}

/// A YAML sequence of `{caseId?, t2w, adc, hbv}` entries.
pub fn load_manifest(path: &Path) -> Result<Vec<BatchCase>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch manifest {}", path.display()))?;
    let cases: Vec<BatchCase> = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse batch manifest {}", path.display()))?;
    if cases.is_empty() {
        bail!("Batch manifest {} lists no cases", path.display());
    }
    Ok(cases)
}

/// Each case runs on its own blocking worker with its own workspace; at most
/// `concurrency` containers are in flight. Entries come back in manifest order.
pub async fn run_batch(
    pipeline: Arc<Pipeline>,
    cases: Vec<BatchCase>,
    concurrency: usize,
    workspace_root: Option<PathBuf>,
) -> Result<Vec<BatchEntry>> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    info!(cases = cases.len(), concurrency, "starting batch");

    let mut handles = Vec::with_capacity(cases.len());
    for (index, case) in cases.into_iter().enumerate() {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .context("Batch semaphore closed")?;
        let pipeline = pipeline.clone();
        let workspace_root = workspace_root.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let outcome = run_one(&pipeline, case, workspace_root.as_deref());
            BatchEntry { index, outcome }
        }));
    }

    let mut entries = Vec::with_capacity(handles.len());
    for handle in handles {
        entries.push(handle.await.context("Batch worker panicked")?);
    }

    let failed = entries.iter().filter(|e| !e.is_success()).count();
    if failed > 0 {
        warn!(failed, total = entries.len(), "batch finished with failures");
    } else {
        info!(total = entries.len(), "batch finished");
    }
    Ok(entries)
}

fn run_one(pipeline: &Pipeline, case: BatchCase, workspace_root: Option<&Path>) -> CaseOutcome {
    let case_id = match case.case_id.as_deref().map(CaseId::parse) {
        Some(Ok(id)) => id,
        None => CaseId::generate(),
        Some(Err(err)) => return failure(None, err),
    };

    let workspace = match workspace_root {
        Some(root) => RequestWorkspace::claim(root.join(case_id.as_str())),
        None => RequestWorkspace::temporary(),
    };
    let workspace = match workspace {
        Ok(workspace) => workspace,
        Err(err) => return failure(Some(case_id), err),
    };

    let sources = SourcePaths::new(case.t2w, case.adc, case.hbv);
    match pipeline.run(&case_id, &sources, &workspace) {
        Ok(result) => CaseOutcome::Success(Box::new(result)),
        Err(err) => failure(Some(case_id), err),
    }
}

fn failure(case_id: Option<CaseId>, err: PipelineError) -> CaseOutcome {
    CaseOutcome::Failure {
        case_id,
        report: err.to_report(),
    }
}
