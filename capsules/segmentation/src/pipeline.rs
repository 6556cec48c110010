use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::resolver::OutputResolver;
use crate::staging::{InputManifest, InputStager, SourcePaths};
use crate::stats::{summarize, StatisticsSummary};
use crate::workspace::{CaseId, RequestWorkspace};
use capsules_container_exec::{
    truncate, BindMount, ContainerExecutor, ContainerSpec, ExecutionRecord, ExecutionState,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, instrument};
use uuid::Uuid;
use volume_io::Modality;

pub const INPUT_MOUNT: &str = "/input";
pub const OUTPUT_MOUNT: &str = "/output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
}

/// Result bundle handed back to the caller of [`Pipeline::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub status: ResultStatus,
    pub case_id: CaseId,
    pub prediction_path: PathBuf,
    pub t2w_path: PathBuf,
    pub adc_path: PathBuf,
    pub hbv_path: PathBuf,
    pub statistics: StatisticsSummary,
    #[serde(skip)]
    pub execution: Option<ExecutionRecord>,
}

/// Probe, stage, execute, resolve, summarize. Each step short-circuits.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    executor: ContainerExecutor,
    stager: InputStager,
    resolver: OutputResolver,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let executor =
            ContainerExecutor::new(config.runtime.clone()).with_probe_timeout(config.probe_timeout);
        Self {
            executor,
            stager: InputStager::new(config.output_subdirs.clone()),
            resolver: OutputResolver::new(config.output_policy),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_runtime_available(&self) -> bool {
        self.executor.probe().is_runtime_available()
    }

    /// Run one case to completion in `workspace`, blocking for at most the
    /// configured timeout while the container runs.
    #[instrument(skip(self, case_id, sources, workspace), fields(case_id = %case_id, workspace = %workspace.root().display()))]
    pub fn run(
        &self,
        case_id: &CaseId,
        sources: &SourcePaths,
        workspace: &RequestWorkspace,
    ) -> Result<PipelineResult, PipelineError> {
        if !self.is_runtime_available() {
            return Err(PipelineError::RuntimeUnavailable {
                runtime: self.config.runtime.clone(),
            });
        }

        let manifest = self.stager.stage(case_id, sources, workspace)?;
        info!(images = %workspace.images_dir().display(), "inputs staged");

        let record = self.execute(case_id, workspace)?;

        let resolved = self.resolver.resolve(&workspace.output_dir())?;
        check_shape(&manifest, &resolved.path, resolved.volume.shape())?;

        let statistics = summarize(&resolved.volume);
        info!(
            prediction = %resolved.path.display(),
            mean = statistics.mean_probability,
            max = statistics.max_probability,
            positive = statistics.positive_voxels,
            "segmentation complete"
        );

        Ok(PipelineResult {
            status: ResultStatus::Success,
            case_id: case_id.clone(),
            prediction_path: resolved.path,
            t2w_path: manifest.path(Modality::T2w).to_path_buf(),
            adc_path: manifest.path(Modality::Adc).to_path_buf(),
            hbv_path: manifest.path(Modality::Hbv).to_path_buf(),
            statistics,
            execution: Some(record),
        })
    }

    /// Like [`Pipeline::run`] with a freshly generated case id.
    pub fn run_new_case(
        &self,
        sources: &SourcePaths,
        workspace: &RequestWorkspace,
    ) -> Result<PipelineResult, PipelineError> {
        self.run(&CaseId::generate(), sources, workspace)
    }

    fn container_spec(&self, case_id: &CaseId, workspace: &RequestWorkspace) -> ContainerSpec {
        let suffix = Uuid::new_v4().simple().to_string();
        let mut spec = ContainerSpec::new(self.config.image.clone())
            .named(format!("segmentation-{}-{}", case_id, &suffix[..8]))
            .mount(BindMount::new(workspace.input_dir(), INPUT_MOUNT))
            .mount(BindMount::new(workspace.output_dir(), OUTPUT_MOUNT));
        spec.user = self.config.container_user.clone();
        spec.network = self.config.network.clone();
        spec
    }

    fn execute(
        &self,
        case_id: &CaseId,
        workspace: &RequestWorkspace,
    ) -> Result<ExecutionRecord, PipelineError> {
        let spec = self.container_spec(case_id, workspace);
        let record = self
            .executor
            .execute(&spec, self.config.timeout)
            .map_err(PipelineError::from_exec)?;

        match record.state() {
            ExecutionState::Succeeded => Ok(record),
            ExecutionState::TimedOut => {
                error!(timeout = ?self.config.timeout, container = record.container_name(), "segmentation container timed out");
                Err(PipelineError::ExecutionTimeout {
                    timeout: self.config.timeout,
                    record: Box::new(record),
                })
            }
            _ => {
                error!(
                    exit_code = ?record.exit_code(),
                    stderr = %truncate(record.diagnostic(), 2048),
                    "segmentation container failed"
                );
                Err(PipelineError::ExecutionFailure {
                    exit_code: record.exit_code(),
                    diagnostics: record.diagnostic().to_string(),
                    record: Some(Box::new(record)),
                })
            }
        }
    }
}

fn check_shape(
    manifest: &InputManifest,
    prediction: &Path,
    shape: [usize; 3],
) -> Result<(), PipelineError> {
    if shape == manifest.reference_shape() {
        return Ok(());
    }
    Err(PipelineError::OutputRead {
        path: prediction.to_path_buf(),
        message: format!(
            "prediction shape {:?} does not match T2-weighted input shape {:?}",
            shape,
            manifest.reference_shape()
        ),
    })
}
