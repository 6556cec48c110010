use crate::error::PipelineError;
use crate::workspace::{CaseId, RequestWorkspace};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use volume_io::{read_volume, write_volume, Modality, Volume};

/// Caller-supplied location of each input modality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePaths {
    pub t2w: PathBuf,
    pub adc: PathBuf,
    pub hbv: PathBuf,
}

impl SourcePaths {
    pub fn new(t2w: impl Into<PathBuf>, adc: impl Into<PathBuf>, hbv: impl Into<PathBuf>) -> Self {
        Self {
            t2w: t2w.into(),
            adc: adc.into(),
            hbv: hbv.into(),
        }
    }

    pub fn get(&self, modality: Modality) -> &Path {
        match modality {
            Modality::T2w => &self.t2w,
            Modality::Adc => &self.adc,
            Modality::Hbv => &self.hbv,
        }
    }
}

/// The three staged inputs of one case. Only produced once all three are on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputManifest {
    case_id: CaseId,
    t2w: PathBuf,
    adc: PathBuf,
    hbv: PathBuf,
    reference_shape: [usize; 3],
}

impl InputManifest {
    pub fn case_id(&self) -> &CaseId {
        &self.case_id
    }

    pub fn path(&self, modality: Modality) -> &Path {
        match modality {
            Modality::T2w => &self.t2w,
            Modality::Adc => &self.adc,
            Modality::Hbv => &self.hbv,
        }
    }

    /// Shape of the staged T2-weighted volume; the prediction must match it.
    pub fn reference_shape(&self) -> [usize; 3] {
        self.reference_shape
    }
}

pub fn staged_file_name(case_id: &CaseId, modality: Modality) -> String {
    format!("{}_{}.mha", case_id, modality)
}

/// Materializes the three inputs in the layout the model reads from `/input`.
#[derive(Debug, Clone)]
pub struct InputStager {
    output_subdirs: Vec<String>,
}

impl InputStager {
    pub fn new(output_subdirs: Vec<String>) -> Self {
        Self { output_subdirs }
    }

    /// Load every source first so a corrupt file fails before the workspace
    /// is touched, then reset the workspace trees and re-serialize each
    /// source as `<case_id>_<modality>.mha`.
    pub fn stage(
        &self,
        case_id: &CaseId,
        sources: &SourcePaths,
        workspace: &RequestWorkspace,
    ) -> Result<InputManifest, PipelineError> {
        let t2w = load_source(Modality::T2w, &sources.t2w)?;
        let adc = load_source(Modality::Adc, &sources.adc)?;
        let hbv = load_source(Modality::Hbv, &sources.hbv)?;

        workspace.prepare(&self.output_subdirs)?;

        let images_dir = workspace.images_dir();
        Ok(InputManifest {
            case_id: case_id.clone(),
            t2w: write_staged(&images_dir, case_id, Modality::T2w, &t2w)?,
            adc: write_staged(&images_dir, case_id, Modality::Adc, &adc)?,
            hbv: write_staged(&images_dir, case_id, Modality::Hbv, &hbv)?,
            reference_shape: t2w.shape(),
        })
    }
}

impl Default for InputStager {
    fn default() -> Self {
        Self::new(vec![crate::config::DETECTION_MAP_DIR.to_string()])
    }
}

fn write_staged(
    images_dir: &Path,
    case_id: &CaseId,
    modality: Modality,
    volume: &Volume,
) -> Result<PathBuf, PipelineError> {
    let target = images_dir.join(staged_file_name(case_id, modality));
    write_volume(volume, &target).map_err(|err| {
        PipelineError::staging(format!(
            "failed to write staged {} volume {}: {}",
            modality,
            target.display(),
            err
        ))
    })?;
    info!(%modality, path = %target.display(), shape = ?volume.shape(), "staged input");
    Ok(target)
}

fn load_source(modality: Modality, path: &Path) -> Result<Volume, PipelineError> {
    let volume = read_volume(path).map_err(|err| {
        PipelineError::staging(format!(
            "cannot read {} source {}: {}",
            modality,
            path.display(),
            err
        ))
    })?;
    Ok(volume.with_modality(modality))
}
