use crate::element::ElementType;
use crate::error::VolumeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const IDENTITY: [f64; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// MRI acquisition type of an input volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    T2w,
    Adc,
    Hbv,
}

impl Modality {
    /// All modalities in the order the model contract lists them.
    pub const ALL: [Modality; 3] = [Modality::T2w, Modality::Adc, Modality::Hbv];

    pub fn as_str(self) -> &'static str {
        match self {
            Modality::T2w => "t2w",
            Modality::Adc => "adc",
            Modality::Hbv => "hbv",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "t2w" => Ok(Modality::T2w),
            "adc" => Ok(Modality::Adc),
            "hbv" => Ok(Modality::Hbv),
            other => Err(format!("unknown modality '{other}' (expected t2w, adc or hbv)")),
        }
    }
}

/// On-disk container for a volume, derived from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    MetaImage,
    Nifti { compressed: bool },
}

impl VolumeFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".mha") {
            Some(VolumeFormat::MetaImage)
        } else if name.ends_with(".nii.gz") {
            Some(VolumeFormat::Nifti { compressed: true })
        } else if name.ends_with(".nii") {
            Some(VolumeFormat::Nifti { compressed: false })
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            VolumeFormat::MetaImage => "mha",
            VolumeFormat::Nifti { compressed: true } => "nii.gz",
            VolumeFormat::Nifti { compressed: false } => "nii",
        }
    }
}

/// A 3D array of scalar intensities in (slice, row, column) order.
///
/// Geometry (spacing, origin, direction) is carried as stored in the source
/// header; no RAS/LPS conversion is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    shape: [usize; 3],
    spacing: [f64; 3],
    origin: [f64; 3],
    direction: [f64; 9],
    element_type: ElementType,
    data: Vec<f64>,
    modality: Option<Modality>,
    source: Option<PathBuf>,
}

/// Product of the three extents, or `None` when it does not fit in `usize`.
pub fn voxel_count(shape: [usize; 3]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &extent| acc.checked_mul(extent))
}

impl Volume {
    pub fn new(
        shape: [usize; 3],
        element_type: ElementType,
        data: Vec<f64>,
    ) -> Result<Self, VolumeError> {
        let expected = voxel_count(shape).ok_or(VolumeError::TooLarge { shape })?;
        if data.len() != expected {
            return Err(VolumeError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            shape,
            spacing: [1.0; 3],
            origin: [0.0; 3],
            direction: IDENTITY,
            element_type,
            data,
            modality: None,
            source: None,
        })
    }

    /// Volume with every voxel set to `value`.
    pub fn filled(
        shape: [usize; 3],
        element_type: ElementType,
        value: f64,
    ) -> Result<Self, VolumeError> {
        let len = voxel_count(shape).ok_or(VolumeError::TooLarge { shape })?;
        Self::new(shape, element_type, vec![value; len])
    }

    pub fn with_geometry(mut self, spacing: [f64; 3], origin: [f64; 3], direction: [f64; 9]) -> Self {
        self.spacing = spacing;
        self.origin = origin;
        self.direction = direction;
        self
    }

    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = Some(modality);
        self
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Spacing along (x, y, z), i.e. (column, row, slice).
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    /// Row-major 3x3 direction cosines.
    pub fn direction(&self) -> [f64; 9] {
        self.direction
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn modality(&self) -> Option<Modality> {
        self.modality
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn voxel(&self, slice: usize, row: usize, column: usize) -> Option<f64> {
        let [slices, rows, columns] = self.shape;
        if slice >= slices || row >= rows || column >= columns {
            return None;
        }
        self.data.get((slice * rows + row) * columns + column).copied()
    }

    /// True when both volumes hold the same shape and voxels, ignoring tags and geometry.
    pub fn same_voxels(&self, other: &Volume) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}
