//! Reading and writing of the 3D scalar volumes exchanged with the segmentation model.
//!
//! Two on-disk formats are understood: single-file MetaImage (`.mha`) and
//! single-file NIfTI-1 (`.nii`, or gzip-compressed `.nii.gz`).

pub mod element;
pub mod error;
pub mod metaimage;
pub mod nifti;
pub mod volume;

pub use element::ElementType;
pub use error::VolumeError;
pub use volume::{Modality, Volume, VolumeFormat};

use std::fs;
use std::path::Path;
use tracing::debug;

/// Load a volume from disk, choosing the codec from the file name.
pub fn read_volume(path: impl AsRef<Path>) -> Result<Volume, VolumeError> {
    let path = path.as_ref();
    let format = VolumeFormat::from_path(path).ok_or_else(|| VolumeError::UnsupportedFormat {
        path: path.to_path_buf(),
    })?;

    let bytes = fs::read(path).map_err(|source| VolumeError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let volume = match format {
        VolumeFormat::MetaImage => metaimage::decode(&bytes)?,
        VolumeFormat::Nifti { compressed } => nifti::decode(&bytes, compressed)?,
    };

    debug!(
        path = %path.display(),
        shape = ?volume.shape(),
        element_type = volume.element_type().met_name(),
        "loaded volume"
    );

    Ok(volume.with_source(path))
}

/// Serialize a volume to disk, choosing the codec from the file name.
pub fn write_volume(volume: &Volume, path: impl AsRef<Path>) -> Result<(), VolumeError> {
    let path = path.as_ref();
    let format = VolumeFormat::from_path(path).ok_or_else(|| VolumeError::UnsupportedFormat {
        path: path.to_path_buf(),
    })?;

    let bytes = match format {
        VolumeFormat::MetaImage => metaimage::encode(volume),
        VolumeFormat::Nifti { compressed } => nifti::encode(volume, compressed)?,
    };

    fs::write(path, bytes).map_err(|source| VolumeError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(path = %path.display(), shape = ?volume.shape(), "wrote volume");
    Ok(())
}
