use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported volume format for {path} (expected .mha, .nii or .nii.gz)")]
    UnsupportedFormat { path: PathBuf },

    #[error("Malformed {format} header: {message}")]
    MalformedHeader {
        format: &'static str,
        message: String,
    },

    #[error("Unsupported element type: {0}")]
    UnsupportedElementType(String),

    #[error("Voxel data truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Voxel count {actual} does not match shape {shape:?} ({expected} voxels)")]
    ShapeMismatch {
        shape: [usize; 3],
        expected: usize,
        actual: usize,
    },

    #[error("Shape {shape:?} has more voxels than can be addressed")]
    TooLarge { shape: [usize; 3] },

    #[error("Compressed voxel data could not be processed: {message}")]
    Compression { message: String },
}

impl VolumeError {
    pub(crate) fn metaimage(message: impl Into<String>) -> Self {
        VolumeError::MalformedHeader {
            format: "MetaImage",
            message: message.into(),
        }
    }

    pub(crate) fn nifti(message: impl Into<String>) -> Self {
        VolumeError::MalformedHeader {
            format: "NIfTI-1",
            message: message.into(),
        }
    }
}
