//! Single-file NIfTI-1 codec (`.nii` and gzip-compressed `.nii.gz`).

use crate::element::ElementType;
use crate::error::VolumeError;
use crate::volume::{voxel_count, Volume};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;

const OFF_DIM: usize = 40;
const OFF_DATATYPE: usize = 70;
const OFF_BITPIX: usize = 72;
const OFF_PIXDIM: usize = 76;
const OFF_VOX_OFFSET: usize = 108;
const OFF_SCL_SLOPE: usize = 112;
const OFF_SCL_INTER: usize = 116;
const OFF_XYZT_UNITS: usize = 123;
const OFF_QFORM_CODE: usize = 252;
const OFF_SFORM_CODE: usize = 254;
const OFF_QOFFSET: usize = 268;
const OFF_SROW: usize = 280;
const OFF_MAGIC: usize = 344;

/// Parse an in-memory NIfTI-1 file, inflating it first when `compressed`.
pub fn decode(bytes: &[u8], compressed: bool) -> Result<Volume, VolumeError> {
    let inflated;
    let bytes = if compressed {
        let mut decoder = GzDecoder::new(bytes);
        let mut buf = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .map_err(|err| VolumeError::Compression {
                message: err.to_string(),
            })?;
        inflated = buf;
        inflated.as_slice()
    } else {
        bytes
    };

    if bytes.len() < HEADER_SIZE {
        return Err(VolumeError::nifti(format!(
            "file is {} bytes, shorter than the {HEADER_SIZE}-byte header",
            bytes.len()
        )));
    }

    let reader = HeaderReader::detect(bytes)?;

    let magic = &bytes[OFF_MAGIC..OFF_MAGIC + 4];
    if &magic[..3] != b"n+1" {
        return Err(VolumeError::nifti(format!(
            "only single-file NIfTI-1 is supported (magic {:?})",
            String::from_utf8_lossy(&magic[..3])
        )));
    }

    let dim: Vec<i16> = (0..8).map(|i| reader.i16(OFF_DIM + i * 2)).collect();
    let ndim = dim[0];
    if !(2..=7).contains(&ndim) {
        return Err(VolumeError::nifti(format!("dim[0] = {ndim} is out of range")));
    }
    if ndim > 3 && dim[4..=(ndim as usize)].iter().any(|extent| *extent > 1) {
        return Err(VolumeError::nifti(
            "only single-frame, single-channel volumes are supported",
        ));
    }
    let extent = |axis: usize| -> Result<usize, VolumeError> {
        if axis > ndim as usize {
            return Ok(1);
        }
        usize::try_from(dim[axis])
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| VolumeError::nifti(format!("dim[{axis}] = {} is not positive", dim[axis])))
    };
    let shape = [extent(3)?, extent(2)?, extent(1)?];

    let code = reader.i16(OFF_DATATYPE);
    let element_type = ElementType::from_nifti_code(code)
        .ok_or_else(|| VolumeError::UnsupportedElementType(format!("NIfTI datatype {code}")))?;

    let vox_offset = reader.f32(OFF_VOX_OFFSET);
    if !vox_offset.is_finite() || vox_offset < HEADER_SIZE as f32 {
        return Err(VolumeError::nifti(format!("vox_offset {vox_offset} is invalid")));
    }
    let start = vox_offset as usize;
    let expected = voxel_count(shape)
        .and_then(|voxels| voxels.checked_mul(element_type.size()))
        .ok_or_else(|| VolumeError::nifti("dim overflows"))?;
    let available = bytes.len().saturating_sub(start);
    if available < expected {
        return Err(VolumeError::Truncated {
            expected,
            actual: available,
        });
    }

    let mut data = element_type.decode(&bytes[start..start + expected], reader.big_endian);
    let mut element_type = element_type;

    let slope = reader.f32(OFF_SCL_SLOPE) as f64;
    let inter = reader.f32(OFF_SCL_INTER) as f64;
    if slope != 0.0 && slope.is_finite() && !(slope == 1.0 && inter == 0.0) {
        for value in &mut data {
            *value = *value * slope + inter;
        }
        element_type = ElementType::F64;
    }

    let spacing = [
        reader.f32(OFF_PIXDIM + 4) as f64,
        reader.f32(OFF_PIXDIM + 8) as f64,
        reader.f32(OFF_PIXDIM + 12) as f64,
    ]
    .map(|s| if s > 0.0 { s } else { 1.0 });

    let (origin, direction) = if reader.i16(OFF_SFORM_CODE) > 0 {
        let mut origin = [0.0; 3];
        let mut direction = [0.0; 9];
        for row in 0..3 {
            for col in 0..4 {
                let value = reader.f32(OFF_SROW + (row * 4 + col) * 4) as f64;
                if col == 3 {
                    origin[row] = value;
                } else {
                    direction[row * 3 + col] = value / spacing[col];
                }
            }
        }
        (origin, direction)
    } else if reader.i16(OFF_QFORM_CODE) > 0 {
        let origin = [
            reader.f32(OFF_QOFFSET) as f64,
            reader.f32(OFF_QOFFSET + 4) as f64,
            reader.f32(OFF_QOFFSET + 8) as f64,
        ];
        (origin, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    } else {
        ([0.0; 3], [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    };

    Ok(Volume::new(shape, element_type, data)?.with_geometry(spacing, origin, direction))
}

/// Render a volume as a little-endian NIfTI-1 file with an sform built from its geometry.
pub fn encode(volume: &Volume, compressed: bool) -> Result<Vec<u8>, VolumeError> {
    let [slices, rows, columns] = volume.shape();
    let extents = [columns, rows, slices]
        .iter()
        .map(|n| i16::try_from(*n))
        .collect::<Result<Vec<i16>, _>>()
        .map_err(|_| VolumeError::nifti("volume extent exceeds the NIfTI-1 limit of 32767"))?;

    let element_type = volume.element_type();
    let spacing = volume.spacing();
    let origin = volume.origin();
    let direction = volume.direction();

    let mut header = HeaderWriter::new();
    header.i32(0, HEADER_SIZE as i32);
    header.i16(OFF_DIM, 3);
    for (axis, extent) in extents.iter().enumerate() {
        header.i16(OFF_DIM + (axis + 1) * 2, *extent);
    }
    for axis in 4..8 {
        header.i16(OFF_DIM + axis * 2, 1);
    }
    header.i16(OFF_DATATYPE, element_type.nifti_code());
    header.i16(OFF_BITPIX, (element_type.size() * 8) as i16);
    header.f32(OFF_PIXDIM, 1.0);
    for (axis, value) in spacing.iter().enumerate() {
        header.f32(OFF_PIXDIM + (axis + 1) * 4, *value as f32);
    }
    header.f32(OFF_VOX_OFFSET, VOX_OFFSET as f32);
    header.f32(OFF_SCL_SLOPE, 1.0);
    header.f32(OFF_SCL_INTER, 0.0);
    // NIFTI_UNITS_MM
    header.bytes[OFF_XYZT_UNITS] = 2;
    header.i16(OFF_SFORM_CODE, 1);
    for row in 0..3 {
        for col in 0..3 {
            let value = direction[row * 3 + col] * spacing[col];
            header.f32(OFF_SROW + (row * 4 + col) * 4, value as f32);
        }
        header.f32(OFF_SROW + (row * 4 + 3) * 4, origin[row] as f32);
    }
    header.bytes[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(b"n+1\0");

    let mut out = header.bytes;
    // Empty extension block between the header and vox_offset.
    out.extend_from_slice(&[0u8; VOX_OFFSET - HEADER_SIZE]);
    element_type.encode(volume.data(), &mut out);

    if !compressed {
        return Ok(out);
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&out)
        .and_then(|_| encoder.finish())
        .map_err(|err| VolumeError::Compression {
            message: err.to_string(),
        })
}

struct HeaderReader<'a> {
    bytes: &'a [u8],
    big_endian: bool,
}

impl<'a> HeaderReader<'a> {
    /// The byte order is whichever makes `sizeof_hdr` read as 348.
    fn detect(bytes: &'a [u8]) -> Result<Self, VolumeError> {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if i32::from_le_bytes(raw) == HEADER_SIZE as i32 {
            Ok(Self {
                bytes,
                big_endian: false,
            })
        } else if i32::from_be_bytes(raw) == HEADER_SIZE as i32 {
            Ok(Self {
                bytes,
                big_endian: true,
            })
        } else {
            Err(VolumeError::nifti("sizeof_hdr is not 348"))
        }
    }

    fn i16(&self, offset: usize) -> i16 {
        let raw = [self.bytes[offset], self.bytes[offset + 1]];
        if self.big_endian {
            i16::from_be_bytes(raw)
        } else {
            i16::from_le_bytes(raw)
        }
    }

    fn f32(&self, offset: usize) -> f32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        if self.big_endian {
            f32::from_be_bytes(raw)
        } else {
            f32::from_le_bytes(raw)
        }
    }
}

struct HeaderWriter {
    bytes: Vec<u8>,
}

impl HeaderWriter {
    fn new() -> Self {
        Self {
            bytes: vec![0u8; HEADER_SIZE],
        }
    }

    fn i16(&mut self, offset: usize, value: i16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, offset: usize, value: i32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn f32(&mut self, offset: usize, value: f32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}
