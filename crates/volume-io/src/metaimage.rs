//! MetaImage (`.mha`) codec: a `Key = Value` text header followed by the raw voxel block.

use crate::element::ElementType;
use crate::error::VolumeError;
use crate::volume::{voxel_count, Volume};
use flate2::read::ZlibDecoder;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Read;

/// Parse an in-memory `.mha` file.
pub fn decode(bytes: &[u8]) -> Result<Volume, VolumeError> {
    let (header, data_start) = parse_header(bytes)?;

    let data_file = header
        .get("ElementDataFile")
        .map(String::as_str)
        .unwrap_or_default();
    if data_file != "LOCAL" {
        return Err(VolumeError::metaimage(format!(
            "detached voxel data ('{data_file}') is not supported"
        )));
    }

    let ndims: usize = header
        .get("NDims")
        .ok_or_else(|| VolumeError::metaimage("missing NDims"))?
        .parse()
        .map_err(|_| VolumeError::metaimage("NDims is not an integer"))?;
    if !(2..=3).contains(&ndims) {
        return Err(VolumeError::metaimage(format!(
            "only 2D and 3D images are supported (NDims = {ndims})"
        )));
    }

    if let Some(channels) = header.get("ElementNumberOfChannels") {
        if channels != "1" {
            return Err(VolumeError::metaimage(format!(
                "multi-channel images are not supported (ElementNumberOfChannels = {channels})"
            )));
        }
    }

    let dims = parse_list::<usize>(&header, "DimSize", ndims)?
        .ok_or_else(|| VolumeError::metaimage("missing DimSize"))?;
    // DimSize lists the fastest axis first: x (column), y (row), z (slice).
    let shape = if ndims == 3 {
        [dims[2], dims[1], dims[0]]
    } else {
        [1, dims[1], dims[0]]
    };

    let element_name = header
        .get("ElementType")
        .ok_or_else(|| VolumeError::metaimage("missing ElementType"))?;
    let element_type = ElementType::from_met_name(element_name)
        .ok_or_else(|| VolumeError::UnsupportedElementType(element_name.clone()))?;

    let spacing = match parse_list::<f64>(&header, "ElementSpacing", ndims)? {
        Some(values) => values,
        None => parse_list::<f64>(&header, "ElementSize", ndims)?.unwrap_or(vec![1.0; ndims]),
    };
    let origin = match parse_list::<f64>(&header, "Offset", ndims)? {
        Some(values) => values,
        None => parse_list::<f64>(&header, "Origin", ndims)?.unwrap_or(vec![0.0; ndims]),
    };
    let direction = parse_list::<f64>(&header, "TransformMatrix", ndims * ndims)?;

    let big_endian = flag(&header, "BinaryDataByteOrderMSB") || flag(&header, "ElementByteOrderMSB");

    let raw = &bytes[data_start..];
    let inflated;
    let payload = if flag(&header, "CompressedData") {
        let mut decoder = ZlibDecoder::new(raw);
        let mut buf = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .map_err(|err| VolumeError::Compression {
                message: err.to_string(),
            })?;
        inflated = buf;
        inflated.as_slice()
    } else {
        raw
    };

    let expected = voxel_count(shape)
        .and_then(|voxels| voxels.checked_mul(element_type.size()))
        .ok_or_else(|| VolumeError::metaimage("DimSize overflows"))?;
    if payload.len() < expected {
        return Err(VolumeError::Truncated {
            expected,
            actual: payload.len(),
        });
    }

    let data = element_type.decode(&payload[..expected], big_endian);
    let volume = Volume::new(shape, element_type, data)?;

    Ok(volume.with_geometry(
        to_xyz(&spacing, 1.0),
        to_xyz(&origin, 0.0),
        to_direction(direction.as_deref(), ndims),
    ))
}

/// Render a volume as an uncompressed little-endian `.mha` file.
pub fn encode(volume: &Volume) -> Vec<u8> {
    let [slices, rows, columns] = volume.shape();
    let mut header = String::new();

    // Writing into a String cannot fail.
    let _ = writeln!(header, "ObjectType = Image");
    let _ = writeln!(header, "NDims = 3");
    let _ = writeln!(header, "BinaryData = True");
    let _ = writeln!(header, "BinaryDataByteOrderMSB = False");
    let _ = writeln!(header, "CompressedData = False");
    let _ = writeln!(header, "TransformMatrix = {}", join(&volume.direction()));
    let _ = writeln!(header, "Offset = {}", join(&volume.origin()));
    let _ = writeln!(header, "CenterOfRotation = 0 0 0");
    let _ = writeln!(header, "ElementSpacing = {}", join(&volume.spacing()));
    let _ = writeln!(header, "DimSize = {} {} {}", columns, rows, slices);
    let _ = writeln!(header, "ElementType = {}", volume.element_type().met_name());
    let _ = writeln!(header, "ElementDataFile = LOCAL");

    let mut out = header.into_bytes();
    volume.element_type().encode(volume.data(), &mut out);
    out
}

fn parse_header(bytes: &[u8]) -> Result<(HashMap<String, String>, usize), VolumeError> {
    let mut header = HashMap::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let end = bytes[pos..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| pos + offset)
            .ok_or_else(|| VolumeError::metaimage("header is not terminated by ElementDataFile"))?;

        let line = std::str::from_utf8(&bytes[pos..end])
            .map_err(|_| VolumeError::metaimage("header contains non-UTF-8 text"))?
            .trim_end_matches('\r');
        pos = end + 1;

        if line.trim().is_empty() {
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| VolumeError::metaimage(format!("line '{line}' is not 'Key = Value'")))?;
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        let last = key == "ElementDataFile";
        header.insert(key, value);

        if last {
            return Ok((header, pos));
        }
    }

    Err(VolumeError::metaimage(
        "header is not terminated by ElementDataFile",
    ))
}

fn parse_list<T: std::str::FromStr>(
    header: &HashMap<String, String>,
    key: &str,
    expected: usize,
) -> Result<Option<Vec<T>>, VolumeError> {
    let Some(raw) = header.get(key) else {
        return Ok(None);
    };

    let values = raw
        .split_whitespace()
        .map(|part| part.parse::<T>())
        .collect::<Result<Vec<T>, _>>()
        .map_err(|_| VolumeError::metaimage(format!("{key} has a non-numeric entry: '{raw}'")))?;

    if values.len() != expected {
        return Err(VolumeError::metaimage(format!(
            "{key} expects {expected} values, found {}",
            values.len()
        )));
    }

    Ok(Some(values))
}

fn flag(header: &HashMap<String, String>, key: &str) -> bool {
    header
        .get(key)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn to_xyz(values: &[f64], fill: f64) -> [f64; 3] {
    [
        values.first().copied().unwrap_or(fill),
        values.get(1).copied().unwrap_or(fill),
        values.get(2).copied().unwrap_or(fill),
    ]
}

fn to_direction(values: Option<&[f64]>, ndims: usize) -> [f64; 9] {
    match (values, ndims) {
        (Some(m), 3) => [m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7], m[8]],
        (Some(m), 2) => [m[0], m[1], 0.0, m[2], m[3], 0.0, 0.0, 0.0, 1.0],
        _ => [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
    }
}

fn join(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn header(extra: &str, element: &str, dims: &str) -> Vec<u8> {
        format!(
            "ObjectType = Image\nNDims = 3\n{extra}DimSize = {dims}\nElementType = {element}\nElementDataFile = LOCAL\n"
        )
        .into_bytes()
    }

    #[test]
    fn decodes_uncompressed_little_endian() {
        let mut bytes = header("", "MET_USHORT", "2 1 1");
        bytes.extend_from_slice(&[1, 0, 2, 0]);
        let volume = decode(&bytes).unwrap();
        assert_eq!(volume.shape(), [1, 1, 2]);
        assert_eq!(volume.data(), &[1.0, 2.0]);
    }

    #[test]
    fn decodes_big_endian_flag() {
        let mut bytes = header("BinaryDataByteOrderMSB = True\n", "MET_SHORT", "1 1 1");
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        let volume = decode(&bytes).unwrap();
        assert_eq!(volume.data(), &[-2.0]);
    }

    #[test]
    fn decodes_zlib_compressed_payload() {
        let mut bytes = header("CompressedData = True\n", "MET_FLOAT", "2 2 1");
        let mut raw = Vec::new();
        for v in [0.25f32, 0.5, 0.75, 1.0] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        bytes.extend_from_slice(&encoder.finish().unwrap());

        let volume = decode(&bytes).unwrap();
        assert_eq!(volume.shape(), [1, 2, 2]);
        assert_eq!(volume.data(), &[0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn two_dimensional_images_become_a_single_slice() {
        let mut bytes = b"NDims = 2\nDimSize = 3 2\nElementType = MET_UCHAR\nElementDataFile = LOCAL\n".to_vec();
        bytes.extend_from_slice(&[0, 1, 2, 3, 4, 5]);
        let volume = decode(&bytes).unwrap();
        assert_eq!(volume.shape(), [1, 2, 3]);
        assert_eq!(volume.voxel(0, 1, 2), Some(5.0));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = header("", "MET_FLOAT", "2 2 2");
        bytes.extend_from_slice(&[0; 8]);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            VolumeError::Truncated {
                expected: 32,
                actual: 8
            }
        ));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn overflowing_dim_size_is_rejected() {
        for dims in ["4294967296 4294967296 2", "4294967296 1073741824 2"] {
            let mut bytes = header("", "MET_FLOAT", dims);
            bytes.extend_from_slice(&[0; 8]);
            let err = decode(&bytes).unwrap_err();
            assert!(matches!(err, VolumeError::MalformedHeader { .. }), "{dims}: {err}");
            assert!(err.to_string().contains("DimSize overflows"));
        }
    }

    #[test]
    fn detached_data_file_is_rejected() {
        let bytes = b"NDims = 3\nDimSize = 1 1 1\nElementType = MET_UCHAR\nElementDataFile = image.raw\n";
        let err = decode(bytes).unwrap_err();
        assert!(err.to_string().contains("detached"));
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let err = decode(b"NDims = 3\nDimSize = 1 1 1\n").unwrap_err();
        assert!(matches!(err, VolumeError::MalformedHeader { .. }));
    }

    #[test]
    fn encode_preserves_geometry_and_voxels() {
        let volume = Volume::new([2, 1, 2], ElementType::F64, vec![0.1, 0.2, 0.3, 0.4])
            .unwrap()
            .with_geometry(
                [0.5, 0.5, 3.0],
                [-10.0, 4.25, 7.0],
                [1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0],
            );
        let decoded = decode(&encode(&volume)).unwrap();
        assert!(decoded.same_voxels(&volume));
        assert_eq!(decoded.spacing(), volume.spacing());
        assert_eq!(decoded.origin(), volume.origin());
        assert_eq!(decoded.direction(), volume.direction());
        assert_eq!(decoded.element_type(), ElementType::F64);
    }
}
