use serde::{Deserialize, Serialize};

/// Scalar storage type of a volume on disk.
///
/// Voxels are held in memory as `f64`, which represents every variant exactly,
/// so re-encoding into the original element type is lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

macro_rules! decode_as {
    ($bytes:expr, $ty:ty, $big_endian:expr) => {{
        const N: usize = std::mem::size_of::<$ty>();
        $bytes
            .chunks_exact(N)
            .map(|chunk| {
                let mut buf = [0u8; N];
                buf.copy_from_slice(chunk);
                let value = if $big_endian {
                    <$ty>::from_be_bytes(buf)
                } else {
                    <$ty>::from_le_bytes(buf)
                };
                value as f64
            })
            .collect::<Vec<f64>>()
    }};
}

macro_rules! encode_as {
    ($values:expr, $ty:ty, $out:expr) => {{
        for value in $values {
            $out.extend_from_slice(&(*value as $ty).to_le_bytes());
        }
    }};
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    pub fn met_name(self) -> &'static str {
        match self {
            ElementType::U8 => "MET_UCHAR",
            ElementType::I8 => "MET_CHAR",
            ElementType::U16 => "MET_USHORT",
            ElementType::I16 => "MET_SHORT",
            ElementType::U32 => "MET_UINT",
            ElementType::I32 => "MET_INT",
            ElementType::F32 => "MET_FLOAT",
            ElementType::F64 => "MET_DOUBLE",
        }
    }

    pub fn from_met_name(name: &str) -> Option<Self> {
        let element = match name.trim() {
            "MET_UCHAR" => ElementType::U8,
            "MET_CHAR" => ElementType::I8,
            "MET_USHORT" => ElementType::U16,
            "MET_SHORT" => ElementType::I16,
            "MET_UINT" => ElementType::U32,
            "MET_INT" => ElementType::I32,
            "MET_FLOAT" => ElementType::F32,
            "MET_DOUBLE" => ElementType::F64,
            _ => return None,
        };
        Some(element)
    }

    pub fn nifti_code(self) -> i16 {
        match self {
            ElementType::U8 => 2,
            ElementType::I16 => 4,
            ElementType::I32 => 8,
            ElementType::F32 => 16,
            ElementType::F64 => 64,
            ElementType::I8 => 256,
            ElementType::U16 => 512,
            ElementType::U32 => 768,
        }
    }

    pub fn from_nifti_code(code: i16) -> Option<Self> {
        let element = match code {
            2 => ElementType::U8,
            4 => ElementType::I16,
            8 => ElementType::I32,
            16 => ElementType::F32,
            64 => ElementType::F64,
            256 => ElementType::I8,
            512 => ElementType::U16,
            768 => ElementType::U32,
            _ => return None,
        };
        Some(element)
    }

    /// Decode packed voxels. `bytes` must hold a whole number of elements.
    pub(crate) fn decode(self, bytes: &[u8], big_endian: bool) -> Vec<f64> {
        match self {
            ElementType::U8 => decode_as!(bytes, u8, big_endian),
            ElementType::I8 => decode_as!(bytes, i8, big_endian),
            ElementType::U16 => decode_as!(bytes, u16, big_endian),
            ElementType::I16 => decode_as!(bytes, i16, big_endian),
            ElementType::U32 => decode_as!(bytes, u32, big_endian),
            ElementType::I32 => decode_as!(bytes, i32, big_endian),
            ElementType::F32 => decode_as!(bytes, f32, big_endian),
            ElementType::F64 => decode_as!(bytes, f64, big_endian),
        }
    }

    /// Append voxels as little-endian values of this type.
    pub(crate) fn encode(self, values: &[f64], out: &mut Vec<u8>) {
        out.reserve(values.len() * self.size());
        match self {
            ElementType::U8 => encode_as!(values, u8, out),
            ElementType::I8 => encode_as!(values, i8, out),
            ElementType::U16 => encode_as!(values, u16, out),
            ElementType::I16 => encode_as!(values, i16, out),
            ElementType::U32 => encode_as!(values, u32, out),
            ElementType::I32 => encode_as!(values, i32, out),
            ElementType::F32 => encode_as!(values, f32, out),
            ElementType::F64 => encode_as!(values, f64, out),
        }
    }
}
