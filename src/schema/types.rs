//! Field type descriptors and type-token parsing
//!
//! A field's type is declared as a compact token with one of three shapes:
//! a bare scalar tag (`f64`, `i32`, `bool8`), a character-bounded string
//! (`str[64]`), or an n-dimensional numeric array (`u8[480,640,3]`). The
//! descriptor derived from a token fixes the on-wire size, the natural
//! alignment, and the canonical form that feeds the schema hash.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShmError};

/// Scalar field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    /// 64-bit IEEE 754 float
    F64,
    /// 32-bit signed integer
    I32,
    /// Boolean stored as one byte (0 or 1)
    Bool8,
}

impl ScalarType {
    /// Fixed width in bytes
    pub fn width(self) -> usize {
        match self {
            ScalarType::F64 => 8,
            ScalarType::I32 => 4,
            ScalarType::Bool8 => 1,
        }
    }

    /// Canonical token tag
    pub fn tag(self) -> &'static str {
        match self {
            ScalarType::F64 => "f64",
            ScalarType::I32 => "i32",
            ScalarType::Bool8 => "bool8",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "f64" => Some(ScalarType::F64),
            "i32" => Some(ScalarType::I32),
            "bool8" => Some(ScalarType::Bool8),
            _ => None,
        }
    }
}

/// Element types for array fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool8,
}

impl Dtype {
    /// Element size in bytes
    pub fn size(self) -> usize {
        match self {
            Dtype::I8 | Dtype::U8 | Dtype::Bool8 => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::F32 | Dtype::I32 | Dtype::U32 => 4,
            Dtype::F64 | Dtype::I64 | Dtype::U64 => 8,
        }
    }

    /// Canonical token tag
    pub fn tag(self) -> &'static str {
        match self {
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
            Dtype::I8 => "i8",
            Dtype::I16 => "i16",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
            Dtype::U8 => "u8",
            Dtype::U16 => "u16",
            Dtype::U32 => "u32",
            Dtype::U64 => "u64",
            Dtype::Bool8 => "bool8",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "f32" => Some(Dtype::F32),
            "f64" => Some(Dtype::F64),
            "i8" => Some(Dtype::I8),
            "i16" => Some(Dtype::I16),
            "i32" => Some(Dtype::I32),
            "i64" => Some(Dtype::I64),
            "u8" => Some(Dtype::U8),
            "u16" => Some(Dtype::U16),
            "u32" => Some(Dtype::U32),
            "u64" => Some(Dtype::U64),
            "bool8" => Some(Dtype::Bool8),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// The kind of a record field, with kind-specific parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// Fixed-width scalar
    Scalar(ScalarType),
    /// UTF-8 string bounded by character count
    String {
        /// Maximum number of Unicode scalar values
        max_chars: usize,
    },
    /// N-dimensional numeric array, row-major
    Array {
        dtype: Dtype,
        /// Declared shape; dimensions may be zero
        shape: Vec<usize>,
    },
}

impl FieldKind {
    /// Parse a type token (`f64`, `str[64]`, `u8[2,2]`, ...)
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ShmError::schema("empty type token"));
        }

        match token.find('[') {
            None => ScalarType::from_tag(token)
                .map(FieldKind::Scalar)
                .ok_or_else(|| ShmError::schema(format!("unknown type tag '{}'", token))),
            Some(open) => {
                if !token.ends_with(']') {
                    return Err(ShmError::schema(format!(
                        "malformed brackets in type token '{}'",
                        token
                    )));
                }
                let tag = &token[..open];
                let dims = &token[open + 1..token.len() - 1];
                if dims.contains('[') || dims.contains(']') {
                    return Err(ShmError::schema(format!(
                        "malformed brackets in type token '{}'",
                        token
                    )));
                }

                if tag == "str" {
                    let max_chars = parse_dim(dims, token)?;
                    Ok(FieldKind::String { max_chars })
                } else {
                    let dtype = Dtype::from_tag(tag).ok_or_else(|| {
                        ShmError::schema(format!("unknown dtype '{}' in token '{}'", tag, token))
                    })?;
                    let shape = dims
                        .split(',')
                        .map(|d| parse_dim(d, token))
                        .collect::<Result<Vec<_>>>()?;
                    if shape.is_empty() {
                        return Err(ShmError::schema(format!(
                            "array token '{}' has an empty shape",
                            token
                        )));
                    }
                    // Reject capacities that cannot be laid out
                    element_count(&shape)
                        .and_then(|n| n.checked_mul(dtype.size()))
                        .ok_or_else(|| {
                            ShmError::schema(format!("array token '{}' overflows capacity", token))
                        })?;
                    Ok(FieldKind::Array { dtype, shape })
                }
            }
        }
    }

    /// Size of one element: scalar width, 1 for string characters' length
    /// prefix granularity, or the array element size
    pub fn element_size(&self) -> usize {
        match self {
            FieldKind::Scalar(s) => s.width(),
            FieldKind::String { .. } => 1,
            FieldKind::Array { dtype, .. } => dtype.size(),
        }
    }

    /// Total on-wire data capacity in bytes
    pub fn byte_capacity(&self) -> usize {
        match self {
            FieldKind::Scalar(s) => s.width(),
            // u32 length prefix plus worst-case four bytes per character
            FieldKind::String { max_chars } => 4 + 4 * max_chars,
            FieldKind::Array { dtype, shape } => {
                element_count(shape).unwrap_or(0) * dtype.size()
            }
        }
    }

    /// Natural alignment of the field's data
    pub fn alignment(&self) -> usize {
        match self {
            FieldKind::Scalar(s) => s.width(),
            // aligned for the u32 length prefix
            FieldKind::String { .. } => 4,
            FieldKind::Array { dtype, .. } => dtype.size(),
        }
    }

    /// Canonical token form, used for hashing and diagnostics
    pub fn canonical(&self) -> String {
        match self {
            FieldKind::Scalar(s) => s.tag().to_string(),
            FieldKind::String { max_chars } => format!("str[{}]", max_chars),
            FieldKind::Array { dtype, shape } => {
                let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
                format!("{}[{}]", dtype.tag(), dims.join(","))
            }
        }
    }

    /// Short kind name for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldKind::Scalar(_) => "scalar",
            FieldKind::String { .. } => "string",
            FieldKind::Array { .. } => "array",
        }
    }
}

/// Number of elements in a shape, `None` on overflow
pub(crate) fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

fn parse_dim(text: &str, token: &str) -> Result<usize> {
    let text = text.trim();
    if text.starts_with('-') {
        return Err(ShmError::schema(format!(
            "negative dimension '{}' in token '{}'",
            text, token
        )));
    }
    text.parse::<usize>().map_err(|_| {
        ShmError::schema(format!(
            "non-integer dimension '{}' in token '{}'",
            text, token
        ))
    })
}
