//! Field codec: move values in and out of slot buffers
//!
//! Encoding writes a value's native-endian bytes at the field's compiled
//! offset and reports whether the stored content is exact or a truncated
//! prefix. Truncation is never an error here; the caller folds the outcome
//! into the field's status byte. Decoding always succeeds and trusts only
//! the layout, never the buffer content (a garbage length prefix is
//! clamped, not trusted).

use crate::error::{Result, ShmError};
use crate::schema::{FieldKind, FieldLayout, ScalarType};
use crate::value::{ArrayValue, Value};

/// Result of encoding one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncodeOutcome {
    /// Stored bytes are an exact copy of the source
    Exact,
    /// Source exceeded capacity; a prefix was stored
    Truncated,
}

/// Encode `value` into `slot` at the field's offset
///
/// Fails with `KindMismatch` when the value's kind or array dtype does not
/// match the declaration. Oversize strings and mis-shaped arrays are not
/// errors; they store a prefix and report [`EncodeOutcome::Truncated`].
pub(crate) fn encode_field(
    field: &FieldLayout,
    value: &Value,
    slot: &mut [u8],
) -> Result<EncodeOutcome> {
    match (&field.kind, value) {
        (FieldKind::Scalar(ScalarType::F64), Value::F64(v)) => {
            slot[field.data_offset..field.data_offset + 8].copy_from_slice(&v.to_ne_bytes());
            Ok(EncodeOutcome::Exact)
        }
        (FieldKind::Scalar(ScalarType::I32), Value::I32(v)) => {
            slot[field.data_offset..field.data_offset + 4].copy_from_slice(&v.to_ne_bytes());
            Ok(EncodeOutcome::Exact)
        }
        (FieldKind::Scalar(ScalarType::Bool8), Value::Bool(v)) => {
            slot[field.data_offset] = *v as u8;
            Ok(EncodeOutcome::Exact)
        }
        (FieldKind::String { max_chars }, Value::Str(s)) => {
            Ok(encode_string(field, *max_chars, s, slot))
        }
        (FieldKind::Array { dtype, shape }, Value::Array(a)) => {
            if a.dtype() != *dtype {
                return Err(ShmError::kind_mismatch(
                    &field.name,
                    dtype.tag(),
                    a.dtype().tag(),
                ));
            }
            Ok(encode_array(field, shape, a, slot))
        }
        (kind, value) => Err(ShmError::kind_mismatch(
            &field.name,
            kind.canonical(),
            value.kind_name(),
        )),
    }
}

fn encode_string(field: &FieldLayout, max_chars: usize, s: &str, slot: &mut [u8]) -> EncodeOutcome {
    let byte_budget = 4 * max_chars;

    // Largest prefix within both the character and the byte budget,
    // never splitting a code point
    let mut end = 0;
    let mut chars = 0;
    for (idx, ch) in s.char_indices() {
        let next = idx + ch.len_utf8();
        if chars == max_chars || next > byte_budget {
            break;
        }
        end = next;
        chars += 1;
    }

    let prefix = &s[..end];
    let base = field.data_offset;
    slot[base..base + 4].copy_from_slice(&(prefix.len() as u32).to_ne_bytes());
    slot[base + 4..base + 4 + prefix.len()].copy_from_slice(prefix.as_bytes());

    if end == s.len() {
        EncodeOutcome::Exact
    } else {
        EncodeOutcome::Truncated
    }
}

fn encode_array(
    field: &FieldLayout,
    declared_shape: &[usize],
    a: &ArrayValue,
    slot: &mut [u8],
) -> EncodeOutcome {
    let base = field.data_offset;
    let capacity = field.data_capacity;
    let src = a.bytes();

    // Exact only when the shape matches the declaration; equal byte length
    // with a different shape still reads back under the declared shape
    let exact = a.shape() == declared_shape;

    let copy = src.len().min(capacity);
    slot[base..base + copy].copy_from_slice(&src[..copy]);
    slot[base + copy..base + capacity].fill(0);

    if exact {
        EncodeOutcome::Exact
    } else {
        EncodeOutcome::Truncated
    }
}

/// Decode the field's stored bytes from `slot`
pub(crate) fn decode_field(field: &FieldLayout, slot: &[u8]) -> Value {
    let base = field.data_offset;
    match &field.kind {
        FieldKind::Scalar(ScalarType::F64) => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&slot[base..base + 8]);
            Value::F64(f64::from_ne_bytes(buf))
        }
        FieldKind::Scalar(ScalarType::I32) => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&slot[base..base + 4]);
            Value::I32(i32::from_ne_bytes(buf))
        }
        FieldKind::Scalar(ScalarType::Bool8) => Value::Bool(slot[base] != 0),
        FieldKind::String { max_chars } => {
            let mut len_buf = [0u8; 4];
            len_buf.copy_from_slice(&slot[base..base + 4]);
            // Clamp: an unwritten or corrupt prefix must not read past
            // the field's capacity
            let len = (u32::from_ne_bytes(len_buf) as usize).min(4 * max_chars);
            let payload = &slot[base + 4..base + 4 + len];
            Value::Str(String::from_utf8_lossy(payload).into_owned())
        }
        FieldKind::Array { dtype, shape } => {
            let data = slot[base..base + field.data_capacity].to_vec();
            Value::Array(ArrayValue::from_parts(*dtype, shape.clone(), data))
        }
    }
}
