//! Schema and slot-layout compilation
//!
//! A [`Schema`] is an ordered list of named fields. Compiling it yields a
//! [`Layout`]: fixed offsets for every field's data and status byte inside a
//! slot, the padded slot size, and a stable 64-bit hash identifying the
//! layout for attach-time compatibility checks. Offsets depend only on the
//! declaration order and the fixed alignment rules, so two processes
//! compiling the same schema produce byte-identical layouts.
//!
//! Slot geometry:
//!
//! ```text
//! 0..7    seq       u64 (atomic, even = stable, odd = publishing)
//! 8..15   write_id  u64 (atomic, global publication counter)
//! 16..    status    one byte per field, block padded to 8
//! next    data      per-field, each at its natural alignment
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShmError};

use super::types::FieldKind;

/// Byte size of the per-slot header (`seq` + `write_id`)
pub const SLOT_HEADER_SIZE: usize = 16;

/// Offset of the status block inside a slot
pub const SLOT_STATUS_OFFSET: usize = SLOT_HEADER_SIZE;

/// One named field of a record schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// An ordered, duplicate-checked record schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    /// Build a schema from `(name, type_token)` pairs
    ///
    /// The token grammar is described in [`FieldKind::parse`]. An empty
    /// field list is a valid (if useless) schema.
    pub fn parse(fields: &[(&str, &str)]) -> Result<Self> {
        let mut specs = Vec::with_capacity(fields.len());
        for (name, token) in fields {
            specs.push(FieldSpec {
                name: name.to_string(),
                kind: FieldKind::parse(token)?,
            });
        }
        Self::new(specs)
    }

    /// Build a schema from already-parsed field specs
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        for spec in &fields {
            if spec.name.is_empty() {
                return Err(ShmError::schema("field name cannot be empty"));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ShmError::schema(format!(
                    "duplicate field '{}'",
                    spec.name
                )));
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Compiled placement of one field inside a slot
#[derive(Debug, Clone)]
pub struct FieldLayout {
    pub name: String,
    pub kind: FieldKind,
    /// Offset of the field's data from the slot start
    pub data_offset: usize,
    /// Fixed byte capacity of the data area
    pub data_capacity: usize,
    /// Offset of the field's status byte from the slot start
    pub status_offset: usize,
}

/// Compiled layout of a whole slot
#[derive(Debug, Clone)]
pub struct Layout {
    fields: Vec<FieldLayout>,
    slot_size: usize,
    schema_hash: u64,
}

impl Layout {
    /// Compile a schema into fixed offsets
    pub fn compile(schema: &Schema) -> Result<Self> {
        let field_count = schema.len();

        // Status block directly after the slot header, padded so data
        // starts 8-byte aligned
        let mut cursor = align_up(SLOT_STATUS_OFFSET + field_count, 8)
            .ok_or_else(|| ShmError::schema("slot layout overflows"))?;

        let mut fields = Vec::with_capacity(field_count);
        for (index, spec) in schema.fields().iter().enumerate() {
            let align = spec.kind.alignment();
            let data_offset = align_up(cursor, align)
                .ok_or_else(|| ShmError::schema("slot layout overflows"))?;
            let data_capacity = spec.kind.byte_capacity();
            cursor = data_offset
                .checked_add(data_capacity)
                .ok_or_else(|| ShmError::schema("slot layout overflows"))?;

            fields.push(FieldLayout {
                name: spec.name.clone(),
                kind: spec.kind.clone(),
                data_offset,
                data_capacity,
                status_offset: SLOT_STATUS_OFFSET + index,
            });
        }

        let slot_size = align_up(cursor, 8)
            .ok_or_else(|| ShmError::schema("slot layout overflows"))?;

        Ok(Self {
            schema_hash: schema_hash(schema),
            fields,
            slot_size,
        })
    }

    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Find a field by name, returning its index and layout
    pub fn field(&self, name: &str) -> Option<(usize, &FieldLayout)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    /// Total slot size including header, status block and padding
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Stable 64-bit digest of the schema
    pub fn schema_hash(&self) -> u64 {
        self.schema_hash
    }
}

/// Stable FNV-1a 64 digest over `(name, canonical token)` in order
///
/// Must not change between releases that share a format version; attach
/// compatibility depends on it.
fn schema_hash(schema: &Schema) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    let mut eat = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };

    for spec in schema.fields() {
        eat(spec.name.as_bytes());
        eat(&[0]);
        eat(spec.kind.canonical().as_bytes());
        eat(&[0]);
    }
    hash
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}
