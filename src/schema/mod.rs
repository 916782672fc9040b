//! Record schemas and the layout compiler
//!
//! The schema side of the exchange: type-token descriptors, the ordered
//! record schema, and the compiler that turns a schema into fixed slot
//! offsets shared by every process attached to a region.

pub mod layout;
pub mod types;

pub use layout::{FieldLayout, FieldSpec, Layout, Schema, SLOT_HEADER_SIZE, SLOT_STATUS_OFFSET};
pub use types::{Dtype, FieldKind, ScalarType};
