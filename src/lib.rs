//! # flexshm - Lock-Free Shared Memory Exchange
//!
//! flexshm is a single-producer / multi-consumer exchange over named
//! shared memory. A declarative record schema is compiled into a fixed,
//! portable slot layout; producers publish whole records, and readers
//! take consistent snapshots without locks, observing per-field status
//! (valid / modified / truncated / unwritten).
//!
//! ## Features
//!
//! - **Schema-compiled layouts**: field offsets, status bytes and slot
//!   sizes derived deterministically from an ordered record schema
//! - **Lock-free publication**: even/odd sequence numbers with bounded
//!   retry-on-tear reads; wait-free producer, lock-free readers
//! - **Two modes**: single-slot latest-wins exchange, or a bounded ring
//!   of slots with FIFO reads and overwrite-oldest on overflow
//! - **Per-field status**: truncation is reported, never raised; readers
//!   decide how to handle partial data
//! - **Pluggable regions**: POSIX shm by default, file-backed and
//!   in-process providers for tests and constrained hosts
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 flexshm region                   │
//! ├──────────────────────────────────────────────────┤
//! │  Header                  │  Slots                │
//! │  - magic / version       │  - seq (even/odd)     │
//! │  - geometry, schema hash │  - write_id           │
//! │  - write_idx (atomic)    │  - status bytes       │
//! └──────────────────────────┴──│ - field data ──────┘
//!           │                   │
//!           ▼                   ▼
//! ┌─────────────────┐    ┌─────────────────────────┐
//! │  one producer   │    │  any number of readers  │
//! │  write/finalize │    │  read -> Snapshot       │
//! └─────────────────┘    └─────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use flexshm::{Exchange, ReadOptions, Schema, Value};
//!
//! # fn main() -> flexshm::Result<()> {
//! let schema = Schema::parse(&[("temperature", "f64"), ("status", "str[16]")])?;
//!
//! // Producer process
//! let mut tx = Exchange::create(schema.clone(), "sensors", 1)?;
//! tx.write(&[("temperature", Value::F64(23.5)), ("status", Value::from("OK"))])?;
//!
//! // Consumer process
//! let mut rx = Exchange::open(schema, "sensors", 1)?;
//! let snap = rx.read(ReadOptions::default().timeout(Duration::from_millis(100)))?;
//! let temp = snap.field("temperature").unwrap();
//! if temp.valid() && temp.modified() {
//!     println!("temperature: {:?}", temp.value());
//! }
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod error;
pub mod exchange;
pub mod region;
pub mod schema;
pub mod value;

mod codec;
mod ring;
mod slot;

// Main API re-exports
pub use error::{Result, ShmError};
pub use exchange::{Exchange, FieldView, ReadOptions, Snapshot};
pub use region::{
    FileProvider, HeapProvider, MappedRegion, RegionProvider, ShmProvider, FORMAT_VERSION,
    REGION_HEADER_SIZE, REGION_MAGIC,
};
pub use schema::{Dtype, FieldKind, FieldSpec, Layout, ScalarType, Schema};
pub use value::{
    ArrayElement, ArrayValue, FieldStatus, Value, STATUS_MODIFIED, STATUS_TRUNCATED,
    STATUS_UNWRITTEN, STATUS_VALID,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    /// Snapshot retry budget before a read reports a torn slot
    pub const TORN_RETRY_LIMIT: u32 = crate::slot::TORN_RETRY_LIMIT;

    /// Sleep interval of the read wait schedule once spinning stops
    pub const POLL_INTERVAL: std::time::Duration = crate::ring::POLL_INTERVAL;
}
