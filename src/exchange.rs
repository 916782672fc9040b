//! Public exchange surface
//!
//! An [`Exchange`] binds a compiled schema to a named region and exposes
//! the producer and consumer operations: stage field writes, finalize a
//! publication, and read consistent snapshots with per-field status. One
//! process creates the region; any number attach to it. A single producer
//! is assumed per region; readers are free to come and go.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, ShmError};
use crate::region::{required_region_size, Region, RegionProvider, ShmProvider};
use crate::ring::{self, Staging};
use crate::schema::{Layout, Schema};
use crate::value::{FieldStatus, Value};
use crate::{codec, slot};

/// Options for [`Exchange::read`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    timeout: Duration,
    latest: bool,
    reset_modified: bool,
}

impl ReadOptions {
    /// Maximum wall-clock wait for an unseen publication; zero polls
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Skip directly to the most recent publication (FIFO readers drop
    /// the backlog)
    pub fn latest(mut self, latest: bool) -> Self {
        self.latest = latest;
        self
    }

    /// Clear all modified flags after a successful snapshot; single-slot
    /// mode only, single-consumer privilege
    pub fn reset_modified(mut self, reset: bool) -> Self {
        self.reset_modified = reset;
        self
    }
}

/// One field of a snapshot: the decoded value and its status byte
#[derive(Debug, Clone, Copy)]
pub struct FieldView<'a> {
    name: &'a str,
    value: &'a Value,
    status: FieldStatus,
}

impl<'a> FieldView<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn value(&self) -> &'a Value {
        self.value
    }

    pub fn status(&self) -> FieldStatus {
        self.status
    }

    /// Exact copy of the source value
    pub fn valid(&self) -> bool {
        self.status.is_valid()
    }

    /// Written by the publication this snapshot observed
    pub fn modified(&self) -> bool {
        self.status.is_modified()
    }

    /// Stored content is an untrustworthy prefix
    pub fn truncated(&self) -> bool {
        self.status.is_truncated()
    }

    /// Never written
    pub fn unwritten(&self) -> bool {
        self.status.is_unwritten()
    }
}

/// A consistent private copy of one publication
#[derive(Debug, Clone)]
pub struct Snapshot {
    layout: Arc<Layout>,
    values: Vec<Value>,
    statuses: Vec<FieldStatus>,
    write_id: u64,
}

impl Snapshot {
    fn decode(layout: &Arc<Layout>, buf: &[u8]) -> Self {
        let values = layout
            .fields()
            .iter()
            .map(|f| codec::decode_field(f, buf))
            .collect();
        let statuses = layout
            .fields()
            .iter()
            .map(|f| FieldStatus::from_bits(buf[f.status_offset]))
            .collect();
        Self {
            layout: Arc::clone(layout),
            values,
            statuses,
            write_id: slot::snapshot_write_id(buf),
        }
    }

    /// Global id of the publication this snapshot captured
    pub fn write_id(&self) -> u64 {
        self.write_id
    }

    /// Look up one field by name
    pub fn field(&self, name: &str) -> Option<FieldView<'_>> {
        self.layout.field(name).map(|(index, f)| FieldView {
            name: f.name.as_str(),
            value: &self.values[index],
            status: self.statuses[index],
        })
    }

    /// All fields in declaration order
    pub fn fields(&self) -> impl Iterator<Item = FieldView<'_>> {
        self.layout
            .fields()
            .iter()
            .enumerate()
            .map(|(index, f)| FieldView {
                name: f.name.as_str(),
                value: &self.values[index],
                status: self.statuses[index],
            })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Lock-free shared-memory exchange over a schema-compiled region
pub struct Exchange {
    schema: Schema,
    layout: Arc<Layout>,
    provider: Arc<dyn RegionProvider>,
    name: String,
    slots: u32,
    region: Option<Region>,
    staging: Staging,
    cursor: u64,
    snapshot_buf: Vec<u8>,
    is_creator: bool,
    unlinked: bool,
}

impl Exchange {
    /// Create a new region with the default POSIX shm provider
    pub fn create(schema: Schema, name: &str, slots: u32) -> Result<Self> {
        Self::create_with(Arc::new(ShmProvider), schema, name, slots)
    }

    /// Attach to an existing region with the default POSIX shm provider
    pub fn open(schema: Schema, name: &str, slots: u32) -> Result<Self> {
        Self::open_with(Arc::new(ShmProvider), schema, name, slots)
    }

    /// Create a region with a generated unique name
    ///
    /// The name is available via [`Exchange::name`] and can be handed to
    /// other processes.
    pub fn create_anonymous(schema: Schema, slots: u32) -> Result<Self> {
        Self::create_anonymous_with(Arc::new(ShmProvider), schema, slots)
    }

    /// [`Exchange::create_anonymous`] with an injected provider
    pub fn create_anonymous_with(
        provider: Arc<dyn RegionProvider>,
        schema: Schema,
        slots: u32,
    ) -> Result<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "flexshm-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self::create_with(provider, schema, &name, slots)
    }

    /// Create a new region via an injected provider
    pub fn create_with(
        provider: Arc<dyn RegionProvider>,
        schema: Schema,
        name: &str,
        slots: u32,
    ) -> Result<Self> {
        let layout = Self::compile(&schema, slots)?;
        let size = required_region_size(layout.slot_size(), slots);
        let map = provider.create(name, size)?;
        let region = Region::create(map, &layout, slots)?;
        region.producer_alive().store(1, Ordering::Release);
        info!(name, slots, size, "exchange region created");
        Ok(Self::assemble(schema, layout, provider, name, slots, region, true))
    }

    /// Attach to an existing region via an injected provider
    ///
    /// The local schema and slot count must agree with the region header;
    /// every disagreement is reported as a distinct mismatch.
    pub fn open_with(
        provider: Arc<dyn RegionProvider>,
        schema: Schema,
        name: &str,
        slots: u32,
    ) -> Result<Self> {
        let layout = Self::compile(&schema, slots)?;
        let map = provider.open(name)?;
        let region = Region::attach(map, &layout, slots)?;
        info!(name, slots, "exchange region attached");
        Ok(Self::assemble(schema, layout, provider, name, slots, region, false))
    }

    fn compile(schema: &Schema, slots: u32) -> Result<Arc<Layout>> {
        if slots == 0 {
            return Err(ShmError::schema("slot count must be >= 1"));
        }
        Ok(Arc::new(Layout::compile(schema)?))
    }

    fn assemble(
        schema: Schema,
        layout: Arc<Layout>,
        provider: Arc<dyn RegionProvider>,
        name: &str,
        slots: u32,
        region: Region,
        is_creator: bool,
    ) -> Self {
        let slot_size = layout.slot_size();
        Self {
            schema,
            layout,
            provider,
            name: name.to_string(),
            slots,
            region: Some(region),
            staging: Staging::new(slot_size),
            cursor: 0,
            snapshot_buf: vec![0u8; slot_size],
            is_creator,
            unlinked: false,
        }
    }

    /// Region name, as given or generated
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots in the ring
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// True when the exchange buffers publications (more than one slot)
    pub fn is_fifo(&self) -> bool {
        self.slots > 1
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn region(&self) -> Result<&Region> {
        self.region.as_ref().ok_or(ShmError::Closed)
    }

    /// Stage field values for the next publication
    ///
    /// In single-slot mode the publication is finalized immediately; in
    /// ring mode values accumulate until [`Exchange::finalize`]. Unknown
    /// field names, kind mismatches and malformed arrays fail here and
    /// leave shared memory untouched. Oversize values are not errors:
    /// they store a truncated prefix and flag the field `TRUNCATED`.
    pub fn write(&mut self, fields: &[(&str, Value)]) -> Result<()> {
        let region = self.region.as_ref().ok_or(ShmError::Closed)?;

        if fields.is_empty() {
            self.staging.touch(region, &self.layout);
        }
        for (name, value) in fields {
            let (index, _) = self
                .layout
                .field(name)
                .ok_or_else(|| ShmError::unknown_field(*name))?;
            self.staging.stage(region, &self.layout, index, value)?;
        }

        if self.slots == 1 {
            self.staging.publish(region, &self.layout)?;
        }
        Ok(())
    }

    /// Publish everything staged since the last finalize
    ///
    /// Ring mode only; single-slot exchanges publish on every write and
    /// reject this call. Publishing with nothing staged is a no-op.
    pub fn finalize(&mut self) -> Result<()> {
        let region = self.region.as_ref().ok_or(ShmError::Closed)?;
        if self.slots == 1 {
            return Err(ShmError::mode(
                "finalize() requires FIFO mode (slots > 1); single-slot writes publish immediately",
            ));
        }
        self.staging.publish(region, &self.layout)?;
        Ok(())
    }

    /// Read the next unseen publication as a consistent snapshot
    ///
    /// Blocks up to the configured timeout. FIFO readers receive
    /// publications in producer order and resume at the oldest surviving
    /// one after being lapped; `latest` skips the backlog. Returns
    /// [`ShmError::Timeout`] when nothing unseen arrives in time and
    /// [`ShmError::TornRead`] when the retry budget is exhausted at the
    /// deadline; both are retryable.
    pub fn read(&mut self, options: ReadOptions) -> Result<Snapshot> {
        let region = self.region.as_ref().ok_or(ShmError::Closed)?;
        if options.reset_modified && self.slots > 1 {
            return Err(ShmError::mode(
                "reset_modified requires single-slot mode (slots = 1)",
            ));
        }

        ring::acquire_snapshot(
            region,
            &mut self.cursor,
            options.latest,
            options.timeout,
            &mut self.snapshot_buf,
        )?;

        if options.reset_modified {
            region.slot(0).clear_modified(self.layout.field_count());
        }
        if !options.latest {
            region.read_hint().store(self.cursor, Ordering::Relaxed);
        }

        Ok(Snapshot::decode(&self.layout, &self.snapshot_buf))
    }

    /// Unseen publications for this reader, saturating at the slot count
    pub fn pending(&self) -> Result<u64> {
        Ok(ring::pending(self.region()?, self.cursor))
    }

    /// Detach from the region; idempotent
    ///
    /// Later operations fail with [`ShmError::Closed`]. The region itself
    /// survives until unlinked.
    pub fn close(&mut self) {
        if let Some(region) = self.region.take() {
            if self.is_creator {
                region.producer_alive().store(0, Ordering::Release);
            }
            debug!(name = %self.name, "exchange closed");
        }
    }

    /// Remove the region name from the system
    ///
    /// Idempotent after the first success; repeat calls are benign.
    pub fn unlink(&mut self) -> Result<()> {
        if self.unlinked {
            debug!(name = %self.name, "region already unlinked");
            return Ok(());
        }
        self.provider.unlink(&self.name)?;
        self.unlinked = true;
        info!(name = %self.name, "exchange region unlinked");
        Ok(())
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("name", &self.name)
            .field("slots", &self.slots)
            .field("fields", &self.layout.field_count())
            .field("closed", &self.region.is_none())
            .finish()
    }
}
