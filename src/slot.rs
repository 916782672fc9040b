//! Per-slot publication and snapshot protocol
//!
//! Every slot starts with an atomic `seq` word: even while the slot is
//! stable, odd while a publication is in flight. The producer bumps `seq`
//! to odd, mutates the slot body, then bumps it back to even with release
//! ordering. Readers copy the whole slot and accept the copy only when
//! `seq` was even and unchanged across the copy; otherwise they retry up
//! to a bounded attempt budget. The protocol tolerates any number of
//! concurrent readers and exactly one writer per slot.

use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};

use crate::error::{Result, ShmError};
use crate::schema::{SLOT_HEADER_SIZE, SLOT_STATUS_OFFSET};
use crate::value::STATUS_UNWRITTEN;

/// Snapshot retry budget before a read reports a torn slot
pub const TORN_RETRY_LIMIT: u32 = 256;

const SEQ_OFFSET: usize = 0;
const WRITE_ID_OFFSET: usize = 8;

/// A view of one slot inside the mapped region
///
/// Copyable handle over raw memory; all synchronization is carried by the
/// slot's own atomics.
#[derive(Clone, Copy)]
pub(crate) struct SlotRef {
    base: *mut u8,
    size: usize,
}

impl SlotRef {
    /// # Safety
    ///
    /// `base` must point at a slot of `size` bytes, 8-byte aligned, valid
    /// for the lifetime of the mapping, and shared only under this
    /// module's protocol.
    pub(crate) unsafe fn new(base: *mut u8, size: usize) -> Self {
        debug_assert!(size >= SLOT_HEADER_SIZE);
        debug_assert_eq!(base as usize % 8, 0);
        Self { base, size }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    fn seq(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(SEQ_OFFSET) as *const AtomicU64) }
    }

    fn write_id(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(WRITE_ID_OFFSET) as *const AtomicU64) }
    }

    fn status(&self, index: usize) -> &AtomicU8 {
        unsafe { &*(self.base.add(SLOT_STATUS_OFFSET + index) as *const AtomicU8) }
    }

    /// Slot body (status block + data) as a mutable slice
    ///
    /// # Safety
    ///
    /// Producer-only, and only between `begin_publish` and
    /// `commit_publish` (or during region initialization).
    pub(crate) unsafe fn body_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            self.base.add(SLOT_HEADER_SIZE),
            self.size - SLOT_HEADER_SIZE,
        )
    }

    /// Slot body of a slot no publication is currently touching
    ///
    /// # Safety
    ///
    /// Producer-only; the slot must be stable (even `seq`) and only the
    /// producer may be publishing anywhere in the region.
    pub(crate) unsafe fn body(&self) -> &[u8] {
        std::slice::from_raw_parts(
            self.base.add(SLOT_HEADER_SIZE),
            self.size - SLOT_HEADER_SIZE,
        )
    }

    /// Mark all fields unwritten; used once at region creation
    pub(crate) fn initialize(&self, field_count: usize) {
        self.seq().store(0, Ordering::Relaxed);
        self.write_id().store(0, Ordering::Relaxed);
        for i in 0..field_count {
            self.status(i).store(STATUS_UNWRITTEN, Ordering::Relaxed);
        }
    }

    /// Enter the publishing state: `seq` becomes odd
    ///
    /// Returns the odd sequence value. Body writes must follow this call.
    pub(crate) fn begin_publish(&self) -> u64 {
        let prev = self.seq().load(Ordering::Relaxed);
        debug_assert_eq!(prev % 2, 0, "publish while already publishing");
        let odd = prev + 1;
        self.seq().store(odd, Ordering::Relaxed);
        fence(Ordering::Release);
        odd
    }

    /// Publish: record the global write id and make `seq` even again
    pub(crate) fn commit_publish(&self, odd_seq: u64, write_id: u64) {
        self.write_id().store(write_id, Ordering::Relaxed);
        self.seq().store(odd_seq + 1, Ordering::Release);
    }

    /// Copy the entire slot into `buf` under the seq protocol
    ///
    /// Retries up to [`TORN_RETRY_LIMIT`] times while a publication is in
    /// flight, then reports `TornRead`.
    pub(crate) fn snapshot_into(&self, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.size);

        for _ in 0..TORN_RETRY_LIMIT {
            let seq0 = self.seq().load(Ordering::Acquire);
            if seq0 % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }

            unsafe {
                std::ptr::copy_nonoverlapping(self.base as *const u8, buf.as_mut_ptr(), self.size);
            }

            fence(Ordering::Acquire);
            let seq1 = self.seq().load(Ordering::Relaxed);
            if seq1 == seq0 {
                return Ok(());
            }
            std::hint::spin_loop();
        }

        Err(ShmError::TornRead {
            attempts: TORN_RETRY_LIMIT,
        })
    }

    /// Clear the modified bit of every field in place
    ///
    /// Single-consumer privilege in single-slot mode; races with nothing
    /// but the producer, which replaces whole status bytes.
    pub(crate) fn clear_modified(&self, field_count: usize) {
        use crate::value::STATUS_MODIFIED;
        for i in 0..field_count {
            self.status(i).fetch_and(!STATUS_MODIFIED, Ordering::AcqRel);
        }
    }
}

/// Sequence number stored in a snapshot buffer
pub(crate) fn snapshot_seq(buf: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[SEQ_OFFSET..SEQ_OFFSET + 8]);
    u64::from_ne_bytes(raw)
}

/// Write id stored in a snapshot buffer
pub(crate) fn snapshot_write_id(buf: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[WRITE_ID_OFFSET..WRITE_ID_OFFSET + 8]);
    u64::from_ne_bytes(raw)
}
