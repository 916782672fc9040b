//! Ring controller: staging, publication, and cursor-driven reads
//!
//! The producer stages whole publications in a private slot image and
//! commits them with the slot protocol, then advances the region's
//! `write_idx`. Readers keep a private cursor of the last publication they
//! consumed and map it onto a slot index; a reader that falls more than
//! `slot_count` publications behind has been lapped and resumes at the
//! oldest surviving publication. Waiting never takes a lock: a bounded
//! spin gives way to yields, then to short sleeps, until the caller's
//! deadline passes.

use std::time::{Duration, Instant};

use crate::codec::{self, EncodeOutcome};
use crate::error::{Result, ShmError};
use crate::region::Region;
use crate::schema::{Layout, SLOT_HEADER_SIZE, SLOT_STATUS_OFFSET};
use crate::slot::snapshot_write_id;
use crate::value::{
    Value, STATUS_MODIFIED, STATUS_TRUNCATED, STATUS_UNWRITTEN, STATUS_VALID,
};

/// Sleep interval once spinning and yielding have not produced data
pub const POLL_INTERVAL: Duration = Duration::from_micros(100);

const SPIN_ROUNDS: u32 = 64;
const YIELD_ROUNDS: u32 = 16;

/// Escalating wait: spin, then yield, then sleep
pub(crate) struct WaitSchedule {
    rounds: u32,
}

impl WaitSchedule {
    pub(crate) fn new() -> Self {
        Self { rounds: 0 }
    }

    pub(crate) fn pause(&mut self) {
        if self.rounds < SPIN_ROUNDS {
            std::hint::spin_loop();
        } else if self.rounds < SPIN_ROUNDS + YIELD_ROUNDS {
            std::thread::yield_now();
        } else {
            std::thread::sleep(POLL_INTERVAL);
        }
        self.rounds = self.rounds.saturating_add(1);
    }
}

/// Producer-side staging for the next publication
///
/// Holds a private image of the slot body. The image starts as a copy of
/// the previously finalized publication with every `MODIFIED` bit cleared
/// (fields never written stay `UNWRITTEN`), so a finalized publication
/// always carries a complete record and per-field change flags relative
/// to the producer's previous publication.
pub(crate) struct Staging {
    image: Vec<u8>,
    fresh: bool,
    dirty: bool,
}

impl Staging {
    pub(crate) fn new(slot_size: usize) -> Self {
        Self {
            image: vec![0u8; slot_size],
            fresh: false,
            dirty: false,
        }
    }

    /// Rebuild the image from the previously finalized publication
    fn ensure_fresh(&mut self, region: &Region, layout: &Layout) {
        if self.fresh {
            return;
        }
        let w = region.write_idx().load(std::sync::atomic::Ordering::Relaxed);
        if w == 0 {
            self.image.fill(0);
            for i in 0..layout.field_count() {
                self.image[SLOT_STATUS_OFFSET + i] = STATUS_UNWRITTEN;
            }
        } else {
            let prev = region.slot((w - 1) % region.slot_count() as u64);
            // The previous slot is stable and producer-owned
            let body = unsafe { prev.body() };
            self.image[SLOT_HEADER_SIZE..].copy_from_slice(body);
            for i in 0..layout.field_count() {
                self.image[SLOT_STATUS_OFFSET + i] &= !STATUS_MODIFIED;
            }
        }
        self.fresh = true;
    }

    /// Encode one field into the staged image and update its status byte
    ///
    /// Argument errors surface here, before any shared memory is touched.
    pub(crate) fn stage(
        &mut self,
        region: &Region,
        layout: &Layout,
        field_index: usize,
        value: &Value,
    ) -> Result<()> {
        self.ensure_fresh(region, layout);
        let field = &layout.fields()[field_index];
        let outcome = codec::encode_field(field, value, &mut self.image)?;
        self.image[field.status_offset] = match outcome {
            EncodeOutcome::Exact => STATUS_VALID | STATUS_MODIFIED,
            EncodeOutcome::Truncated => STATUS_TRUNCATED | STATUS_MODIFIED,
        };
        self.dirty = true;
        Ok(())
    }

    /// Mark the staging dirty without touching any field
    ///
    /// An empty write still produces a publication on finalize, with all
    /// change flags cleared.
    pub(crate) fn touch(&mut self, region: &Region, layout: &Layout) {
        self.ensure_fresh(region, layout);
        self.dirty = true;
    }

    /// Publish the staged image as the next publication
    ///
    /// No-op when nothing was staged. Returns the write id of the
    /// publication now visible.
    pub(crate) fn publish(&mut self, region: &Region, layout: &Layout) -> Result<u64> {
        use std::sync::atomic::Ordering;

        let w = region.write_idx().load(Ordering::Relaxed);
        if !self.dirty {
            return Ok(w);
        }
        self.ensure_fresh(region, layout);

        let slot = region.slot(w % region.slot_count() as u64);
        let odd = slot.begin_publish();
        unsafe {
            slot.body_mut().copy_from_slice(&self.image[SLOT_HEADER_SIZE..]);
        }
        slot.commit_publish(odd, w + 1);
        region.write_idx().store(w + 1, Ordering::Release);

        self.fresh = false;
        self.dirty = false;
        Ok(w + 1)
    }
}

/// Copy the next unseen publication into `buf`, advancing `cursor`
///
/// FIFO order by default; `latest` skips directly to the most recent
/// publication. Returns `Timeout` when the deadline passes with nothing
/// unseen, `TornRead` when the retry budget dies at the deadline with the
/// slot still unstable.
pub(crate) fn acquire_snapshot(
    region: &Region,
    cursor: &mut u64,
    latest: bool,
    timeout: Duration,
    buf: &mut [u8],
) -> Result<()> {
    use std::sync::atomic::Ordering;

    let k = region.slot_count() as u64;
    let deadline = Instant::now().checked_add(timeout);
    let expired = |deadline: Option<Instant>| match deadline {
        Some(d) => Instant::now() >= d,
        None => false,
    };

    let mut wait = WaitSchedule::new();
    loop {
        let w = region.write_idx().load(Ordering::Acquire);
        if w > *cursor {
            // Lapped: resume at the oldest publication still present
            if w - *cursor > k {
                *cursor = w - k;
            }
            if latest {
                *cursor = w - 1;
            }
            let target = *cursor + 1;
            let slot = region.slot(*cursor % k);
            match slot.snapshot_into(buf) {
                Ok(()) => {
                    let got = snapshot_write_id(buf);
                    if got == target {
                        *cursor = target;
                        return Ok(());
                    }
                    // The producer overwrote this slot between the cursor
                    // check and the copy; recompute from a fresh write_idx
                    if expired(deadline) {
                        return Err(ShmError::Timeout);
                    }
                    continue;
                }
                Err(err @ ShmError::TornRead { .. }) => {
                    if expired(deadline) {
                        return Err(err);
                    }
                    wait.pause();
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        if expired(deadline) {
            return Err(ShmError::Timeout);
        }
        wait.pause();
    }
}

/// Unread publications for this cursor, saturating at the slot count
pub(crate) fn pending(region: &Region, cursor: u64) -> u64 {
    use std::sync::atomic::Ordering;
    let w = region.write_idx().load(Ordering::Acquire);
    w.saturating_sub(cursor).min(region.slot_count() as u64)
}
