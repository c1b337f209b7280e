//! Slice lifecycle
//!
//! A slice is one packed batch of up to `capacity` document columns sharing
//! a single buffer. Three counters under one mutex track its life:
//! `unallocated` columns still free, `commit_pending` columns handed out but
//! not yet committed, and `expired` columns soft-deleted. A slice moves
//! forward only: active, sealed, fully committed, expired, recycled.
//!
//! The reference count starts at one for the shard. Whole-slice expiry
//! collapses the per-column decrements into a single one; outside holders
//! (a backup writer, say) bump and release around it. The decrement that
//! reaches zero hands the slice to its shard for recycling.

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{BitGridError, Result};
use crate::fatal_assert;
use crate::index::buffer::SliceBuffer;
use crate::index::shard::Shard;
use crate::index::types::{DocIndex, SliceId};

#[derive(Debug)]
struct SliceCounters {
    unallocated: DocIndex,
    commit_pending: DocIndex,
    expired: DocIndex,
}

/// One packed column batch and its lifecycle state
pub struct Slice {
    id: SliceId,
    shard: Weak<Shard>,
    capacity: DocIndex,
    buffer: Option<Arc<SliceBuffer>>,
    counters: Mutex<SliceCounters>,
    ref_count: AtomicU32,
}

impl Slice {
    /// Allocate a buffer from the shard's allocator and initialize the
    /// descriptor regions in place. Every column starts with its
    /// document-active bit set.
    pub fn new(shard: &Arc<Shard>) -> Result<Arc<Slice>> {
        let buffer = shard.allocate_slice_buffer()?;
        let id = shard.next_slice_id();
        let capacity = shard.slice_capacity();

        shard.doc_table().initialize(&buffer);
        for table in shard.row_tables() {
            table.initialize(&buffer);
        }
        let active = shard.document_active_row();
        shard.row_table(active.rank()).fill_row(&buffer, active.index());
        buffer.store_slice_id(id);

        Ok(Arc::new(Slice {
            id,
            shard: Arc::downgrade(shard),
            capacity,
            buffer: Some(buffer),
            counters: Mutex::new(SliceCounters {
                unallocated: capacity,
                commit_pending: 0,
                expired: 0,
            }),
            ref_count: AtomicU32::new(1),
        }))
    }

    pub fn id(&self) -> SliceId {
        self.id
    }

    pub fn capacity(&self) -> DocIndex {
        self.capacity
    }

    pub fn buffer(&self) -> &Arc<SliceBuffer> {
        match &self.buffer {
            Some(buffer) => buffer,
            None => crate::fatal!("{} buffer already released", self.id),
        }
    }

    /// Hand out the next free column, densely and in order
    pub fn try_allocate(&self) -> Option<DocIndex> {
        let mut counters = self.counters.lock();
        if counters.unallocated == 0 {
            return None;
        }
        let index = self.capacity - counters.unallocated;
        counters.unallocated -= 1;
        counters.commit_pending += 1;
        Some(index)
    }

    /// Mark one allocated column as committed.
    ///
    /// Returns true when the slice is full: nothing left to allocate and no
    /// commit outstanding.
    pub fn commit(&self) -> bool {
        if let Some(shard) = self.shard.upgrade() {
            shard.record_document();
        }
        let mut counters = self.counters.lock();
        fatal_assert!(
            counters.commit_pending > 0,
            "commit on {} with no allocation pending",
            self.id
        );
        counters.commit_pending -= 1;
        counters.unallocated + counters.commit_pending == 0
    }

    /// Mark one committed column as expired.
    ///
    /// Returns true when every column of the slice has expired; the caller
    /// then owns releasing the shard's reference via
    /// [`Slice::decrement_ref_count`].
    pub fn expire(&self) -> Result<bool> {
        let mut counters = self.counters.lock();
        let committed = self.capacity - counters.unallocated - counters.commit_pending;
        if counters.expired >= committed {
            return Err(BitGridError::ExpireExceedsCommitted(self.id));
        }
        counters.expired += 1;
        Ok(counters.expired == self.capacity)
    }

    pub fn is_expired(&self) -> bool {
        self.counters.lock().expired == self.capacity
    }

    /// Register an additional holder keeping this slice alive
    pub fn increment_ref_count(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one holder. The release that reaches zero asks the shard to
    /// recycle the slice; recycling a slice that is not fully expired is a
    /// recoverable error.
    pub fn decrement_ref_count(slice: &Arc<Slice>) -> Result<()> {
        let prior = slice.ref_count.fetch_sub(1, Ordering::Release);
        fatal_assert!(prior > 0, "ref count underflow on {}", slice.id);
        if prior == 1 {
            fence(Ordering::Acquire);
            match slice.shard.upgrade() {
                Some(shard) => shard.recycle_slice(slice)?,
                None => tracing::warn!("{} released after its shard was dropped", slice.id),
            }
        }
        Ok(())
    }

    pub(crate) fn shard(&self) -> Arc<Shard> {
        match self.shard.upgrade() {
            Some(shard) => shard,
            None => crate::fatal!("{} used after its shard was dropped", self.id),
        }
    }
}

impl Drop for Slice {
    fn drop(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        match self.shard.upgrade() {
            Some(shard) => {
                // SAFETY: this is the last reference to the slice; the
                // recycler has already drained every token issued before the
                // slice was retired, so no reader can still reach its blobs.
                unsafe { shard.doc_table().cleanup(&buffer) };
                shard.release_slice_buffer(buffer);
            }
            None => {
                tracing::warn!("{} dropped after its shard; blob cleanup skipped", self.id);
            }
        }
    }
}
