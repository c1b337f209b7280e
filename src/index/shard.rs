//! Shard
//!
//! A shard owns a growing set of slices and directs all new allocations at
//! one active slice. The list of live slice buffers is an immutable vector
//! published through an atomic swap: writers build a copy under the shard
//! mutex, readers snapshot it wait-free, and retired copies go to the
//! recycler stamped with the token serial at publication.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::{BitGridError, Result};
use crate::fatal_assert;
use crate::index::allocator::SliceBufferAllocator;
use crate::index::buffer::{SliceBuffer, SLICE_ID_BYTES};
use crate::index::doc_table::DocTableDescriptor;
use crate::index::handle::DocumentHandle;
use crate::index::recycler::{RecycleUnit, Recycler};
use crate::index::row_table::RowTableDescriptor;
use crate::index::schema::DocumentDataSchema;
use crate::index::slice::Slice;
use crate::index::statistics::DocFrequencyTableBuilder;
use crate::index::term_table::TermTable;
use crate::index::token::TokenManager;
use crate::index::types::{
    rank0_quantum, DocId, DocIndex, FactHandle, Rank, RowId, ShardId, SliceId, Term,
};

#[derive(Default)]
struct ShardSlices {
    active: Option<Arc<Slice>>,
    by_id: HashMap<SliceId, Arc<Slice>>,
}

/// One partition of the corpus, holding slices of a fixed capacity
pub struct Shard {
    id: ShardId,
    self_ref: Weak<Shard>,
    term_table: Arc<dyn TermTable>,
    allocator: Arc<dyn SliceBufferAllocator>,
    recycler: Arc<Recycler>,
    token_manager: Arc<TokenManager>,
    document_active_row: RowId,
    slice_capacity: DocIndex,
    slice_buffer_size: usize,
    doc_table: DocTableDescriptor,
    row_tables: Vec<RowTableDescriptor>,
    next_slice_id: AtomicU64,
    slices: Mutex<ShardSlices>,
    buffers: ArcSwap<Vec<Arc<SliceBuffer>>>,
    frequency_builder: Option<Mutex<DocFrequencyTableBuilder>>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard").field("id", &self.id).finish()
    }
}

impl Shard {
    pub fn new(
        id: ShardId,
        term_table: Arc<dyn TermTable>,
        schema: &DocumentDataSchema,
        allocator: Arc<dyn SliceBufferAllocator>,
        recycler: Arc<Recycler>,
        token_manager: Arc<TokenManager>,
        collect_statistics: bool,
    ) -> Result<Arc<Shard>> {
        let slice_buffer_size = allocator.slice_buffer_size();
        let document_active_row = Self::document_active_row_id(&*term_table)?;
        let slice_capacity =
            Self::capacity_for_byte_size(slice_buffer_size, schema, &*term_table);
        let (doc_table, row_tables, layout_size) =
            Self::initialize_descriptors(slice_capacity, schema, &*term_table);
        fatal_assert!(
            layout_size <= slice_buffer_size,
            "descriptor layout of {} bytes overflows the {}-byte slice buffer",
            layout_size,
            slice_buffer_size
        );

        Ok(Arc::new_cyclic(|self_ref| Shard {
            id,
            self_ref: self_ref.clone(),
            term_table,
            allocator,
            recycler,
            token_manager,
            document_active_row,
            slice_capacity,
            slice_buffer_size,
            doc_table,
            row_tables,
            next_slice_id: AtomicU64::new(0),
            slices: Mutex::new(ShardSlices::default()),
            buffers: ArcSwap::from_pointee(Vec::new()),
            frequency_builder: collect_statistics
                .then(|| Mutex::new(DocFrequencyTableBuilder::new())),
        }))
    }

    /// The row marking documents as not soft-deleted. It must be the only
    /// row of the document-active term and must sit at rank 0.
    fn document_active_row_id(term_table: &dyn TermTable) -> Result<RowId> {
        let rows = term_table.row_ids(&term_table.document_active_term());
        let row = match rows.as_slice() {
            [row] => *row,
            _ => return Err(BitGridError::DocumentActiveRowCount(rows.len())),
        };
        if row.rank() != 0 {
            return Err(BitGridError::DocumentActiveRowRank(row.rank()));
        }
        Ok(row)
    }

    /// Total bytes a slice buffer needs for `capacity` columns
    fn layout_size(
        capacity: DocIndex,
        schema: &DocumentDataSchema,
        term_table: &dyn TermTable,
    ) -> usize {
        let mut offset = DocTableDescriptor::buffer_size(capacity, schema);
        for rank in 0..=term_table.max_rank_used() {
            offset +=
                RowTableDescriptor::buffer_size(capacity, term_table.total_row_count(rank), rank);
        }
        offset + SLICE_ID_BYTES
    }

    /// Largest capacity whose layout fits in `buffer_size` bytes, probing in
    /// rank-0 quanta. A buffer too small for even one quantum is fatal.
    pub fn capacity_for_byte_size(
        buffer_size: usize,
        schema: &DocumentDataSchema,
        term_table: &dyn TermTable,
    ) -> DocIndex {
        let quantum = rank0_quantum(term_table.max_rank_used());
        let mut capacity = 0;
        loop {
            let probe = capacity + quantum;
            if Self::layout_size(probe, schema, term_table) > buffer_size {
                break;
            }
            capacity = probe;
        }
        fatal_assert!(
            capacity > 0,
            "slice buffer of {} bytes cannot hold one allocation quantum",
            buffer_size
        );
        capacity
    }

    /// Lay out the doc table at offset zero, then one row table per rank in
    /// ascending order, then the tail word
    fn initialize_descriptors(
        capacity: DocIndex,
        schema: &DocumentDataSchema,
        term_table: &dyn TermTable,
    ) -> (DocTableDescriptor, Vec<RowTableDescriptor>, usize) {
        let doc_table = DocTableDescriptor::new(capacity, schema, 0);
        let mut offset = DocTableDescriptor::buffer_size(capacity, schema);
        let mut row_tables = Vec::with_capacity(term_table.max_rank_used() + 1);
        for rank in 0..=term_table.max_rank_used() {
            let row_count = term_table.total_row_count(rank);
            row_tables.push(RowTableDescriptor::new(capacity, row_count, rank, offset));
            offset += RowTableDescriptor::buffer_size(capacity, row_count, rank);
        }
        (doc_table, row_tables, offset + SLICE_ID_BYTES)
    }

    /// Allocate a column for a document, rolling the active slice when full
    pub fn allocate_document(&self, doc_id: DocId) -> Result<DocumentHandle> {
        let mut slices = self.slices.lock();

        if let Some(active) = slices.active.clone() {
            if let Some(index) = active.try_allocate() {
                drop(slices);
                self.doc_table.set_doc_id(active.buffer(), index, doc_id);
                return Ok(DocumentHandle::new(active, index, doc_id));
            }
        }

        self.create_new_active_slice(&mut slices)?;
        let active = match slices.active.clone() {
            Some(active) => active,
            None => crate::fatal!("shard {} has no active slice after creating one", self.id),
        };
        match active.try_allocate() {
            Some(index) => {
                drop(slices);
                self.doc_table.set_doc_id(active.buffer(), index, doc_id);
                Ok(DocumentHandle::new(active, index, doc_id))
            }
            None => crate::fatal!("newly created slice in shard {} has no space", self.id),
        }
    }

    /// Create a slice, publish a buffer list including it, and retire the
    /// previous list through the recycler. Callers hold the slices mutex.
    fn create_new_active_slice(&self, slices: &mut ShardSlices) -> Result<()> {
        let shard = self.self_arc();
        let slice = Slice::new(&shard)?;

        let old_list = self.buffers.load_full();
        let mut new_list = Vec::with_capacity(old_list.len() + 1);
        new_list.extend(old_list.iter().cloned());
        new_list.push(Arc::clone(slice.buffer()));
        self.buffers.store(Arc::new(new_list));

        slices.by_id.insert(slice.id(), Arc::clone(&slice));
        slices.active = Some(slice);

        // Readers that snapshotted the previous list keep using it; it is
        // destroyed once every token issued before this publish retires.
        self.recycler.schedule(RecycleUnit::new(
            old_list,
            None,
            self.token_manager.serial_of_next_token(),
        ));
        Ok(())
    }

    /// Remove a fully-expired slice from the shard.
    ///
    /// Called by the refcount decrement that reached zero. The buffer list
    /// shrinks by exactly one; the old list and the slice itself go to the
    /// recycler outside the mutex.
    pub fn recycle_slice(&self, slice: &Arc<Slice>) -> Result<()> {
        let old_list;
        {
            let mut slices = self.slices.lock();

            if !slice.is_expired() {
                return Err(BitGridError::SliceNotExpired(slice.id()));
            }

            let current = self.buffers.load_full();
            let remaining: Vec<Arc<SliceBuffer>> = current
                .iter()
                .filter(|buffer| !Arc::ptr_eq(buffer, slice.buffer()))
                .cloned()
                .collect();
            if remaining.len() + 1 != current.len() {
                return Err(BitGridError::BufferListMissingSlice(slice.id()));
            }
            self.buffers.store(Arc::new(remaining));

            slices.by_id.remove(&slice.id());
            if slices
                .active
                .as_ref()
                .map_or(false, |active| Arc::ptr_eq(active, slice))
            {
                slices.active = None;
            }
            old_list = current;
        }

        self.recycler.schedule(RecycleUnit::new(
            old_list,
            Some(Arc::clone(slice)),
            self.token_manager.serial_of_next_token(),
        ));
        Ok(())
    }

    /// Set the bit of every row the term's signature touches at `index`
    pub fn add_posting(&self, term: &Term, index: DocIndex, buffer: &SliceBuffer) {
        if let Some(builder) = &self.frequency_builder {
            builder.lock().on_term(*term);
        }
        for row in self.term_table.row_ids(term) {
            self.row_table(row.rank()).set_bit(buffer, row.index(), index);
        }
    }

    /// Set or clear a fact bit. Facts must map to exactly one row.
    pub fn assert_fact(
        &self,
        fact: FactHandle,
        value: bool,
        index: DocIndex,
        buffer: &SliceBuffer,
    ) -> Result<()> {
        let term = Term::from_fact(fact);
        let rows = self.term_table.row_ids(&term);
        let row = match rows.as_slice() {
            [row] => *row,
            _ => {
                return Err(BitGridError::FactRowCount {
                    fact,
                    rows: rows.len(),
                })
            }
        };
        let table = self.row_table(row.rank());
        if value {
            table.set_bit(buffer, row.index(), index);
        } else {
            table.clear_bit(buffer, row.index(), index);
        }
        Ok(())
    }

    pub(crate) fn set_document_active(&self, buffer: &SliceBuffer, index: DocIndex, active: bool) {
        let row = self.document_active_row;
        let table = self.row_table(row.rank());
        if active {
            table.set_bit(buffer, row.index(), index);
        } else {
            table.clear_bit(buffer, row.index(), index);
        }
    }

    /// Whether a column is live (not soft-deleted)
    pub fn is_document_active(&self, buffer: &SliceBuffer, index: DocIndex) -> bool {
        let row = self.document_active_row;
        self.row_table(row.rank()).bit(buffer, row.index(), index)
    }

    pub(crate) fn record_document(&self) {
        if let Some(builder) = &self.frequency_builder {
            builder.lock().on_document_enter();
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn slice_capacity(&self) -> DocIndex {
        self.slice_capacity
    }

    pub fn slice_buffer_size(&self) -> usize {
        self.slice_buffer_size
    }

    /// Snapshot of the live slice buffers. Hold a token across its use.
    pub fn slice_buffers(&self) -> Arc<Vec<Arc<SliceBuffer>>> {
        self.buffers.load_full()
    }

    /// Bytes held by this shard's live slice buffers
    pub fn used_capacity_in_bytes(&self) -> usize {
        self.buffers.load().len() * self.slice_buffer_size
    }

    /// Resolve a buffer from a reader snapshot back to its slice
    pub fn slice_for_buffer(&self, buffer: &SliceBuffer) -> Option<Arc<Slice>> {
        self.slices.lock().by_id.get(&buffer.slice_id()).cloned()
    }

    pub fn doc_table(&self) -> &DocTableDescriptor {
        &self.doc_table
    }

    pub fn row_tables(&self) -> &[RowTableDescriptor] {
        &self.row_tables
    }

    pub fn row_table(&self, rank: Rank) -> &RowTableDescriptor {
        match self.row_tables.get(rank) {
            Some(table) => table,
            None => crate::fatal!("shard {} has no row table at rank {}", self.id, rank),
        }
    }

    pub fn document_active_row(&self) -> RowId {
        self.document_active_row
    }

    pub(crate) fn allocate_slice_buffer(&self) -> Result<Arc<SliceBuffer>> {
        self.allocator.allocate(self.slice_buffer_size)
    }

    pub(crate) fn release_slice_buffer(&self, buffer: Arc<SliceBuffer>) {
        self.allocator.release(buffer);
    }

    pub(crate) fn next_slice_id(&self) -> SliceId {
        SliceId::new(self.next_slice_id.fetch_add(1, Ordering::Relaxed))
    }

    fn self_arc(&self) -> Arc<Shard> {
        match self.self_ref.upgrade() {
            Some(shard) => shard,
            None => crate::fatal!("shard {} used during teardown", self.id),
        }
    }

    pub fn write_doc_frequency_table(
        &self,
        out: &mut dyn Write,
        truncation_frequency: f64,
    ) -> io::Result<()> {
        match &self.frequency_builder {
            Some(builder) => builder.lock().write_frequencies(out, truncation_frequency),
            None => Ok(()),
        }
    }

    pub fn write_cumulative_term_counts(&self, out: &mut dyn Write) -> io::Result<()> {
        match &self.frequency_builder {
            Some(builder) => builder.lock().write_cumulative_term_counts(out),
            None => Ok(()),
        }
    }

    pub fn write_indexed_idf_table(
        &self,
        out: &mut dyn Write,
        truncation_frequency: f64,
    ) -> io::Result<()> {
        match &self.frequency_builder {
            Some(builder) => builder.lock().write_indexed_idf_table(out, truncation_frequency),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::allocator::TrackingBufferAllocator;
    use crate::index::term_table::BasicTermTable;

    /// Term table mapping every term to one rank-0 row, as a real term
    /// table does for facts
    struct SingleRowTable;

    impl TermTable for SingleRowTable {
        fn row_ids(&self, term: &Term) -> Vec<RowId> {
            if *term == Term::DOCUMENT_ACTIVE {
                vec![RowId::new(0, 0)]
            } else {
                vec![RowId::new(0, 1 + (term.raw_hash() % 3) as usize)]
            }
        }

        fn document_active_term(&self) -> Term {
            Term::DOCUMENT_ACTIVE
        }

        fn total_row_count(&self, rank: Rank) -> usize {
            if rank == 0 {
                4
            } else {
                0
            }
        }

        fn max_rank_used(&self) -> Rank {
            0
        }
    }

    fn build_shard(term_table: Arc<dyn TermTable>, buffer_size: usize) -> Arc<Shard> {
        let allocator = Arc::new(TrackingBufferAllocator::new(buffer_size));
        let token_manager = Arc::new(TokenManager::new());
        let recycler = Arc::new(Recycler::new(Arc::clone(&token_manager)));
        let schema = DocumentDataSchema::new();
        Shard::new(0, term_table, &schema, allocator, recycler, token_manager, false).unwrap()
    }

    #[test]
    fn test_capacity_probes_in_quanta() {
        let term_table = BasicTermTable::new(vec![3]);
        let schema = DocumentDataSchema::new();

        // Capacity 16: doc table 128 bytes, three 2-byte rows, tail word.
        assert_eq!(Shard::capacity_for_byte_size(150, &schema, &term_table), 16);
        // One byte short of capacity 16 falls back to 8.
        assert_eq!(Shard::capacity_for_byte_size(141, &schema, &term_table), 8);

        let mut schema = DocumentDataSchema::new();
        schema.register_fixed_size_blob(10);
        schema.register_variable_size_blob();
        // Record grows to 34 bytes per column.
        assert_eq!(Shard::capacity_for_byte_size(600, &schema, &term_table), 16);
    }

    #[test]
    #[should_panic(expected = "cannot hold one allocation quantum")]
    fn test_zero_capacity_is_fatal() {
        let term_table = BasicTermTable::new(vec![3]);
        let schema = DocumentDataSchema::new();
        Shard::capacity_for_byte_size(32, &schema, &term_table);
    }

    #[test]
    fn test_allocate_rolls_active_slice() {
        let shard = build_shard(Arc::new(BasicTermTable::new(vec![3])), 150);
        let capacity = shard.slice_capacity();

        let first = shard.allocate_document(0).unwrap();
        for doc in 1..capacity as DocId {
            let handle = shard.allocate_document(doc).unwrap();
            assert_eq!(handle.slice().id(), first.slice().id());
        }
        assert_eq!(shard.slice_buffers().len(), 1);

        // Next allocation spills into a fresh slice.
        let spill = shard.allocate_document(capacity as DocId).unwrap();
        assert_ne!(spill.slice().id(), first.slice().id());
        assert_eq!(spill.index(), 0);
        assert_eq!(shard.slice_buffers().len(), 2);
        assert_eq!(shard.used_capacity_in_bytes(), 2 * shard.slice_buffer_size());
    }

    #[test]
    fn test_doc_ids_recorded_in_doc_table() {
        let shard = build_shard(Arc::new(BasicTermTable::new(vec![3])), 150);
        let handle = shard.allocate_document(777).unwrap();
        assert_eq!(
            shard.doc_table().doc_id(handle.slice().buffer(), handle.index()),
            777
        );
    }

    #[test]
    fn test_add_posting_sets_signature_rows() {
        let term_table = Arc::new(BasicTermTable::new(vec![8]));
        let shard = build_shard(term_table.clone(), 400);
        let handle = shard.allocate_document(1).unwrap();
        let buffer = handle.slice().buffer();

        let term = Term::new("heron", 0);
        shard.add_posting(&term, handle.index(), buffer);

        for row in term_table.row_ids(&term) {
            assert!(shard.row_table(row.rank()).bit(buffer, row.index(), handle.index()));
        }
    }

    #[test]
    fn test_assert_fact_sets_and_clears() {
        let shard = build_shard(Arc::new(SingleRowTable), 400);
        let handle = shard.allocate_document(1).unwrap();
        let buffer = handle.slice().buffer();
        let fact = FactHandle(42);

        shard.assert_fact(fact, true, handle.index(), buffer).unwrap();
        let row = SingleRowTable.row_ids(&Term::from_fact(fact))[0];
        assert!(shard.row_table(row.rank()).bit(buffer, row.index(), handle.index()));

        shard.assert_fact(fact, false, handle.index(), buffer).unwrap();
        assert!(!shard.row_table(row.rank()).bit(buffer, row.index(), handle.index()));
    }

    #[test]
    fn test_assert_fact_requires_single_row() {
        // The hashed table gives every term two rank-0 rows.
        let shard = build_shard(Arc::new(BasicTermTable::new(vec![8])), 400);
        let handle = shard.allocate_document(1).unwrap();
        let err = shard
            .assert_fact(FactHandle(42), true, handle.index(), handle.slice().buffer())
            .unwrap_err();
        assert!(matches!(err, BitGridError::FactRowCount { rows: 2, .. }));
    }

    #[test]
    fn test_recycle_rejects_live_slice() {
        let shard = build_shard(Arc::new(BasicTermTable::new(vec![3])), 150);
        let handle = shard.allocate_document(1).unwrap();
        let slice = Arc::clone(handle.slice());

        assert!(matches!(
            shard.recycle_slice(&slice),
            Err(BitGridError::SliceNotExpired(_))
        ));
        // The buffer list is untouched.
        assert_eq!(shard.slice_buffers().len(), 1);
    }

    #[test]
    fn test_slice_for_buffer_resolves_through_tail_word() {
        let shard = build_shard(Arc::new(BasicTermTable::new(vec![3])), 150);
        let handle = shard.allocate_document(1).unwrap();

        let buffers = shard.slice_buffers();
        let resolved = shard.slice_for_buffer(&buffers[0]).unwrap();
        assert_eq!(resolved.id(), handle.slice().id());
    }

    #[test]
    fn test_document_active_row_validation() {
        // A table whose active term maps to two rows is rejected.
        struct TwoRowActive;
        impl TermTable for TwoRowActive {
            fn row_ids(&self, _term: &Term) -> Vec<RowId> {
                vec![RowId::new(0, 0), RowId::new(0, 1)]
            }
            fn document_active_term(&self) -> Term {
                Term::DOCUMENT_ACTIVE
            }
            fn total_row_count(&self, _rank: Rank) -> usize {
                4
            }
            fn max_rank_used(&self) -> Rank {
                0
            }
        }

        let allocator = Arc::new(TrackingBufferAllocator::new(400));
        let token_manager = Arc::new(TokenManager::new());
        let recycler = Arc::new(Recycler::new(Arc::clone(&token_manager)));
        let schema = DocumentDataSchema::new();
        let err = Shard::new(
            0,
            Arc::new(TwoRowActive),
            &schema,
            allocator,
            recycler,
            token_manager,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, BitGridError::DocumentActiveRowCount(2)));
    }
}
