//! Doc table descriptor
//!
//! The doc table is the leading region of a slice buffer: one fixed-size
//! record per document column holding the external doc id, one slot per
//! variable-size blob, and the fixed-size blobs inline. All access is plain
//! offset arithmetic over the buffer; the descriptor itself owns no storage.
//!
//! Variable-size blobs live on the heap with their address and length parked
//! in the record slot; `cleanup` frees whatever is still parked there when
//! the slice is destroyed.

use crate::fatal_assert;
use crate::index::buffer::SliceBuffer;
use crate::index::schema::{DocumentDataSchema, FixedSizeBlobId, VariableSizeBlobId};
use crate::index::types::{DocId, DocIndex};

const DOC_ID_BYTES: usize = 8;
// Each variable-size blob slot is an address word plus a length word.
const VARIABLE_SLOT_BYTES: usize = 16;

/// Offset arithmetic for the doc table region of a slice buffer
#[derive(Clone, Debug)]
pub struct DocTableDescriptor {
    capacity: DocIndex,
    base_offset: usize,
    record_size: usize,
    variable_count: usize,
    fixed_offsets: Vec<(usize, usize)>,
}

impl DocTableDescriptor {
    pub fn new(capacity: DocIndex, schema: &DocumentDataSchema, base_offset: usize) -> Self {
        let variable_count = schema.variable_blob_count();
        let mut fixed_offsets = Vec::with_capacity(schema.fixed_blob_sizes().len());
        let mut offset = DOC_ID_BYTES + variable_count * VARIABLE_SLOT_BYTES;
        for &size in schema.fixed_blob_sizes() {
            fixed_offsets.push((offset, size));
            offset += size;
        }
        Self {
            capacity,
            base_offset,
            record_size: offset,
            variable_count,
            fixed_offsets,
        }
    }

    /// Bytes the doc table occupies for `capacity` columns of `schema`
    pub fn buffer_size(capacity: DocIndex, schema: &DocumentDataSchema) -> usize {
        let record_size = DOC_ID_BYTES
            + schema.variable_blob_count() * VARIABLE_SLOT_BYTES
            + schema.fixed_blob_sizes().iter().sum::<usize>();
        capacity * record_size
    }

    pub fn capacity(&self) -> DocIndex {
        self.capacity
    }

    /// Zero the doc table region
    pub fn initialize(&self, buffer: &SliceBuffer) {
        buffer.fill(self.base_offset, self.capacity * self.record_size, 0);
    }

    fn record_offset(&self, index: DocIndex) -> usize {
        fatal_assert!(
            index < self.capacity,
            "doc index {} out of range for capacity {}",
            index,
            self.capacity
        );
        self.base_offset + index * self.record_size
    }

    pub fn set_doc_id(&self, buffer: &SliceBuffer, index: DocIndex, doc_id: DocId) {
        buffer.write_u64(self.record_offset(index), doc_id);
    }

    pub fn doc_id(&self, buffer: &SliceBuffer, index: DocIndex) -> DocId {
        buffer.read_u64(self.record_offset(index))
    }

    fn variable_slot_offset(&self, index: DocIndex, id: VariableSizeBlobId) -> usize {
        fatal_assert!(
            (id.0 as usize) < self.variable_count,
            "variable blob {} not registered",
            id.0
        );
        self.record_offset(index) + DOC_ID_BYTES + id.0 as usize * VARIABLE_SLOT_BYTES
    }

    /// Copy `data` into a fresh heap blob and park it in the column's slot.
    ///
    /// Allocating the same slot twice is a programming error.
    pub fn allocate_variable_size_blob(
        &self,
        buffer: &SliceBuffer,
        index: DocIndex,
        id: VariableSizeBlobId,
        data: &[u8],
    ) {
        let slot = self.variable_slot_offset(index, id);
        fatal_assert!(
            buffer.read_u64(slot) == 0,
            "variable blob {} of doc index {} allocated twice",
            id.0,
            index
        );
        let blob: Box<[u8]> = data.to_vec().into_boxed_slice();
        let len = blob.len();
        let ptr = Box::into_raw(blob) as *mut u8;
        buffer.write_u64(slot, ptr as u64);
        buffer.write_u64(slot + 8, len as u64);
    }

    /// Read back a column's variable-size blob, if one was allocated.
    ///
    /// # Safety
    ///
    /// The owning slice must stay alive (no `cleanup`) for the whole
    /// lifetime `'a`. Holders of a live slice reference or a reader token
    /// issued before the slice was retired satisfy this.
    pub unsafe fn variable_size_blob<'a>(
        &self,
        buffer: &'a SliceBuffer,
        index: DocIndex,
        id: VariableSizeBlobId,
    ) -> Option<&'a [u8]> {
        let slot = self.variable_slot_offset(index, id);
        let ptr = buffer.read_u64(slot);
        if ptr == 0 {
            return None;
        }
        let len = buffer.read_u64(slot + 8) as usize;
        Some(std::slice::from_raw_parts(ptr as *const u8, len))
    }

    fn fixed_blob_location(&self, index: DocIndex, id: FixedSizeBlobId) -> (usize, usize) {
        match self.fixed_offsets.get(id.0 as usize) {
            Some(&(offset, size)) => (self.record_offset(index) + offset, size),
            None => crate::fatal!("fixed blob {} not registered", id.0),
        }
    }

    pub fn write_fixed_size_blob(
        &self,
        buffer: &SliceBuffer,
        index: DocIndex,
        id: FixedSizeBlobId,
        data: &[u8],
    ) {
        let (offset, size) = self.fixed_blob_location(index, id);
        fatal_assert!(
            data.len() == size,
            "fixed blob {} takes {} bytes, got {}",
            id.0,
            size,
            data.len()
        );
        buffer.write_bytes(offset, data);
    }

    pub fn fixed_size_blob(
        &self,
        buffer: &SliceBuffer,
        index: DocIndex,
        id: FixedSizeBlobId,
    ) -> Vec<u8> {
        let (offset, size) = self.fixed_blob_location(index, id);
        (0..size).map(|i| buffer.read_u8(offset + i)).collect()
    }

    /// Free every parked variable-size blob and clear the slots.
    ///
    /// # Safety
    ///
    /// Must run exactly once, after all readers of the slice's blobs are
    /// gone. The slice destructor is the only caller.
    pub unsafe fn cleanup(&self, buffer: &SliceBuffer) {
        for index in 0..self.capacity {
            for blob in 0..self.variable_count {
                let slot = self.variable_slot_offset(index, VariableSizeBlobId(blob as u8));
                let ptr = buffer.read_u64(slot);
                if ptr != 0 {
                    let len = buffer.read_u64(slot + 8) as usize;
                    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                        ptr as *mut u8,
                        len,
                    )));
                    buffer.write_u64(slot, 0);
                    buffer.write_u64(slot + 8, 0);
                }
            }
        }
    }
}
