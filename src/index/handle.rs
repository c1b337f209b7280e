//! Document handles
//!
//! A handle names one column of one slice. Writers get one from
//! `Shard::allocate_document`, stream postings through it, then activate
//! and commit. The handle keeps its slice alive, so blob reads through a
//! held handle need no token.

use std::sync::Arc;

use crate::error::Result;
use crate::index::schema::{FixedSizeBlobId, VariableSizeBlobId};
use crate::index::slice::Slice;
use crate::index::types::{DocId, DocIndex, FactHandle, Term};

/// One document's column within a slice
#[derive(Clone)]
pub struct DocumentHandle {
    slice: Arc<Slice>,
    index: DocIndex,
    doc_id: DocId,
}

impl DocumentHandle {
    pub(crate) fn new(slice: Arc<Slice>, index: DocIndex, doc_id: DocId) -> Self {
        Self {
            slice,
            index,
            doc_id,
        }
    }

    pub fn doc_id(&self) -> DocId {
        self.doc_id
    }

    pub fn index(&self) -> DocIndex {
        self.index
    }

    pub fn slice(&self) -> &Arc<Slice> {
        &self.slice
    }

    /// Record a term posting for this document
    pub fn add_posting(&self, term: &Term) {
        self.slice
            .shard()
            .add_posting(term, self.index, self.slice.buffer());
    }

    /// Set or clear a fact bit for this document
    pub fn assert_fact(&self, fact: FactHandle, value: bool) -> Result<()> {
        self.slice
            .shard()
            .assert_fact(fact, value, self.index, self.slice.buffer())
    }

    /// Mark the column live for queries
    pub fn activate(&self) {
        self.slice
            .shard()
            .set_document_active(self.slice.buffer(), self.index, true);
    }

    /// Soft-delete the column: clear its document-active bit and count the
    /// expiry. Expiring the last committed column releases the shard's
    /// reference on the slice, which schedules it for recycling.
    pub fn expire(&self) -> Result<()> {
        self.slice
            .shard()
            .set_document_active(self.slice.buffer(), self.index, false);
        if self.slice.expire()? {
            Slice::decrement_ref_count(&self.slice)?;
        }
        Ok(())
    }

    /// Whether this column is currently live
    pub fn is_active(&self) -> bool {
        self.slice
            .shard()
            .is_document_active(self.slice.buffer(), self.index)
    }

    /// Store a variable-size blob for this document
    pub fn allocate_variable_size_blob(&self, id: VariableSizeBlobId, data: &[u8]) {
        self.slice.shard().doc_table().allocate_variable_size_blob(
            self.slice.buffer(),
            self.index,
            id,
            data,
        );
    }

    /// Read this document's variable-size blob, if one was stored
    pub fn variable_size_blob(&self, id: VariableSizeBlobId) -> Option<Vec<u8>> {
        let shard = self.slice.shard();
        // SAFETY: the handle holds the slice, so its blobs cannot be freed
        // while the borrow below is alive.
        unsafe {
            shard
                .doc_table()
                .variable_size_blob(self.slice.buffer(), self.index, id)
                .map(|blob| blob.to_vec())
        }
    }

    /// Store a fixed-size blob for this document
    pub fn write_fixed_size_blob(&self, id: FixedSizeBlobId, data: &[u8]) {
        self.slice.shard().doc_table().write_fixed_size_blob(
            self.slice.buffer(),
            self.index,
            id,
            data,
        );
    }

    /// Read this document's fixed-size blob
    pub fn fixed_size_blob(&self, id: FixedSizeBlobId) -> Vec<u8> {
        self.slice
            .shard()
            .doc_table()
            .fixed_size_blob(self.slice.buffer(), self.index, id)
    }
}
