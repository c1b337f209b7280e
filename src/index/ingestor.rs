//! Ingestion front end
//!
//! The ingestor routes each document to a shard by posting count, drives the
//! allocate / ingest / activate / commit sequence, and keeps the map from
//! external doc ids to their handles. Deletes serialize on that map's mutex;
//! a missing id is not an error, so range soft-deletes can sweep id spans
//! without knowing which ids exist.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::IndexConfig;
use crate::error::{BitGridError, Result};
use crate::fatal_assert;
use crate::index::allocator::SliceBufferAllocator;
use crate::index::file_manager::FileManager;
use crate::index::handle::DocumentHandle;
use crate::index::recycler::Recycler;
use crate::index::schema::DocumentDataSchema;
use crate::index::shard::Shard;
use crate::index::statistics::DocumentLengthHistogram;
use crate::index::term_table::TermTable;
use crate::index::token::TokenManager;
use crate::index::types::{DocId, ShardId};

/// A document the ingestor can index
pub trait Document {
    /// Number of postings this document will write
    fn posting_count(&self) -> usize;

    /// Write the document's postings and blobs through the handle
    fn ingest(&self, handle: &DocumentHandle) -> Result<()>;
}

/// Partitions the corpus by posting count
pub trait ShardDefinition: Send + Sync {
    fn shard_count(&self) -> usize;

    /// Shard for a document with `posting_count` postings. Total and
    /// monotonic: longer documents never map to an earlier shard.
    fn shard_for_posting_count(&self, posting_count: usize) -> ShardId;
}

/// Shard definition over ascending posting-count boundaries.
///
/// `boundaries[i]` is the smallest posting count routed to shard `i`;
/// the first boundary is effectively zero.
pub struct PostingCountShardDefinition {
    boundaries: Vec<usize>,
}

impl PostingCountShardDefinition {
    pub fn new(boundaries: Vec<usize>) -> Self {
        fatal_assert!(!boundaries.is_empty(), "shard definition needs at least one shard");
        fatal_assert!(
            boundaries.windows(2).all(|pair| pair[0] < pair[1]),
            "shard boundaries must strictly ascend"
        );
        Self { boundaries }
    }

    /// One shard taking every document
    pub fn single_shard() -> Self {
        Self::new(vec![0])
    }
}

impl ShardDefinition for PostingCountShardDefinition {
    fn shard_count(&self) -> usize {
        self.boundaries.len()
    }

    fn shard_for_posting_count(&self, posting_count: usize) -> ShardId {
        self.boundaries
            .iter()
            .rposition(|&min| min <= posting_count)
            .unwrap_or(0)
    }
}

/// Ingestion and deletion front end over a set of shards
pub struct Ingestor {
    shards: Vec<Arc<Shard>>,
    shard_definition: Arc<dyn ShardDefinition>,
    token_manager: Arc<TokenManager>,
    recycler: Arc<Recycler>,
    document_count: AtomicU64,
    histogram: Mutex<DocumentLengthHistogram>,
    // Doc id -> handle. One mutex serializes all map mutation, which is what
    // makes concurrent deletes of the same id safe.
    documents: Mutex<HashMap<DocId, DocumentHandle>>,
}

impl Ingestor {
    pub fn new(
        config: &IndexConfig,
        schema: &DocumentDataSchema,
        term_table: Arc<dyn TermTable>,
        shard_definition: Arc<dyn ShardDefinition>,
        allocator: Arc<dyn SliceBufferAllocator>,
    ) -> Result<Ingestor> {
        let token_manager = Arc::new(TokenManager::new());
        let recycler = Arc::new(Recycler::new(Arc::clone(&token_manager)));

        let mut shards = Vec::with_capacity(shard_definition.shard_count());
        for shard_id in 0..shard_definition.shard_count() {
            shards.push(Shard::new(
                shard_id,
                Arc::clone(&term_table),
                schema,
                Arc::clone(&allocator),
                Arc::clone(&recycler),
                Arc::clone(&token_manager),
                config.collect_statistics,
            )?);
        }

        Ok(Ingestor {
            shards,
            shard_definition,
            token_manager,
            recycler,
            document_count: AtomicU64::new(0),
            histogram: Mutex::new(DocumentLengthHistogram::new()),
            documents: Mutex::new(HashMap::new()),
        })
    }

    /// Index one document: allocate a column in the right shard, let the
    /// document write its postings, then activate and commit.
    pub fn add(&self, id: DocId, document: &dyn Document) -> Result<()> {
        self.document_count.fetch_add(1, Ordering::Relaxed);

        let posting_count = document.posting_count();
        self.histogram.lock().add_document(posting_count);

        let shard_id = self.shard_definition.shard_for_posting_count(posting_count);
        fatal_assert!(
            shard_id < self.shards.len(),
            "shard definition routed {} postings to missing shard {}",
            posting_count,
            shard_id
        );
        let handle = self.shards[shard_id].allocate_document(id)?;

        document.ingest(&handle)?;

        handle.activate();
        handle.slice().commit();

        match self.documents.lock().entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
            Entry::Occupied(_) => {
                // Undo the half-added document. A failure here is logged and
                // swallowed so the duplicate-id error reaches the caller.
                if let Err(cleanup) = handle.expire() {
                    tracing::error!(
                        doc_id = id,
                        error = %cleanup,
                        "cleanup after failed add did not complete"
                    );
                }
                Err(BitGridError::DuplicateDocument(id))
            }
        }
    }

    /// Soft-delete a document. Returns whether the id was present; deleting
    /// an unknown id is not an error.
    pub fn delete(&self, id: DocId) -> bool {
        let _token = self.token_manager.request_token();
        let mut documents = self.documents.lock();

        match documents.remove(&id) {
            Some(handle) => {
                if let Err(e) = handle.expire() {
                    tracing::error!(doc_id = id, error = %e, "expire during delete failed");
                }
                true
            }
            None => false,
        }
    }

    /// Whether a document id is currently indexed
    pub fn contains(&self, id: DocId) -> bool {
        self.documents.lock().contains_key(&id)
    }

    /// Documents ever added (deletes do not decrement)
    pub fn document_count(&self) -> u64 {
        self.document_count.load(Ordering::Relaxed)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, shard: ShardId) -> &Arc<Shard> {
        &self.shards[shard]
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.token_manager
    }

    pub fn recycler(&self) -> &Arc<Recycler> {
        &self.recycler
    }

    /// One-line corpus summary
    pub fn print_statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        let histogram = self.histogram.lock();
        writeln!(out, "Shard count: {}", self.shards.len())?;
        writeln!(out, "Document count: {}", self.document_count())?;
        writeln!(out, "Posting count: {}", histogram.posting_count())
    }

    /// Write the statistics side-files: the document length histogram, and
    /// per shard the cumulative term counts, doc-frequency table, and
    /// indexed IDF table.
    pub fn write_statistics(&self, file_manager: &dyn FileManager) -> Result<()> {
        {
            let mut out = file_manager.document_length_histogram()?;
            self.histogram.lock().write(&mut *out)?;
        }

        for shard in &self.shards {
            {
                let mut out = file_manager.cumulative_term_counts(shard.id())?;
                shard.write_cumulative_term_counts(&mut *out)?;
            }
            {
                let mut out = file_manager.doc_frequency_table(shard.id())?;
                shard.write_doc_frequency_table(&mut *out, 0.0)?;
            }
            {
                let mut out = file_manager.indexed_idf_table(shard.id())?;
                shard.write_indexed_idf_table(&mut *out, 0.0)?;
            }
        }
        Ok(())
    }

    /// Stop issuing reader tokens, drain the outstanding ones, and let the
    /// recycler finish its queue. In-flight ingestions complete normally.
    pub fn shutdown(&self) {
        self.token_manager.shutdown();
        self.recycler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::allocator::TrackingBufferAllocator;
    use crate::index::term_table::BasicTermTable;
    use crate::index::types::Term;

    struct TestDocument {
        terms: Vec<Term>,
    }

    impl TestDocument {
        fn with_terms(words: &[&str]) -> Self {
            Self {
                terms: words.iter().map(|word| Term::new(word, 0)).collect(),
            }
        }
    }

    impl Document for TestDocument {
        fn posting_count(&self) -> usize {
            self.terms.len()
        }

        fn ingest(&self, handle: &DocumentHandle) -> Result<()> {
            for term in &self.terms {
                handle.add_posting(term);
            }
            Ok(())
        }
    }

    fn test_ingestor() -> Ingestor {
        let config = IndexConfig {
            slice_buffer_size: 400,
            max_buffers: None,
            collect_statistics: true,
        };
        Ingestor::new(
            &config,
            &DocumentDataSchema::new(),
            Arc::new(BasicTermTable::new(vec![8])),
            Arc::new(PostingCountShardDefinition::single_shard()),
            Arc::new(TrackingBufferAllocator::new(400)),
        )
        .unwrap()
    }

    #[test]
    fn test_shard_definition_routing() {
        let definition = PostingCountShardDefinition::new(vec![0, 100, 1000]);
        assert_eq!(definition.shard_count(), 3);
        assert_eq!(definition.shard_for_posting_count(0), 0);
        assert_eq!(definition.shard_for_posting_count(99), 0);
        assert_eq!(definition.shard_for_posting_count(100), 1);
        assert_eq!(definition.shard_for_posting_count(5000), 2);
    }

    #[test]
    #[should_panic(expected = "strictly ascend")]
    fn test_unsorted_boundaries_are_fatal() {
        PostingCountShardDefinition::new(vec![0, 50, 50]);
    }

    #[test]
    fn test_add_and_contains() {
        let ingestor = test_ingestor();
        let document = TestDocument::with_terms(&["cat", "dog"]);

        ingestor.add(42, &document).unwrap();
        assert!(ingestor.contains(42));
        assert!(!ingestor.contains(43));
        assert_eq!(ingestor.document_count(), 1);
    }

    #[test]
    fn test_add_writes_signature_bits() {
        let ingestor = test_ingestor();
        let document = TestDocument::with_terms(&["cat"]);
        ingestor.add(7, &document).unwrap();

        let shard = ingestor.shard(0);
        let buffers = shard.slice_buffers();
        assert_eq!(buffers.len(), 1);

        let term = Term::new("cat", 0);
        let term_table = BasicTermTable::new(vec![8]);
        for row in crate::index::term_table::TermTable::row_ids(&term_table, &term) {
            assert!(shard.row_table(row.rank()).bit(&buffers[0], row.index(), 0));
        }
        assert!(shard.is_document_active(&buffers[0], 0));
    }

    #[test]
    fn test_duplicate_add_reports_original_error() {
        let ingestor = test_ingestor();

        ingestor.add(1, &TestDocument::with_terms(&["cat"])).unwrap();
        let err = ingestor.add(1, &TestDocument::with_terms(&["dog"])).unwrap_err();
        assert!(matches!(err, BitGridError::DuplicateDocument(1)));

        // The surviving entry is the first add.
        assert!(ingestor.contains(1));
    }

    #[test]
    fn test_delete_twice() {
        let ingestor = test_ingestor();
        ingestor.add(9, &TestDocument::with_terms(&["cat"])).unwrap();

        assert!(ingestor.delete(9));
        assert!(!ingestor.delete(9));
        assert!(!ingestor.contains(9));
    }

    #[test]
    fn test_delete_unknown_id_is_silent() {
        let ingestor = test_ingestor();
        assert!(!ingestor.delete(12345));
    }

    #[test]
    fn test_print_statistics() {
        let ingestor = test_ingestor();
        ingestor.add(1, &TestDocument::with_terms(&["cat", "dog"])).unwrap();
        ingestor.add(2, &TestDocument::with_terms(&["fish"])).unwrap();

        let mut out = Vec::new();
        ingestor.print_statistics(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Shard count: 1"));
        assert!(text.contains("Document count: 2"));
        assert!(text.contains("Posting count: 3"));
    }

    #[test]
    fn test_shutdown_drains() {
        let ingestor = test_ingestor();
        ingestor.add(1, &TestDocument::with_terms(&["cat"])).unwrap();
        ingestor.shutdown();
    }
}
