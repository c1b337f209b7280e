//! Copy-on-write buffer list and token-gated reclamation

use std::sync::Arc;
use std::time::Duration;

use bitgrid::{
    BasicTermTable, Document, DocumentDataSchema, DocumentHandle, Ingestor, IndexConfig,
    PostingCountShardDefinition, Term, TrackingBufferAllocator,
};

const SLICE_CAPACITY: u64 = 16;
const SLICE_BUFFER_SIZE: usize = 150;

struct TestDocument {
    term: Term,
}

impl TestDocument {
    fn new() -> Self {
        Self {
            term: Term::new("pelican", 0),
        }
    }
}

impl Document for TestDocument {
    fn posting_count(&self) -> usize {
        1
    }

    fn ingest(&self, handle: &DocumentHandle) -> bitgrid::Result<()> {
        handle.add_posting(&self.term);
        Ok(())
    }
}

fn create_test_ingestor() -> Ingestor {
    let config = IndexConfig {
        slice_buffer_size: SLICE_BUFFER_SIZE,
        max_buffers: None,
        collect_statistics: false,
    };
    Ingestor::new(
        &config,
        &DocumentDataSchema::new(),
        Arc::new(BasicTermTable::new(vec![3])),
        Arc::new(PostingCountShardDefinition::single_shard()),
        Arc::new(TrackingBufferAllocator::new(SLICE_BUFFER_SIZE)),
    )
    .unwrap()
}

#[test]
fn test_readers_keep_snapshot_until_tokens_retire() {
    let ingestor = create_test_ingestor();
    let document = TestDocument::new();

    // Three slices: two full, one with a single document.
    for id in 0..(2 * SLICE_CAPACITY + 1) {
        ingestor.add(id, &document).unwrap();
    }
    let shard = ingestor.shard(0);
    assert!(ingestor.recycler().wait_until_idle(Duration::from_secs(5)));

    // Two concurrent readers snapshot the current list.
    let first_token = ingestor.token_manager().request_token();
    let second_token = ingestor.token_manager().request_token();
    let snapshot = shard.slice_buffers();
    assert_eq!(snapshot.len(), 3);
    let retired_list = Arc::downgrade(&snapshot);

    // Fill the third slice and spill into a fourth; this publishes a new
    // list and retires the snapshot's vector.
    for id in (2 * SLICE_CAPACITY + 1)..(3 * SLICE_CAPACITY + 1) {
        ingestor.add(id, &document).unwrap();
    }
    assert_eq!(shard.slice_buffers().len(), 4);

    // Readers still see the three-slice list.
    assert_eq!(snapshot.len(), 3);
    drop(snapshot);

    // With both tokens outstanding, the recycler must keep the old vector.
    assert!(!ingestor.recycler().wait_until_idle(Duration::from_millis(200)));
    assert!(retired_list.upgrade().is_some());

    drop(first_token);
    assert!(!ingestor.recycler().wait_until_idle(Duration::from_millis(200)));
    assert!(retired_list.upgrade().is_some());

    drop(second_token);
    assert!(ingestor.recycler().wait_until_idle(Duration::from_secs(5)));
    assert!(retired_list.upgrade().is_none());

    // A fresh token observes the published four-slice list.
    let _token = ingestor.token_manager().request_token();
    assert_eq!(shard.slice_buffers().len(), 4);
}

#[test]
fn test_tokens_issued_after_publish_do_not_block() {
    let ingestor = create_test_ingestor();
    let document = TestDocument::new();

    ingestor.add(0, &document).unwrap();
    let shard = ingestor.shard(0);

    // Spill into a second slice, retiring the one-buffer list.
    for id in 1..=SLICE_CAPACITY {
        ingestor.add(id, &document).unwrap();
    }
    assert_eq!(shard.slice_buffers().len(), 2);

    // This token postdates the publish, so reclamation proceeds under it.
    let _late_token = ingestor.token_manager().request_token();
    assert!(ingestor.recycler().wait_until_idle(Duration::from_secs(5)));
}
