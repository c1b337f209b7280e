//! Core types for the bit-matrix index

use serde::{Deserialize, Serialize};
use std::fmt;

/// External document identifier
pub type DocId = u64;

/// Dense column index of a document within a slice (0..capacity)
pub type DocIndex = usize;

/// Shard identifier (shards partition the corpus by posting count)
pub type ShardId = usize;

/// Power-of-two compression factor of a row table.
/// At rank r, one row bit covers 2^r document columns.
pub type Rank = usize;

/// Rank-local row index within a row table
pub type RowIndex = usize;

/// Highest rank a term table may use
pub const MAX_RANK: Rank = 6;

/// Stream a term was drawn from (body, title, click stream, ...)
pub type StreamId = u8;

/// Slice identifier (monotonically increasing per shard).
///
/// The id of a slice is stored in the tail word of its buffer, so a buffer
/// seen through a reader snapshot can be resolved back to its slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SliceId(pub u64);

impl SliceId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slice_{}", self.0)
    }
}

/// Handle of a fact row (a single assertable bit per document)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactHandle(pub u64);

/// Identifies one row of the bit matrix: a rank and a rank-local index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowId {
    rank: Rank,
    index: RowIndex,
}

impl RowId {
    pub fn new(rank: Rank, index: RowIndex) -> Self {
        Self { rank, index }
    }

    pub fn rank(self) -> Rank {
        self.rank
    }

    pub fn index(self) -> RowIndex {
        self.index
    }
}

/// An opaque hashed term: hash of the token text plus the stream it came
/// from and the number of grams it spans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    raw_hash: u64,
    stream_id: StreamId,
    gram_size: u8,
}

impl Term {
    /// The distinguished term whose single rank-0 row marks documents as
    /// not soft-deleted.
    pub const DOCUMENT_ACTIVE: Term = Term {
        raw_hash: 0,
        stream_id: 0,
        gram_size: 0,
    };

    /// Hash a single token into a term
    pub fn new(text: &str, stream_id: StreamId) -> Self {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        Self {
            raw_hash: hasher.finish(),
            stream_id,
            gram_size: 1,
        }
    }

    /// Term carrying a fact handle; facts always span one gram on stream 0
    pub fn from_fact(fact: FactHandle) -> Self {
        Self {
            raw_hash: fact.0,
            stream_id: 0,
            gram_size: 1,
        }
    }

    pub fn raw_hash(self) -> u64 {
        self.raw_hash
    }

    pub fn stream_id(self) -> StreamId {
        self.stream_id
    }

    pub fn gram_size(self) -> u8 {
        self.gram_size
    }
}

/// Number of document columns covered by one byte of the deepest-rank row.
///
/// Slice capacities are multiples of this quantum so that every rank's rows
/// occupy a whole number of bytes.
pub fn rank0_quantum(max_rank: Rank) -> DocIndex {
    8 << max_rank
}

/// The rank-r row bit covering a document column
pub fn rank_column(index: DocIndex, rank: Rank) -> usize {
    index >> rank
}
