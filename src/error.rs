use thiserror::Error;

use crate::index::types::{DocId, FactHandle, SliceId};

/// Main error type for bitgrid operations
///
/// These are the recoverable conditions. Violations of internal counter or
/// layout invariants are not represented here; they go through [`fatal!`]
/// and halt the process.
#[derive(Error, Debug)]
pub enum BitGridError {
    #[error("document {0} is already in the index")]
    DuplicateDocument(DocId),

    #[error("document-active term must map to exactly one row, got {0}")]
    DocumentActiveRowCount(usize),

    #[error("document-active row must be rank 0, got rank {0}")]
    DocumentActiveRowRank(usize),

    #[error("fact {fact:?} must map to exactly one row, got {rows}")]
    FactRowCount { fact: FactHandle, rows: usize },

    #[error("{0} is not fully expired and cannot be recycled")]
    SliceNotExpired(SliceId),

    #[error("{0} expired more documents than were committed")]
    ExpireExceedsCommitted(SliceId),

    #[error("buffer of {0} not found in the shard buffer list")]
    BufferListMissingSlice(SliceId),

    #[error("buffer pool exhausted: all {max} buffers in use")]
    PoolExhausted { max: usize },

    #[error("allocator holds {pooled}-byte buffers, {requested} bytes requested")]
    BufferSizeMismatch { requested: usize, pooled: usize },

    #[error("parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("document ingestion failed: {0}")]
    Document(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bitgrid operations
pub type Result<T> = std::result::Result<T, BitGridError>;

impl BitGridError {
    /// Character offset of a parse error, if this is one
    pub fn parse_position(&self) -> Option<usize> {
        match self {
            BitGridError::Parse { position, .. } => Some(*position),
            _ => None,
        }
    }
}

/// Logs at error severity, then halts.
///
/// Used for states a correct caller cannot reach (counter underflow,
/// descriptor layout overflow). Recoverable conditions use [`BitGridError`].
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::tracing::error!($($arg)+);
        panic!($($arg)+)
    }};
}

/// Asserts an internal invariant, halting via [`fatal!`] when it does not hold.
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal!($($arg)+);
        }
    };
}
