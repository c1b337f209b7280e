pub mod config;
pub mod error;
pub mod index;
pub mod query;

pub use config::IndexConfig;
pub use error::{BitGridError, Result};
pub use index::{
    BasicTermTable, DocId, Document, DocumentDataSchema, DocumentHandle, FileManager,
    FsFileManager, Ingestor, PoolBufferAllocator, PostingCountShardDefinition, Recycler, Shard,
    ShardDefinition, Slice, SliceBufferAllocator, Term, TermTable, Token, TokenManager,
    TrackingBufferAllocator,
};
pub use query::{QueryParser, StreamMap, TermMatchNode};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
