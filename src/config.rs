use serde::{Deserialize, Serialize};

/// Index configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Size in bytes of every slice buffer
    pub slice_buffer_size: usize,
    /// Cap on the number of pooled buffers (None = unbounded)
    pub max_buffers: Option<usize>,
    /// Collect per-shard term frequency statistics during ingestion
    pub collect_statistics: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            // 1MB slices
            slice_buffer_size: 1 << 20,
            max_buffers: None,
            collect_statistics: true,
        }
    }
}
