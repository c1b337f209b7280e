//! Named output streams for statistics side-files

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::index::types::ShardId;

/// Opens the output streams the ingestor writes statistics into
pub trait FileManager {
    fn document_length_histogram(&self) -> io::Result<Box<dyn Write>>;
    fn cumulative_term_counts(&self, shard: ShardId) -> io::Result<Box<dyn Write>>;
    fn doc_frequency_table(&self, shard: ShardId) -> io::Result<Box<dyn Write>>;
    fn indexed_idf_table(&self, shard: ShardId) -> io::Result<Box<dyn Write>>;
}

/// File manager writing side-files under one base directory
pub struct FsFileManager {
    base_dir: PathBuf,
}

impl FsFileManager {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> io::Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        })
    }

    fn open(&self, name: String) -> io::Result<Box<dyn Write>> {
        Ok(Box::new(File::create(self.base_dir.join(name))?))
    }
}

impl FileManager for FsFileManager {
    fn document_length_histogram(&self) -> io::Result<Box<dyn Write>> {
        self.open("document_length_histogram.json".to_string())
    }

    fn cumulative_term_counts(&self, shard: ShardId) -> io::Result<Box<dyn Write>> {
        self.open(format!("cumulative_term_counts_{}.csv", shard))
    }

    fn doc_frequency_table(&self, shard: ShardId) -> io::Result<Box<dyn Write>> {
        self.open(format!("doc_frequency_table_{}.csv", shard))
    }

    fn indexed_idf_table(&self, shard: ShardId) -> io::Result<Box<dyn Write>> {
        self.open(format!("indexed_idf_table_{}.csv", shard))
    }
}
