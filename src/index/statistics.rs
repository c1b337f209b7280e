//! Corpus statistics collected during ingestion
//!
//! The ingestor keeps a histogram of document lengths; each shard keeps a
//! term frequency builder feeding the doc-frequency and IDF side-files.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::index::types::Term;

/// Histogram of posting counts over all ingested documents
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DocumentLengthHistogram {
    buckets: BTreeMap<usize, u64>,
}

impl DocumentLengthHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&mut self, posting_count: usize) {
        *self.buckets.entry(posting_count).or_insert(0) += 1;
    }

    pub fn document_count(&self) -> u64 {
        self.buckets.values().sum()
    }

    /// Total postings across all recorded documents
    pub fn posting_count(&self) -> u64 {
        self.buckets
            .iter()
            .map(|(&length, &count)| length as u64 * count)
            .sum()
    }

    pub fn write(&self, out: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *out, self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writeln!(out)
    }
}

/// Accumulates per-term occurrence counts for one shard.
///
/// `on_document_enter` snapshots the distinct term count at each document
/// boundary so the cumulative-counts side-file can show vocabulary growth.
#[derive(Clone, Debug, Default)]
pub struct DocFrequencyTableBuilder {
    term_counts: HashMap<Term, u64>,
    document_count: u64,
    cumulative_term_counts: Vec<u64>,
}

impl DocFrequencyTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_document_enter(&mut self) {
        self.document_count += 1;
        self.cumulative_term_counts.push(self.term_counts.len() as u64);
    }

    pub fn on_term(&mut self, term: Term) {
        *self.term_counts.entry(term).or_insert(0) += 1;
    }

    pub fn document_count(&self) -> u64 {
        self.document_count
    }

    pub fn distinct_term_count(&self) -> usize {
        self.term_counts.len()
    }

    fn sorted_entries(&self) -> Vec<(Term, u64)> {
        let mut entries: Vec<_> = self.term_counts.iter().map(|(&t, &c)| (t, c)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.raw_hash().cmp(&b.0.raw_hash())));
        entries
    }

    /// One line per term: hash, stream, gram span, and the fraction of
    /// documents the term appeared in. Terms below `truncation_frequency`
    /// are omitted.
    pub fn write_frequencies(
        &self,
        out: &mut dyn Write,
        truncation_frequency: f64,
    ) -> io::Result<()> {
        for (term, count) in self.sorted_entries() {
            let frequency = if self.document_count == 0 {
                0.0
            } else {
                count as f64 / self.document_count as f64
            };
            if frequency < truncation_frequency {
                break;
            }
            writeln!(
                out,
                "{:016x},{},{},{:.6}",
                term.raw_hash(),
                term.stream_id(),
                term.gram_size(),
                frequency
            )?;
        }
        Ok(())
    }

    /// One line per document boundary: document ordinal and the distinct
    /// term count seen so far
    pub fn write_cumulative_term_counts(&self, out: &mut dyn Write) -> io::Result<()> {
        for (document, count) in self.cumulative_term_counts.iter().enumerate() {
            writeln!(out, "{},{}", document, count)?;
        }
        Ok(())
    }

    /// One line per term above `truncation_frequency`: hash and its inverse
    /// document frequency
    pub fn write_indexed_idf_table(
        &self,
        out: &mut dyn Write,
        truncation_frequency: f64,
    ) -> io::Result<()> {
        for (term, count) in self.sorted_entries() {
            if self.document_count == 0 {
                break;
            }
            let frequency = count as f64 / self.document_count as f64;
            if frequency < truncation_frequency {
                break;
            }
            let idf = (self.document_count as f64 / count as f64).log10();
            writeln!(out, "{:016x},{:.4}", term.raw_hash(), idf)?;
        }
        Ok(())
    }
}
