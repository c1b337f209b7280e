//! Term table contract
//!
//! The term table is a read-only oracle mapping a term to the rows its
//! signature touches. Shards consult it for posting writes and to find the
//! document-active row; they never mutate it.

use crate::index::types::{Rank, RowId, Term, MAX_RANK};

/// Read-only map from terms to bit-matrix rows
pub trait TermTable: Send + Sync {
    /// The ordered rows a term's signature touches
    fn row_ids(&self, term: &Term) -> Vec<RowId>;

    /// The distinguished term whose single rank-0 row is the
    /// soft-deleted-documents row
    fn document_active_term(&self) -> Term;

    /// Number of rows at a rank
    fn total_row_count(&self, rank: Rank) -> usize;

    /// Highest rank with any rows
    fn max_rank_used(&self) -> Rank;
}

/// Term table deriving row assignments from the term hash.
///
/// Row 0 of rank 0 is reserved for the document-active term. Every other
/// term gets `rows_per_term` hashed rank-0 rows plus one row in each higher
/// rank that has rows configured.
pub struct BasicTermTable {
    rows_per_rank: Vec<usize>,
    rows_per_term: usize,
}

impl BasicTermTable {
    pub fn new(rows_per_rank: Vec<usize>) -> Self {
        crate::fatal_assert!(
            rows_per_rank.len() <= MAX_RANK + 1,
            "row counts given for {} ranks, at most {} supported",
            rows_per_rank.len(),
            MAX_RANK + 1
        );
        Self {
            rows_per_rank,
            rows_per_term: 2,
        }
    }

    pub fn with_rows_per_term(mut self, rows_per_term: usize) -> Self {
        self.rows_per_term = rows_per_term;
        self
    }

    fn mix(hash: u64, round: u32) -> u64 {
        hash.wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .rotate_left(round * 11)
            .wrapping_add(round as u64)
    }
}

impl TermTable for BasicTermTable {
    fn row_ids(&self, term: &Term) -> Vec<RowId> {
        if *term == Term::DOCUMENT_ACTIVE {
            return vec![RowId::new(0, 0)];
        }

        let mut rows = Vec::new();
        let rank0_rows = self.total_row_count(0);
        if rank0_rows > 1 {
            for round in 0..self.rows_per_term {
                let mixed = Self::mix(term.raw_hash(), round as u32);
                rows.push(RowId::new(0, 1 + mixed as usize % (rank0_rows - 1)));
            }
        }
        for (rank, &count) in self.rows_per_rank.iter().enumerate().skip(1) {
            if count > 0 {
                let mixed = term.raw_hash().rotate_right(rank as u32 * 7);
                rows.push(RowId::new(rank, mixed as usize % count));
            }
        }
        rows
    }

    fn document_active_term(&self) -> Term {
        Term::DOCUMENT_ACTIVE
    }

    fn total_row_count(&self, rank: Rank) -> usize {
        self.rows_per_rank.get(rank).copied().unwrap_or(0)
    }

    fn max_rank_used(&self) -> Rank {
        self.rows_per_rank
            .iter()
            .rposition(|&count| count > 0)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_active_is_single_rank0_row() {
        let table = BasicTermTable::new(vec![8, 4]);
        let rows = table.row_ids(&table.document_active_term());
        assert_eq!(rows, vec![RowId::new(0, 0)]);
    }

    #[test]
    fn test_row_assignment_is_deterministic_and_in_bounds() {
        let table = BasicTermTable::new(vec![8, 4]).with_rows_per_term(3);
        let term = Term::new("ostrich", 0);

        let rows = table.row_ids(&term);
        assert_eq!(rows, table.row_ids(&term));
        // Three hashed rank-0 rows plus one rank-1 row.
        assert_eq!(rows.len(), 4);
        for row in &rows {
            assert!(row.index() < table.total_row_count(row.rank()));
            // Row 0 of rank 0 stays reserved.
            if row.rank() == 0 {
                assert_ne!(row.index(), 0);
            }
        }
    }

    #[test]
    fn test_max_rank_used() {
        assert_eq!(BasicTermTable::new(vec![8]).max_rank_used(), 0);
        assert_eq!(BasicTermTable::new(vec![8, 0, 2]).max_rank_used(), 2);
        assert_eq!(BasicTermTable::new(vec![8, 4, 0]).max_rank_used(), 1);
    }

    #[test]
    fn test_row_counts() {
        let table = BasicTermTable::new(vec![8, 4]);
        assert_eq!(table.total_row_count(0), 8);
        assert_eq!(table.total_row_count(1), 4);
        assert_eq!(table.total_row_count(5), 0);
    }
}
