//! Per-row pruned index patterns of the input matrix
//!
//! A *pruned row* is the column-index list of a row of `A` restricted to
//! entries whose scaled magnitude reaches the threshold, with the diagonal
//! always kept. Local rows are computed at construction; rows owned by other
//! processes are inserted as exchange replies arrive.
//!
//! Backing storage is a list of immutable chunks. A reply body is adopted
//! whole as one chunk and each transported row is bound to a sub-range of
//! it, so no per-row copying happens on the receive path and — the invariant
//! downstream code relies on — a slice returned by [`PrunedRows::get`] stays
//! valid until the container is dropped.

use std::collections::HashMap;
use std::ops::Range;

use crate::matrix::DistMatrix;
use crate::scale::DiagScale;

#[derive(Clone, Copy)]
struct RowRef {
    chunk: usize,
    span: (usize, usize), // start, len
}

/// Pruned patterns for local rows of `A` plus every fetched remote row.
pub struct PrunedRows {
    chunks: Vec<Box<[usize]>>,
    rows: HashMap<usize, RowRef>,
}

impl PrunedRows {
    /// Prune the local block of `a`: row `i` keeps column `j` when
    /// `|s(i)·a_ij·s(j)| >= thresh`, and always keeps `j = i`.
    pub fn from_matrix(a: &DistMatrix, scale: &DiagScale, thresh: f64) -> Self {
        let mut data = Vec::with_capacity(a.local_nnz());
        let mut rows = HashMap::new();
        for row in a.local_range() {
            let (ind, val) = a.row(row);
            let start = data.len();
            let si = scale.get(row);
            let mut has_diag = false;
            for (&j, &v) in ind.iter().zip(val) {
                if j == row {
                    has_diag = true;
                    data.push(j);
                } else if (si * v * scale.get(j)).abs() >= thresh {
                    data.push(j);
                }
            }
            if !has_diag {
                data.push(row);
            }
            rows.insert(
                row,
                RowRef {
                    chunk: 0,
                    span: (start, data.len() - start),
                },
            );
        }
        Self {
            chunks: vec![data.into_boxed_slice()],
            rows,
        }
    }

    /// The pruned pattern of `row`, if it is local or has been fetched.
    pub fn get(&self, row: usize) -> Option<&[usize]> {
        self.rows.get(&row).map(|r| {
            let (start, len) = r.span;
            &self.chunks[r.chunk][start..start + len]
        })
    }

    /// Adopt a reply body as a new chunk and bind each `(row, range)` pair
    /// to its sub-slice. Ranges index into `data`.
    pub fn adopt_chunk(&mut self, data: Vec<usize>, bindings: Vec<(usize, Range<usize>)>) {
        let chunk = self.chunks.len();
        for (row, span) in bindings {
            debug_assert!(span.end <= data.len());
            self.rows.insert(
                row,
                RowRef {
                    chunk,
                    span: (span.start, span.len()),
                },
            );
        }
        self.chunks.push(data.into_boxed_slice());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::matrix::RowPartition;

    fn scaled_identityish() -> (DistMatrix, DiagScale) {
        let comms = LocalComm::universe(1);
        let mut a = DistMatrix::new(RowPartition::even(3, 1), 0);
        a.set_row(0, vec![0, 1, 2], vec![1.0, 0.5, 0.05]);
        a.set_row(1, vec![0, 1], vec![0.5, 1.0]);
        a.set_row(2, vec![0, 2], vec![0.05, 1.0]);
        let scale = DiagScale::new(&comms[0], &a).unwrap();
        (a, scale)
    }

    #[test]
    fn thresholding_keeps_diagonal_and_large_entries() {
        let (a, scale) = scaled_identityish();
        let pruned = PrunedRows::from_matrix(&a, &scale, 0.1);
        assert_eq!(pruned.get(0), Some(&[0, 1][..]));
        assert_eq!(pruned.get(1), Some(&[0, 1][..]));
        assert_eq!(pruned.get(2), Some(&[2][..]));
        assert_eq!(pruned.get(5), None);
    }

    #[test]
    fn zero_threshold_keeps_everything() {
        let (a, scale) = scaled_identityish();
        let pruned = PrunedRows::from_matrix(&a, &scale, 0.0);
        assert_eq!(pruned.get(0), Some(&[0, 1, 2][..]));
    }

    #[test]
    fn adopted_chunks_bind_rows_to_sub_slices() {
        let (a, scale) = scaled_identityish();
        let mut pruned = PrunedRows::from_matrix(&a, &scale, 0.1);
        // Body shaped like a two-row reply: [2, 10, 11, 2, 4 5, 1, 9].
        let body = vec![2, 10, 11, 2, 4, 5, 1, 9];
        pruned.adopt_chunk(body, vec![(10, 4..6), (11, 7..8)]);
        assert_eq!(pruned.get(10), Some(&[4, 5][..]));
        assert_eq!(pruned.get(11), Some(&[9][..]));
        // Local rows are untouched.
        assert_eq!(pruned.get(1), Some(&[0, 1][..]));
    }
}
