//! Per-row `(indices, values)` of the input matrix
//!
//! The value pass needs whole rows of `A` for every index in `M`'s pattern:
//! local rows come straight from the matrix block, remote rows arrive as
//! paired index/value reply bodies. As with pruned rows, a reply is adopted
//! whole — the index body as one chunk, the value body as its twin — and
//! rows bind to sub-ranges, so fetched slices are stable for the life of
//! the container.

use std::collections::HashMap;
use std::ops::Range;

use crate::matrix::DistMatrix;

#[derive(Clone, Copy)]
struct StoredRef {
    chunk: usize,
    ind_start: usize,
    val_start: usize,
    len: usize,
}

/// Rows of `A` reachable from this process: local ones by delegation to the
/// matrix block, external ones from adopted exchange replies.
pub struct StoredRows {
    local: Range<usize>,
    ind_chunks: Vec<Box<[usize]>>,
    val_chunks: Vec<Box<[f64]>>,
    rows: HashMap<usize, StoredRef>,
}

impl StoredRows {
    /// An empty container serving `local` rows by delegation.
    pub fn new(local: Range<usize>) -> Self {
        Self {
            local,
            ind_chunks: Vec::new(),
            val_chunks: Vec::new(),
            rows: HashMap::new(),
        }
    }

    /// The `(indices, values)` of `row`: local rows read through `a`,
    /// external rows must have been adopted first.
    pub fn get<'s>(&'s self, a: &'s DistMatrix, row: usize) -> Option<(&'s [usize], &'s [f64])> {
        if self.local.contains(&row) {
            return Some(a.row(row));
        }
        self.rows.get(&row).map(|r| {
            let ind = &self.ind_chunks[r.chunk][r.ind_start..r.ind_start + r.len];
            let val = &self.val_chunks[r.chunk][r.val_start..r.val_start + r.len];
            (ind, val)
        })
    }

    /// Adopt a paired reply: `ind_body` as an index chunk, `val_body` as the
    /// matching value chunk. `bindings` gives each row's range within
    /// `ind_body`; values are consumed in the same row order, flat.
    pub fn adopt_reply(
        &mut self,
        ind_body: Vec<usize>,
        val_body: Vec<f64>,
        bindings: Vec<(usize, Range<usize>)>,
    ) {
        let chunk = self.ind_chunks.len();
        let mut val_at = 0;
        for (row, span) in bindings {
            debug_assert!(span.end <= ind_body.len());
            self.rows.insert(
                row,
                StoredRef {
                    chunk,
                    ind_start: span.start,
                    val_start: val_at,
                    len: span.len(),
                },
            );
            val_at += span.len();
        }
        debug_assert!(val_at <= val_body.len());
        self.ind_chunks.push(ind_body.into_boxed_slice());
        self.val_chunks.push(val_body.into_boxed_slice());
    }
}
