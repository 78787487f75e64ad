//! Distributed row-block matrix collaborator
//!
//! The preconditioner core consumes a deliberately small matrix contract:
//! contiguous row-block ownership, per-row `(indices, values)` access, row
//! allocation in two passes (structure first, values later), and the two
//! sparse matrix-vector products used by `apply`. [`RowPartition`] carries
//! the ownership map; [`DistMatrix`] stores one process's block.
//!
//! The matvecs are collective: every rank must call them together.
//! `matvec` reassembles the distributed input vector with one allgather;
//! `matvec_trans` scatters local contributions into a global scratch vector
//! and reduces it. Ghost-index bookkeeping is a production-container concern
//! that this collaborator deliberately does not take on.

use std::ops::Range;

use crate::comm::{Comm, CommError};

/// Contiguous row-block ownership map, shared verbatim by `A` and `M`.
///
/// Stored as an offsets array `starts[0..=P]`: process `p` owns global rows
/// `starts[p]..starts[p+1]`. A process may own an empty block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPartition {
    starts: Vec<usize>,
}

impl RowPartition {
    /// Build a partition from its offsets array. `starts` must begin at 0,
    /// be nondecreasing, and have one entry per process plus the total.
    pub fn new(starts: Vec<usize>) -> Self {
        assert!(starts.len() >= 2, "partition needs at least one process");
        assert_eq!(starts[0], 0, "partition must start at row 0");
        assert!(
            starts.windows(2).all(|w| w[0] <= w[1]),
            "partition offsets must be nondecreasing"
        );
        Self { starts }
    }

    /// Split `num_rows` rows into `num_parts` blocks of near-equal size,
    /// front-loading the remainder.
    pub fn even(num_rows: usize, num_parts: usize) -> Self {
        assert!(num_parts > 0);
        let base = num_rows / num_parts;
        let extra = num_rows % num_parts;
        let mut starts = Vec::with_capacity(num_parts + 1);
        let mut at = 0;
        starts.push(0);
        for p in 0..num_parts {
            at += base + usize::from(p < extra);
            starts.push(at);
        }
        Self { starts }
    }

    /// Number of processes.
    pub fn num_parts(&self) -> usize {
        self.starts.len() - 1
    }

    /// Total number of global rows.
    pub fn num_rows(&self) -> usize {
        self.starts[self.starts.len() - 1]
    }

    /// Global rows owned by process `pe`.
    pub fn range(&self, pe: usize) -> Range<usize> {
        self.starts[pe]..self.starts[pe + 1]
    }

    /// The process owning global row `row`.
    ///
    /// Because blocks are contiguous, this is a partition point; a run of
    /// sorted indices therefore maps to a run of owners.
    pub fn owner(&self, row: usize) -> usize {
        debug_assert!(row < self.num_rows(), "row {row} outside the partition");
        self.starts.partition_point(|&s| s <= row) - 1
    }
}

struct MatRow {
    ind: Vec<usize>,
    val: Vec<f64>,
}

/// One process's block of a distributed sparse matrix.
pub struct DistMatrix {
    part: RowPartition,
    rank: usize,
    rows: Vec<MatRow>,
}

impl DistMatrix {
    /// An empty local block for `rank` under `part`. Rows start with no
    /// entries and are filled by [`set_row`](Self::set_row) or
    /// [`set_structure`](Self::set_structure).
    pub fn new(part: RowPartition, rank: usize) -> Self {
        let local = part.range(rank);
        let rows = local.map(|_| MatRow { ind: Vec::new(), val: Vec::new() }).collect();
        Self { part, rank, rows }
    }

    /// The ownership map shared by every rank's block.
    pub fn part(&self) -> &RowPartition {
        &self.part
    }

    /// The rank owning this block.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Global rows stored locally.
    pub fn local_range(&self) -> Range<usize> {
        self.part.range(self.rank)
    }

    fn local_index(&self, row: usize) -> usize {
        let local = self.local_range();
        debug_assert!(local.contains(&row), "row {row} is not local to rank {}", self.rank);
        row - local.start
    }

    /// Set indices and values of a local row in one shot.
    pub fn set_row(&mut self, row: usize, ind: Vec<usize>, val: Vec<f64>) {
        assert_eq!(ind.len(), val.len(), "row {row}: index/value length mismatch");
        let at = self.local_index(row);
        self.rows[at] = MatRow { ind, val };
    }

    /// Allocate the structure of a local row; values are zeroed and filled
    /// by a later pass through [`row_mut`](Self::row_mut).
    pub fn set_structure(&mut self, row: usize, ind: Vec<usize>) {
        let at = self.local_index(row);
        let val = vec![0.0; ind.len()];
        self.rows[at] = MatRow { ind, val };
    }

    /// Indices and values of a local row.
    pub fn row(&self, row: usize) -> (&[usize], &[f64]) {
        let at = self.local_index(row);
        let r = &self.rows[at];
        (&r.ind, &r.val)
    }

    /// Indices (read-only) and values (writable) of a local row.
    pub fn row_mut(&mut self, row: usize) -> (&[usize], &mut [f64]) {
        let at = self.local_index(row);
        let r = &mut self.rows[at];
        (&r.ind, &mut r.val)
    }

    /// Length of the longest local row.
    pub fn max_row_len(&self) -> usize {
        self.rows.iter().map(|r| r.ind.len()).max().unwrap_or(0)
    }

    /// Number of stored entries in the local block.
    pub fn local_nnz(&self) -> usize {
        self.rows.iter().map(|r| r.ind.len()).sum()
    }

    /// Collective `v = self · u`. `u` holds this rank's slice of the input
    /// vector and is preserved; the result has the same local length.
    pub fn matvec<C: Comm>(&self, comm: &C, u: &[f64]) -> Result<Vec<f64>, CommError> {
        let local = self.local_range();
        assert_eq!(u.len(), local.len(), "matvec input has wrong local length");
        let global = comm.allgather_concat(u)?;
        Ok(self
            .rows
            .iter()
            .map(|r| r.ind.iter().zip(&r.val).map(|(&j, &v)| v * global[j]).sum())
            .collect())
    }

    /// Collective `v = selfᵀ · u`. `u` holds this rank's slice of the input
    /// vector and is preserved; the result has the same local length.
    pub fn matvec_trans<C: Comm>(&self, comm: &C, u: &[f64]) -> Result<Vec<f64>, CommError> {
        let local = self.local_range();
        assert_eq!(u.len(), local.len(), "matvec_trans input has wrong local length");
        let mut scratch = vec![0.0; self.part.num_rows()];
        for (r, &ui) in self.rows.iter().zip(u) {
            for (&j, &v) in r.ind.iter().zip(&r.val) {
                scratch[j] += v * ui;
            }
        }
        let reduced = comm.allreduce_sum_vec(&scratch)?;
        Ok(reduced[local].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use std::thread;

    #[test]
    fn even_partition_front_loads_remainder() {
        let part = RowPartition::even(10, 3);
        assert_eq!(part.range(0), 0..4);
        assert_eq!(part.range(1), 4..7);
        assert_eq!(part.range(2), 7..10);
        assert_eq!(part.num_rows(), 10);
    }

    #[test]
    fn owner_handles_empty_blocks() {
        let part = RowPartition::new(vec![0, 4, 4, 8]);
        assert_eq!(part.owner(0), 0);
        assert_eq!(part.owner(3), 0);
        assert_eq!(part.owner(4), 2);
        assert_eq!(part.owner(7), 2);
    }

    #[test]
    fn structure_then_values_round_trips() {
        let part = RowPartition::even(4, 1);
        let mut m = DistMatrix::new(part, 0);
        m.set_structure(2, vec![0, 2]);
        {
            let (ind, val) = m.row_mut(2);
            assert_eq!(ind, &[0, 2]);
            val[0] = 0.25;
            val[1] = -1.0;
        }
        assert_eq!(m.row(2), (&[0usize, 2][..], &[0.25, -1.0][..]));
        assert_eq!(m.max_row_len(), 2);
        assert_eq!(m.local_nnz(), 2);
    }

    /// 2-rank matvec and transpose-matvec against a dense oracle.
    #[test]
    fn matvecs_match_dense_oracle() {
        // A = [[2, -1, 0, 0], [-1, 2, -1, 0], [0, -1, 2, -1], [0, 0, -1, 2]]
        let dense = [
            [2.0, -1.0, 0.0, 0.0],
            [-1.0, 2.0, -1.0, 0.0],
            [0.0, -1.0, 2.0, -1.0],
            [0.0, 0.0, -1.0, 2.0],
        ];
        let u_global = [1.0, -2.0, 0.5, 3.0];
        let part = RowPartition::even(4, 2);
        let comms = LocalComm::universe(2);

        let results: Vec<(Vec<f64>, Vec<f64>)> = thread::scope(|scope| {
            let joins: Vec<_> = comms
                .iter()
                .map(|comm| {
                    let part = part.clone();
                    scope.spawn(move || {
                        let rank = comm.rank();
                        let mut a = DistMatrix::new(part.clone(), rank);
                        for row in part.range(rank) {
                            let (ind, val): (Vec<usize>, Vec<f64>) = (0..4)
                                .filter(|&j| dense[row][j] != 0.0)
                                .map(|j| (j, dense[row][j]))
                                .unzip();
                            a.set_row(row, ind, val);
                        }
                        let local = part.range(rank);
                        let u = &u_global[local.clone()];
                        (a.matvec(comm, u).unwrap(), a.matvec_trans(comm, u).unwrap())
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });

        let got_mv: Vec<f64> = results.iter().flat_map(|(mv, _)| mv.clone()).collect();
        let got_tr: Vec<f64> = results.iter().flat_map(|(_, tr)| tr.clone()).collect();
        for i in 0..4 {
            let want: f64 = (0..4).map(|j| dense[i][j] * u_global[j]).sum();
            let want_t: f64 = (0..4).map(|j| dense[j][i] * u_global[j]).sum();
            assert!((got_mv[i] - want).abs() < 1e-12);
            assert!((got_tr[i] - want_t).abs() < 1e-12);
        }
    }
}
