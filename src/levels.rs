//! Per-row pattern construction for the approximate inverse
//!
//! After the pruned-row exchange, every pruned row within `num_levels` steps
//! of the local block is available locally, so each row's pattern can be
//! grown without further communication: start from the row's own pruned
//! pattern, then for each level merge the pruned rows of the indices the
//! previous level just added.
//!
//! Two things fall out of the full (untruncated) pattern before it is cut
//! to the lower triangle:
//!
//! - `num_replies`: the count of distinct processes owning pattern indices
//!   *above* the local block, unioned over all local rows. Rows below the
//!   block never generate incoming stored-row requests — a lower-triangular
//!   `M` only references downward — while each process above whose pattern
//!   reaches into this block will send exactly one request. This count is
//!   what lets the stored-row exchange answer the right number of requests
//!   without an extra collective.
//! - the nnz and `Σ len³` solve-cost figures reported for diagnostics.

use tracing::debug;

use crate::matrix::{DistMatrix, RowPartition};
use crate::pattern::{PatternError, RowPattern};
use crate::pruned::PrunedRows;

/// Failures while growing per-row patterns.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The per-row pattern outgrew its capacity.
    #[error(transparent)]
    Pattern(#[from] PatternError),
    /// A frontier index had no pruned row, meaning the level exchange did
    /// not deliver what the symmetry precondition promised.
    #[error("pruned row {row} was never delivered by the level exchange")]
    MissingRow {
        /// The global row whose pruned pattern is absent.
        row: usize,
    },
}

/// Figures produced by one pattern-construction pass.
#[derive(Debug, Clone, Copy)]
pub struct PatternStats {
    /// Requests this process will have to answer during the stored exchange.
    pub num_replies: usize,
    /// Stored entries in the lower-triangular structure of `M`.
    pub nnz: usize,
    /// `Σ len³` over local rows, the dense-solve cost estimate.
    pub solve_cost: u64,
}

/// Grow the level-`num_levels` pattern of every local row, store its
/// lower-triangular part as the structure of `m`, and count the distinct
/// remote owners that will request stored rows from this process.
pub(crate) fn build_pattern(
    part: &RowPartition,
    pruned: &PrunedRows,
    num_levels: usize,
    m: &mut DistMatrix,
) -> Result<PatternStats, BuildError> {
    let local = part.range(m.rank());
    let mut marker = vec![false; part.num_parts()];
    let mut stats = PatternStats {
        num_replies: 0,
        nnz: 0,
        solve_cost: 0,
    };

    let mut row_patt = RowPattern::new();
    for row in local.clone() {
        row_patt.reset();
        let seed = pruned.get(row).ok_or(BuildError::MissingRow { row })?;
        row_patt.merge(seed)?;

        for _level in 1..=num_levels {
            let frontier = row_patt.frontier().to_vec();
            for idx in frontier {
                let step = pruned.get(idx).ok_or(BuildError::MissingRow { row: idx })?;
                row_patt.merge(step)?;
            }
        }

        // Owners of pattern indices above the block are the processes whose
        // own patterns reach down into it; each will send one request.
        for &idx in row_patt.all() {
            if idx >= local.end {
                let pe = part.owner(idx);
                if !marker[pe] {
                    marker[pe] = true;
                    stats.num_replies += 1;
                }
            }
        }

        let mut lower: Vec<usize> = row_patt.all().iter().copied().filter(|&j| j <= row).collect();
        lower.sort_unstable();
        stats.nnz += lower.len();
        stats.solve_cost += (lower.len() as u64).pow(3);
        m.set_structure(row, lower);
    }

    debug!(
        nnz = stats.nnz,
        solve_cost = stats.solve_cost,
        num_replies = stats.num_replies,
        "approximate-inverse structure chosen"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Comm, LocalComm};
    use crate::scale::DiagScale;

    fn tridiag(n: usize) -> (DistMatrix, PrunedRows) {
        let comms = LocalComm::universe(1);
        let part = RowPartition::even(n, 1);
        let mut a = DistMatrix::new(part, 0);
        for row in 0..n {
            let mut ind = Vec::new();
            let mut val = Vec::new();
            if row > 0 {
                ind.push(row - 1);
                val.push(-1.0);
            }
            ind.push(row);
            val.push(2.0);
            if row + 1 < n {
                ind.push(row + 1);
                val.push(-1.0);
            }
            a.set_row(row, ind, val);
        }
        let scale = DiagScale::new(&comms[0], &a).unwrap();
        let pruned = PrunedRows::from_matrix(&a, &scale, 0.0);
        (a, pruned)
    }

    #[test]
    fn zero_levels_keeps_the_pruned_lower_pattern() {
        let (a, pruned) = tridiag(6);
        let mut m = DistMatrix::new(a.part().clone(), 0);
        let stats = build_pattern(a.part(), &pruned, 0, &mut m).unwrap();
        // Lower-bidiagonal: row r holds {r-1, r}.
        for row in 0usize..6 {
            let want: Vec<usize> = (row.saturating_sub(1)..=row).collect();
            assert_eq!(m.row(row).0, &want[..], "row {row}");
        }
        assert_eq!(stats.nnz, 11);
        assert_eq!(stats.num_replies, 0);
    }

    #[test]
    fn each_level_widens_the_band_by_one() {
        let (a, pruned) = tridiag(8);
        let mut m = DistMatrix::new(a.part().clone(), 0);
        build_pattern(a.part(), &pruned, 2, &mut m).unwrap();
        for row in 0usize..8 {
            let want: Vec<usize> = (row.saturating_sub(3)..=row).collect();
            assert_eq!(m.row(row).0, &want[..], "row {row}");
        }
    }

    #[test]
    fn num_replies_counts_distinct_owners_above_the_block() {
        // Two ranks over 8 tridiagonal rows: rank 0's level-1 pattern
        // reaches rows 4 and 5, both owned by rank 1.
        let n = 8;
        let part = RowPartition::even(n, 2);
        let comms = LocalComm::universe(2);
        let results: Vec<PatternStats> = std::thread::scope(|scope| {
            let joins: Vec<_> = comms
                .iter()
                .map(|comm| {
                    let part = part.clone();
                    scope.spawn(move || {
                        let rank = comm.rank();
                        let mut a = DistMatrix::new(part.clone(), rank);
                        for row in part.range(rank) {
                            let mut ind = Vec::new();
                            let mut val = Vec::new();
                            if row > 0 {
                                ind.push(row - 1);
                                val.push(-1.0);
                            }
                            ind.push(row);
                            val.push(2.0);
                            if row + 1 < n {
                                ind.push(row + 1);
                                val.push(-1.0);
                            }
                            a.set_row(row, ind, val);
                        }
                        let scale = DiagScale::new(comm, &a).unwrap();
                        let mut pruned = PrunedRows::from_matrix(&a, &scale, 0.0);
                        crate::exchange::exchange_pruned(comm, &part, &mut pruned, 1).unwrap();
                        let mut m = DistMatrix::new(part.clone(), rank);
                        build_pattern(&part, &pruned, 1, &mut m).unwrap()
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });
        // Rank 0 looks up into rank 1's block; rank 1 has nothing above it.
        assert_eq!(results[0].num_replies, 1);
        assert_eq!(results[1].num_replies, 0);
    }
}
