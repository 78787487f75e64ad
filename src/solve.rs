//! Per-row least-squares values for the approximate inverse
//!
//! For each local row `r` of `M` with pattern `J = (j_1, …, j_n)`, assemble
//! the dense submatrix `Â[p, k] = A(j_k, j_p)` from stored rows, solve
//! `Â·x = e_m` with `m` the position of `r` itself in `J`, scale by
//! `τ = 1/sqrt(|x_m|)`, and write `τ·x` as the row's values. The scaling
//! makes the lower-triangular `M` satisfy `Mᵀ·M ≈ A⁻¹`, so applying
//! `Mᵀ·(M·u)` is a symmetric operation even though only the lower triangle
//! is stored.
//!
//! The hash, slot list, and right-hand side are sized once off the longest
//! local row and reused; per-row cleanup replays the recorded slots.

use nalgebra::{Cholesky, DMatrix, DVector};
use tracing::error;

use crate::hash::IndexHash;
use crate::matrix::DistMatrix;
use crate::stored::StoredRows;

/// Failures of the per-row solves. All are fatal for the collective build.
#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    /// A row is absent from its own pattern, so no unit right-hand side
    /// exists for it.
    #[error("row {row} is absent from its own pattern")]
    PatternDefect {
        /// The defective global row.
        row: usize,
    },
    /// The assembled submatrix was not positive definite.
    #[error("submatrix for row {row} (dimension {dim}) is not positive definite")]
    NotSpd {
        /// The global row whose factorization failed.
        row: usize,
        /// Dimension of the assembled submatrix.
        dim: usize,
    },
    /// A pattern index has no stored row to assemble from.
    #[error("stored row {row} was never fetched")]
    MissingRow {
        /// The global row that should have been fetched.
        row: usize,
    },
}

/// Solve every local row of `m` against the stored rows of `a` and fill in
/// `m`'s values.
pub(crate) fn compute_values(
    a: &DistMatrix,
    stored: &StoredRows,
    m: &mut DistMatrix,
) -> Result<(), SolveError> {
    let maxlen = m.max_row_len();
    if maxlen == 0 {
        // This rank owns no rows (or only empty ones, which set_structure
        // never produces): nothing to solve.
        return Ok(());
    }
    let capacity = 4 * maxlen + 1;
    let mut hash = IndexHash::new(capacity);
    let mut local = vec![0usize; capacity];
    let mut slots: Vec<usize> = Vec::with_capacity(maxlen);

    for row in m.local_range() {
        let (ind, val) = m.row_mut(row);
        let n = ind.len();
        if n == 0 {
            return Err(SolveError::PatternDefect { row });
        }

        slots.clear();
        for (k, &j) in ind.iter().enumerate() {
            let (slot, _inserted) = hash.insert(j);
            local[slot] = k;
            slots.push(slot);
        }

        // Â column k holds the entries of stored row j_k that fall inside
        // the pattern.
        let mut ahat = DMatrix::<f64>::zeros(n, n);
        for (k, &j) in ind.iter().enumerate() {
            let (ind2, val2) = stored.get(a, j).ok_or(SolveError::MissingRow { row: j })?;
            for (&c, &v) in ind2.iter().zip(val2) {
                if let Some(slot) = hash.lookup(c) {
                    ahat[(local[slot], k)] = v;
                }
            }
        }

        let m_slot = hash
            .lookup(row)
            .ok_or(SolveError::PatternDefect { row })?;
        let rhs_at = local[m_slot];
        let mut rhs = DVector::<f64>::zeros(n);
        rhs[rhs_at] = 1.0;

        let leading: Vec<f64> = ahat.as_slice().iter().take(4).copied().collect();
        let chol = match Cholesky::new(ahat) {
            Some(chol) => chol,
            None => {
                error!(row, dim = n, ?leading, "Cholesky factorization failed");
                return Err(SolveError::NotSpd { row, dim: n });
            }
        };
        let x = chol.solve(&rhs);

        // x[rhs_at] = e_mᵀ Â⁻¹ e_m > 0 whenever the factorization succeeded.
        let tau = 1.0 / x[rhs_at].abs().sqrt();
        for (out, xi) in val.iter_mut().zip(x.iter()) {
            *out = tau * xi;
        }

        hash.reset(&slots);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::RowPartition;
    use crate::stored::StoredRows;

    fn single_rank(n: usize) -> RowPartition {
        RowPartition::even(n, 1)
    }

    #[test]
    fn isolated_row_gets_inverse_sqrt_diagonal() {
        let mut a = DistMatrix::new(single_rank(1), 0);
        a.set_row(0, vec![0], vec![4.0]);
        let stored = StoredRows::new(0..1);
        let mut m = DistMatrix::new(single_rank(1), 0);
        m.set_structure(0, vec![0]);
        compute_values(&a, &stored, &mut m).unwrap();
        assert!((m.row(0).1[0] - 0.5).abs() < 1e-15);
    }

    #[test]
    fn full_lower_pattern_reproduces_the_exact_inverse() {
        // A = [[2, -1], [-1, 2]]; with the full lower pattern, MᵀM = A⁻¹.
        let mut a = DistMatrix::new(single_rank(2), 0);
        a.set_row(0, vec![0, 1], vec![2.0, -1.0]);
        a.set_row(1, vec![0, 1], vec![-1.0, 2.0]);
        let stored = StoredRows::new(0..2);
        let mut m = DistMatrix::new(single_rank(2), 0);
        m.set_structure(0, vec![0]);
        m.set_structure(1, vec![0, 1]);
        compute_values(&a, &stored, &mut m).unwrap();

        // Dense M.
        let mut dm = [[0.0; 2]; 2];
        for row in 0..2 {
            let (ind, val) = m.row(row);
            for (&j, &v) in ind.iter().zip(val) {
                dm[row][j] = v;
            }
        }
        // MᵀM against A⁻¹ = 1/3 [[2, 1], [1, 2]].
        let inv = [[2.0 / 3.0, 1.0 / 3.0], [1.0 / 3.0, 2.0 / 3.0]];
        for i in 0..2 {
            for j in 0..2 {
                let got: f64 = (0..2).map(|k| dm[k][i] * dm[k][j]).sum();
                assert!(
                    (got - inv[i][j]).abs() < 1e-12,
                    "entry ({i}, {j}): {got} vs {}",
                    inv[i][j]
                );
            }
        }
    }

    #[test]
    fn indefinite_submatrix_reports_the_offending_row() {
        let mut a = DistMatrix::new(single_rank(2), 0);
        a.set_row(0, vec![0, 1], vec![1.0, 2.0]);
        a.set_row(1, vec![0, 1], vec![2.0, 1.0]);
        let stored = StoredRows::new(0..2);
        let mut m = DistMatrix::new(single_rank(2), 0);
        m.set_structure(0, vec![0]);
        m.set_structure(1, vec![0, 1]);
        match compute_values(&a, &stored, &mut m) {
            Err(SolveError::NotSpd { row: 1, dim: 2 }) => {}
            other => panic!("expected non-SPD failure on row 1, got {other:?}"),
        }
    }

    #[test]
    fn missing_row_in_pattern_is_a_defect() {
        let mut a = DistMatrix::new(single_rank(2), 0);
        a.set_row(0, vec![0], vec![1.0]);
        a.set_row(1, vec![1], vec![1.0]);
        let stored = StoredRows::new(0..2);
        let mut m = DistMatrix::new(single_rank(2), 0);
        m.set_structure(0, vec![0]);
        m.set_structure(1, vec![0]); // row 1 missing from its own pattern
        match compute_values(&a, &stored, &mut m) {
            Err(SolveError::PatternDefect { row: 1 }) => {}
            other => panic!("expected pattern defect on row 1, got {other:?}"),
        }
    }
}
