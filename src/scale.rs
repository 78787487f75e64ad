//! Symmetric diagonal scaling of the input matrix
//!
//! Pruning and threshold selection both work on `|s(i)·a_ij·s(j)|` with
//! `s(i) = 1/sqrt(|a_ii|)`, so that a unit-diagonal matrix is its own scaled
//! form. Column scales are needed for remote columns too; the vector is
//! small (one value per global row), so it is computed once from the local
//! diagonals and replicated everywhere with a single allgather.

use crate::comm::{Comm, CommError};
use crate::matrix::DistMatrix;

/// Replicated diagonal scaling vector, built once per input matrix.
pub struct DiagScale {
    scale: Vec<f64>,
}

impl DiagScale {
    /// Collective: compute local scales and replicate them across ranks.
    ///
    /// A row without a stored diagonal entry (or with a zero one) scales by
    /// 1.0 rather than dividing by zero; such a matrix will fail later in
    /// the SPD solve, which is the informative place to fail.
    pub fn new<C: Comm>(comm: &C, a: &DistMatrix) -> Result<Self, CommError> {
        let local: Vec<f64> = a
            .local_range()
            .map(|row| {
                let (ind, val) = a.row(row);
                let diag = ind
                    .iter()
                    .zip(val)
                    .find(|(&j, _)| j == row)
                    .map(|(_, &v)| v.abs())
                    .unwrap_or(0.0);
                if diag > 0.0 {
                    1.0 / diag.sqrt()
                } else {
                    1.0
                }
            })
            .collect();
        let scale = comm.allgather_concat(&local)?;
        Ok(Self { scale })
    }

    /// The scale of any global row.
    pub fn get(&self, row: usize) -> f64 {
        self.scale[row]
    }
}
