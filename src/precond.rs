//! The preconditioner aggregate
//!
//! [`ParaSails`] owns what a build produces — the diagonal scaling and the
//! approximate inverse `M`; the pruned and stored row containers live only
//! for the phase that needs them — and exposes the build in the original
//! family's phases:
//!
//! 1. [`new`](ParaSails::new): capture the partition and build the scaling
//!    (collective).
//! 2. [`select_thresh`](ParaSails::select_thresh): optional, pick a pruning
//!    threshold from a parallel order statistic (collective).
//! 3. [`setup_pattern`](ParaSails::setup_pattern): prune, exchange pruned
//!    rows level by level, choose `M`'s lower-triangular structure.
//! 4. [`setup_values`](ParaSails::setup_values): exchange stored rows along
//!    the chosen pattern, solve the per-row SPD systems, fill `M`'s values.
//!    May be called again with the same structure when `A`'s values change.
//! 5. [`apply`](ParaSails::apply): `v = Mᵀ·(M·u)` with two collective
//!    matvecs, `u` preserved.
//!
//! **Precondition.** The per-level accounting of the pruned-row exchange
//! requires the pruned pattern of `A` to be structurally symmetric; feed
//! this builder structurally symmetric matrices.
//!
//! Every phase that can fail poisons the communicator before returning its
//! error, so a failure on one process surfaces on all of them instead of
//! deadlocking peers blocked in receives.

use std::time::Instant;

use rand::thread_rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::comm::Comm;
use crate::exchange::{exchange_pruned, exchange_stored};
use crate::levels::build_pattern;
use crate::matrix::{DistMatrix, RowPartition};
use crate::pruned::PrunedRows;
use crate::scale::DiagScale;
use crate::select::randomized_select;
use crate::solve::compute_values;
use crate::stored::StoredRows;
use crate::Error;

/// Build parameters, shaped for loading from a driver's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Pruning threshold; `None` selects one via the order statistic.
    pub thresh: Option<f64>,
    /// Pattern expansion levels.
    pub num_levels: usize,
    /// Quantile parameter for threshold selection.
    pub select_param: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            thresh: None,
            num_levels: 1,
            select_param: 0.75,
        }
    }
}

/// Figures reported by a completed pattern setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupStats {
    /// Threshold the pattern was pruned with.
    pub thresh: f64,
    /// Pattern expansion levels.
    pub num_levels: usize,
    /// Stored entries of the lower-triangular structure on this process.
    pub nnz: usize,
    /// `Σ len³` over local rows, the dense-solve cost estimate.
    pub solve_cost: u64,
    /// Request groups sent per pruned-exchange level.
    pub level_requests: Vec<usize>,
    /// Stored-row requests this process will answer.
    pub num_replies: usize,
}

/// Distributed sparse approximate-inverse preconditioner.
pub struct ParaSails<C: Comm> {
    comm: C,
    part: RowPartition,
    scale: DiagScale,
    m: DistMatrix,
    num_replies: usize,
    stats: Option<SetupStats>,
}

impl<C: Comm> ParaSails<C> {
    /// Collective: capture `a`'s row partition and build the diagonal
    /// scaling. `a` itself is not retained; later phases take it again, so
    /// a driver may re-supply a matrix with updated values.
    pub fn new(comm: C, a: &DistMatrix) -> Result<Self, Error> {
        let scale = DiagScale::new(&comm, a)?;
        let part = a.part().clone();
        let rank = comm.rank();
        Ok(Self {
            comm,
            part: part.clone(),
            scale,
            m: DistMatrix::new(part, rank),
            num_replies: 0,
            stats: None,
        })
    }

    fn escalate<T, E>(&self, result: Result<T, E>) -> Result<T, Error>
    where
        Error: From<E>,
    {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.comm.poison();
                Err(Error::from(e))
            }
        }
    }

    /// Collective: pick a pruning threshold such that roughly a
    /// `1 - param` fraction of the scaled entries survive.
    ///
    /// Per local row, the `(⌊len·param⌋ + 1)`-th smallest scaled magnitude
    /// is selected in expected linear time; the selections are summed across
    /// all processes and averaged over the global row count.
    pub fn select_thresh(&self, a: &DistMatrix, param: f64) -> Result<f64, Error> {
        let mut rng = thread_rng();
        let mut buffer: Vec<f64> = Vec::new();
        let mut local_sum = 0.0;
        for row in self.part.range(self.comm.rank()) {
            let (ind, val) = a.row(row);
            if ind.is_empty() {
                continue;
            }
            buffer.clear();
            let si = self.scale.get(row);
            buffer.extend(
                ind.iter()
                    .zip(val)
                    .map(|(&j, &v)| (si * v * self.scale.get(j)).abs()),
            );
            let k = ((buffer.len() as f64 * param) as usize + 1).min(buffer.len());
            local_sum += randomized_select(&mut buffer, k, &mut rng);
        }
        let sum = self.comm.allreduce_sum(local_sum)?;
        Ok(sum / self.part.num_rows() as f64)
    }

    /// Collective: prune `a` at `thresh`, fetch the pruned rows needed for
    /// `num_levels` of expansion, and choose `M`'s structure.
    ///
    /// Rebuilds from scratch every call, so repeating it with the same
    /// arguments reproduces the same structure.
    pub fn setup_pattern(
        &mut self,
        a: &DistMatrix,
        thresh: f64,
        num_levels: usize,
    ) -> Result<SetupStats, Error> {
        let started = Instant::now();
        let mut pruned = PrunedRows::from_matrix(a, &self.scale, thresh);
        debug!(
            thresh,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pruned rows created"
        );

        let started = Instant::now();
        let level_requests =
            self.escalate(exchange_pruned(&self.comm, &self.part, &mut pruned, num_levels))?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pruned rows exchanged"
        );

        let started = Instant::now();
        self.m = DistMatrix::new(self.part.clone(), self.comm.rank());
        let built = build_pattern(&self.part, &pruned, num_levels, &mut self.m);
        let pattern = self.escalate(built)?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "row patterns constructed"
        );

        self.num_replies = pattern.num_replies;
        let stats = SetupStats {
            thresh,
            num_levels,
            nnz: pattern.nnz,
            solve_cost: pattern.solve_cost,
            level_requests,
            num_replies: pattern.num_replies,
        };
        self.stats = Some(stats.clone());
        Ok(stats)
    }

    /// Collective: fetch the rows of `a` that `M`'s pattern references and
    /// solve for `M`'s values. Requires a prior
    /// [`setup_pattern`](Self::setup_pattern); may be repeated when `a`'s
    /// values change on the fixed structure.
    pub fn setup_values(&mut self, a: &DistMatrix) -> Result<(), Error> {
        if self.stats.is_none() {
            return Err(Error::PatternNotSetUp);
        }
        let started = Instant::now();
        let mut stored = StoredRows::new(self.part.range(self.comm.rank()));
        self.escalate(exchange_stored(
            &self.comm,
            &self.part,
            a,
            &self.m,
            &mut stored,
            self.num_replies,
        ))?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stored rows exchanged"
        );

        let started = Instant::now();
        let solved = compute_values(a, &stored, &mut self.m);
        self.escalate(solved)?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "values computed"
        );
        Ok(())
    }

    /// Run the whole build: select a threshold unless `params` fixes one,
    /// then set up the pattern and the values.
    pub fn setup(&mut self, a: &DistMatrix, params: &Params) -> Result<SetupStats, Error> {
        let thresh = match params.thresh {
            Some(t) => t,
            None => self.select_thresh(a, params.select_param)?,
        };
        let stats = self.setup_pattern(a, thresh, params.num_levels)?;
        self.setup_values(a)?;
        Ok(stats)
    }

    /// Collective: `v = Mᵀ·(M·u)`. `u` holds this process's slice of the
    /// input and is preserved; `v` must have the same length.
    pub fn apply(&self, u: &[f64], v: &mut [f64]) -> Result<(), Error> {
        if self.stats.is_none() {
            return Err(Error::PatternNotSetUp);
        }
        let w = self.m.matvec(&self.comm, u)?;
        let result = self.m.matvec_trans(&self.comm, &w)?;
        v.copy_from_slice(&result);
        Ok(())
    }

    /// The approximate inverse built so far.
    pub fn matrix(&self) -> &DistMatrix {
        &self.m
    }

    /// Figures from the last completed pattern setup.
    pub fn stats(&self) -> Option<&SetupStats> {
        self.stats.as_ref()
    }
}
