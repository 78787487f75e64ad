//! Crate root: public surface, shared error taxonomy, and build-wide invariants
//!
//! `parasails` builds a distributed sparse approximate inverse of an SPD
//! matrix `A`. Given `A` partitioned into contiguous row blocks across `P`
//! processes, it computes a lower-triangular sparse matrix `M`, stored in the
//! same row layout, such that `Mᵀ·M ≈ A⁻¹` in a Frobenius-norm least-squares
//! sense restricted to a level-`L` sparsity pattern of the pruned graph of
//! `A`. The preconditioner is applied as `v = Mᵀ·(M·u)` — two sparse
//! matrix-vector products.
//!
//! ## Invariants
//!
//! - **SPMD, no intra-process threads.** Every process executes the same
//!   build; the only suspension points are message-passing calls on the
//!   [`Comm`] contract. Within a process all work is sequential.
//! - **Structural symmetry.** The per-level request/reply accounting of the
//!   pruned-row exchange assumes the pruned pattern of `A` is structurally
//!   symmetric: the number of requests a process sends per level equals the
//!   number it receives. This is a correctness precondition, not something
//!   the exchange can detect locally.
//! - **Slice stability.** [`pruned::PrunedRows`] and [`stored::StoredRows`]
//!   hand out slices that stay valid until the container is dropped; backing
//!   storage is a list of fixed chunks that never move.
//! - **Send-buffer lifetime.** Every non-blocking send takes ownership of its
//!   buffer, so a buffer can never be reclaimed before the transport is done
//!   with it; `waitall` only observes completion.
//! - **Fatal errors are collective.** A numeric or protocol failure on one
//!   process poisons the communicator before the error is returned, so peers
//!   blocked in receives fail with a transport error instead of hanging.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Message-passing contract and the in-process transport.
pub mod comm;
/// Request/reply protocol fetching remote pruned and stored rows.
pub mod exchange;
/// Small open-address hash mapping global indices to dense slots.
pub mod hash;
/// Per-row level-`L` pattern construction and `M` structure allocation.
pub mod levels;
/// Distributed row-block matrix collaborator (row storage, matvecs).
pub mod matrix;
/// Level-aware merging set of column indices with a consumable frontier.
pub mod pattern;
/// The preconditioner aggregate and its build/apply entry points.
pub mod precond;
/// Per-row pruned index patterns of `A`, local and fetched.
pub mod pruned;
/// Diagonal scaling `s(i) = 1/sqrt(|a_ii|)`, replicated across processes.
pub mod scale;
/// Randomized order statistics for threshold selection.
pub mod select;
/// Per-row dense SPD assembly and Cholesky solve.
pub mod solve;
/// Per-row `(indices, values)` of `A`, local and fetched.
pub mod stored;

pub use comm::{Comm, CommError, Incoming, LocalComm, SendHandle, Tag};
pub use exchange::ExchangeError;
pub use levels::BuildError;
pub use matrix::{DistMatrix, RowPartition};
pub use pattern::{PatternError, RowPattern};
pub use precond::{ParaSails, Params, SetupStats};
pub use scale::DiagScale;
pub use solve::SolveError;

/// Errors surfaced by the public build and apply entry points.
///
/// Every variant is fatal for the collective build: by the time a caller sees
/// one, the failing process has already poisoned the communicator (see the
/// crate-level invariants), so there is no per-row recovery path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying transport failed or a peer aborted the collective.
    #[error(transparent)]
    Comm(#[from] CommError),
    /// A merging pattern overflowed its configured capacity.
    #[error(transparent)]
    Pattern(#[from] PatternError),
    /// The row exchange received a malformed or inconsistent reply.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    /// Pattern construction needed a row the exchange never delivered.
    #[error(transparent)]
    Build(#[from] BuildError),
    /// A per-row least-squares solve failed.
    #[error(transparent)]
    Solve(#[from] SolveError),
    /// `setup_values` was called before `setup_pattern` chose a structure.
    #[error("no pattern has been set up for the approximate inverse")]
    PatternNotSetUp,
}
