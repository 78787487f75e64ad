//! Message-passing contract and the in-process transport
//!
//! The build is SPMD over `P` processes. Everything the core needs from the
//! underlying transport is captured by the [`Comm`] trait:
//!
//! - tagged, non-blocking point-to-point sends whose buffers are *moved into*
//!   the transport (`isend_ints` / `isend_vals`),
//! - an any-source [`probe`](Comm::probe) by tag, because reply sizes are not
//!   known ahead of the receive,
//! - blocking receives by `(source, tag)`, FIFO within each such pair,
//! - `waitall` over retained send handles,
//! - an allgather collective (sums and concatenations are built on top),
//! - [`poison`](Comm::poison), the collective-abort escalation hook.
//!
//! [`LocalComm`] is the in-process implementation: `P` ranks sharing a set of
//! mailboxes, one OS thread per rank. It exists so the whole distributed
//! build can be exercised in ordinary tests; a production deployment would
//! implement [`Comm`] over its own transport.
//!
//! Ordering guarantees relied upon elsewhere: messages between one (sender,
//! receiver, tag) triple are FIFO, and a reply pair posted as REPI-then-REPV
//! is received as REPI-then-REPV from that source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Message tags distinguishing the three protocol message kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Tag {
    /// A sorted list of global row indices the sender wants from the receiver.
    Req = 222,
    /// Reply header + index bodies: `[n, row_1..row_n, len_1, ind..., ...]`.
    RepInd = 223,
    /// Reply values, flat, in the same row order as the paired `RepInd`.
    RepVal = 224,
}

/// Transport-level failures. These surface unchanged through the build.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// A peer poisoned the communicator; the collective is aborting.
    #[error("collective aborted by a peer process")]
    Aborted,
    /// A message carried the wrong payload kind for its tag.
    #[error("message from rank {rank} on tag {tag:?} has unexpected payload kind")]
    PayloadKind {
        /// Rank the offending message came from.
        rank: usize,
        /// Tag the message was received under.
        tag: Tag,
    },
}

/// Result of a successful probe: who sent the pending message and how long it is.
#[derive(Debug, Clone, Copy)]
pub struct Incoming {
    /// Rank of the sending process.
    pub source: usize,
    /// Number of payload elements in the pending message.
    pub count: usize,
}

/// Handle of a non-blocking send, to be passed to [`Comm::waitall`].
///
/// The send buffer was moved into the transport at `isend` time, so dropping
/// a handle never invalidates an in-flight buffer; fire-and-forget sends
/// simply drop it.
#[derive(Debug)]
pub struct SendHandle(());

/// The message-passing operations consumed by the preconditioner build.
pub trait Comm {
    /// Rank of this process in `0..size()`.
    fn rank(&self) -> usize;
    /// Number of processes in the collective.
    fn size(&self) -> usize;
    /// A second handle onto the same collective, for a collaborator that
    /// wants to hold its own reference.
    fn dup(&self) -> Self
    where
        Self: Sized;

    /// Non-blocking send of an integer payload. Ownership of the buffer moves
    /// into the transport.
    fn isend_ints(&self, dest: usize, tag: Tag, body: Vec<usize>) -> Result<SendHandle, CommError>;
    /// Non-blocking send of a floating-point payload.
    fn isend_vals(&self, dest: usize, tag: Tag, body: Vec<f64>) -> Result<SendHandle, CommError>;

    /// Block until a message with `tag` is pending from any source.
    fn probe(&self, tag: Tag) -> Result<Incoming, CommError>;
    /// Receive the earliest pending integer message from `(source, tag)`.
    fn recv_ints(&self, source: usize, tag: Tag) -> Result<Vec<usize>, CommError>;
    /// Receive the earliest pending floating-point message from `(source, tag)`.
    fn recv_vals(&self, source: usize, tag: Tag) -> Result<Vec<f64>, CommError>;

    /// Block until every listed send has completed.
    fn waitall(&self, handles: Vec<SendHandle>) -> Result<(), CommError>;

    /// Collective: every rank contributes a vector, every rank receives all
    /// contributions indexed by rank.
    fn allgather_vals(&self, mine: Vec<f64>) -> Result<Vec<Vec<f64>>, CommError>;

    /// Mark the collective as failed and wake every peer blocked in a
    /// transport call with [`CommError::Aborted`].
    fn poison(&self);

    /// Collective sum of one scalar per rank.
    fn allreduce_sum(&self, x: f64) -> Result<f64, CommError> {
        Ok(self.allgather_vals(vec![x])?.iter().map(|part| part[0]).sum())
    }

    /// Collective elementwise sum of equal-length vectors.
    fn allreduce_sum_vec(&self, xs: &[f64]) -> Result<Vec<f64>, CommError> {
        let parts = self.allgather_vals(xs.to_vec())?;
        let mut out = vec![0.0; xs.len()];
        for part in &parts {
            for (o, v) in out.iter_mut().zip(part) {
                *o += v;
            }
        }
        Ok(out)
    }

    /// Collective concatenation in rank order. With contiguous row blocks
    /// this reassembles a distributed vector into its global form.
    fn allgather_concat(&self, mine: &[f64]) -> Result<Vec<f64>, CommError> {
        Ok(self
            .allgather_vals(mine.to_vec())?
            .into_iter()
            .flatten()
            .collect())
    }
}

// ============================================================================
// In-process transport
// ============================================================================

enum Body {
    Ints(Vec<usize>),
    Vals(Vec<f64>),
}

impl Body {
    fn len(&self) -> usize {
        match self {
            Body::Ints(v) => v.len(),
            Body::Vals(v) => v.len(),
        }
    }
}

struct Envelope {
    source: usize,
    tag: Tag,
    body: Body,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    ready: Condvar,
}

struct GatherState {
    epoch: u64,
    arrived: usize,
    parts: Vec<Option<Vec<f64>>>,
    result: Vec<Vec<f64>>,
}

struct Shared {
    size: usize,
    mailboxes: Vec<Mailbox>,
    gather: Mutex<GatherState>,
    gathered: Condvar,
    poisoned: AtomicBool,
}

/// In-process [`Comm`] implementation: one value per rank, all ranks sharing
/// a mailbox set. Delivery happens at `isend` time, so send handles complete
/// immediately; FIFO per (source, tag) follows from each mailbox being a
/// single queue scanned front to back.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalComm {
    /// Create the communicators of a `size`-rank collective. Element `p` of
    /// the returned vector is the handle for rank `p`; hand one to each
    /// thread of the SPMD program.
    pub fn universe(size: usize) -> Vec<LocalComm> {
        assert!(size > 0, "a collective needs at least one rank");
        let shared = Arc::new(Shared {
            size,
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            gather: Mutex::new(GatherState {
                epoch: 0,
                arrived: 0,
                parts: vec![None; size],
                result: Vec::new(),
            }),
            gathered: Condvar::new(),
            poisoned: AtomicBool::new(false),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn poisoned(&self) -> bool {
        self.shared.poisoned.load(Ordering::SeqCst)
    }

    fn deliver(&self, dest: usize, tag: Tag, body: Body) -> Result<SendHandle, CommError> {
        if self.poisoned() {
            return Err(CommError::Aborted);
        }
        let mailbox = &self.shared.mailboxes[dest];
        mailbox.queue.lock().push_back(Envelope {
            source: self.rank,
            tag,
            body,
        });
        mailbox.ready.notify_all();
        Ok(SendHandle(()))
    }

    fn take_matching(
        &self,
        source: usize,
        tag: Tag,
    ) -> Result<Body, CommError> {
        let mailbox = &self.shared.mailboxes[self.rank];
        let mut queue = mailbox.queue.lock();
        loop {
            if self.poisoned() {
                return Err(CommError::Aborted);
            }
            if let Some(pos) = queue
                .iter()
                .position(|env| env.source == source && env.tag == tag)
            {
                if let Some(env) = queue.remove(pos) {
                    return Ok(env.body);
                }
            }
            mailbox.ready.wait(&mut queue);
        }
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn dup(&self) -> Self {
        self.clone()
    }

    fn isend_ints(&self, dest: usize, tag: Tag, body: Vec<usize>) -> Result<SendHandle, CommError> {
        self.deliver(dest, tag, Body::Ints(body))
    }

    fn isend_vals(&self, dest: usize, tag: Tag, body: Vec<f64>) -> Result<SendHandle, CommError> {
        self.deliver(dest, tag, Body::Vals(body))
    }

    fn probe(&self, tag: Tag) -> Result<Incoming, CommError> {
        let mailbox = &self.shared.mailboxes[self.rank];
        let mut queue = mailbox.queue.lock();
        loop {
            if self.poisoned() {
                return Err(CommError::Aborted);
            }
            if let Some(env) = queue.iter().find(|env| env.tag == tag) {
                return Ok(Incoming {
                    source: env.source,
                    count: env.body.len(),
                });
            }
            mailbox.ready.wait(&mut queue);
        }
    }

    fn recv_ints(&self, source: usize, tag: Tag) -> Result<Vec<usize>, CommError> {
        match self.take_matching(source, tag)? {
            Body::Ints(v) => Ok(v),
            Body::Vals(_) => Err(CommError::PayloadKind { rank: source, tag }),
        }
    }

    fn recv_vals(&self, source: usize, tag: Tag) -> Result<Vec<f64>, CommError> {
        match self.take_matching(source, tag)? {
            Body::Vals(v) => Ok(v),
            Body::Ints(_) => Err(CommError::PayloadKind { rank: source, tag }),
        }
    }

    fn waitall(&self, handles: Vec<SendHandle>) -> Result<(), CommError> {
        // Delivery is synchronous, so the handles are already complete.
        drop(handles);
        if self.poisoned() {
            return Err(CommError::Aborted);
        }
        Ok(())
    }

    fn allgather_vals(&self, mine: Vec<f64>) -> Result<Vec<Vec<f64>>, CommError> {
        let shared = &self.shared;
        let mut gather = shared.gather.lock();
        if self.poisoned() {
            return Err(CommError::Aborted);
        }
        let epoch = gather.epoch;
        debug_assert!(
            gather.parts[self.rank].is_none(),
            "rank {} contributed twice to one allgather",
            self.rank
        );
        gather.parts[self.rank] = Some(mine);
        gather.arrived += 1;
        if gather.arrived == shared.size {
            let collected: Vec<Vec<f64>> = gather
                .parts
                .iter_mut()
                .map(|part| part.take().unwrap_or_default())
                .collect();
            gather.result = collected;
            gather.arrived = 0;
            gather.epoch += 1;
            shared.gathered.notify_all();
        } else {
            // A sleeper cannot miss its result: the next epoch can only
            // complete once this rank has contributed to it.
            while gather.epoch == epoch {
                if self.poisoned() {
                    return Err(CommError::Aborted);
                }
                shared.gathered.wait(&mut gather);
            }
        }
        Ok(gather.result.clone())
    }

    fn poison(&self) {
        self.shared.poisoned.store(true, Ordering::SeqCst);
        for mailbox in &self.shared.mailboxes {
            let _guard = mailbox.queue.lock();
            mailbox.ready.notify_all();
        }
        let _guard = self.shared.gather.lock();
        self.shared.gathered.notify_all();
    }
}
