//! Request/reply protocol for fetching remote rows
//!
//! Two exchanges share one message shape. A process that wants rows sorts
//! the wanted indices, groups consecutive runs by owning process (owners of
//! a sorted list form contiguous runs because row blocks are contiguous),
//! and fires one `Req` per group without retaining the handle. Owners probe
//! for requests, answer each with a `RepInd` body — and, for stored rows, a
//! paired `RepVal` body — and keep those reply handles until a final
//! `waitall`.
//!
//! - [`exchange_pruned`] runs once per level: the pattern frontier drives
//!   the requests, received rows merge their external indices back into the
//!   pattern, producing the next frontier. The loop receives exactly as many
//!   requests as it sent, which holds when the pruned pattern is
//!   structurally symmetric; that precondition is documented on the public
//!   build API.
//! - [`exchange_stored`] runs once, over the external pattern of the
//!   already-chosen `M` structure. Lower-triangular `M` makes this graph
//!   asymmetric, so the number of requests to answer (`num_replies`) is
//!   supplied by the pattern construction pass, which counted the distinct
//!   remote owners that will come asking.
//!
//! Reply bodies are adopted whole by the row containers; nothing on the
//! receive path copies row data a second time.

use std::ops::Range;

use tracing::trace;

use crate::comm::{Comm, CommError, SendHandle, Tag};
use crate::matrix::{DistMatrix, RowPartition};
use crate::pattern::{PatternError, RowPattern};
use crate::pruned::PrunedRows;
use crate::stored::StoredRows;

/// Failures of the row exchange itself, distinct from transport failures.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// A reply or request disagreed with its own header.
    #[error("malformed exchange message involving rank {peer}: {reason}")]
    Protocol {
        /// The peer the malformed message involves.
        peer: usize,
        /// What was inconsistent about it.
        reason: &'static str,
    },
    /// The transport failed or the collective was aborted.
    #[error(transparent)]
    Transport(#[from] CommError),
    /// The merged pattern outgrew its capacity.
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// Sort `reqind`, group consecutive same-owner runs, and send one
/// fire-and-forget `Req` per group. Returns the number of groups, which is
/// also the number of replies the caller must later receive.
pub(crate) fn send_requests<C: Comm>(
    comm: &C,
    part: &RowPartition,
    mut reqind: Vec<usize>,
) -> Result<usize, ExchangeError> {
    reqind.sort_unstable();
    let mut num_requests = 0;
    let mut i = 0;
    while i < reqind.len() {
        let owner = part.owner(reqind[i]);
        let block_end = part.range(owner).end;
        let mut j = i + 1;
        while j < reqind.len() && reqind[j] < block_end {
            j += 1;
        }
        let _ = comm.isend_ints(owner, Tag::Req, reqind[i..j].to_vec())?;
        num_requests += 1;
        i = j;
    }
    Ok(num_requests)
}

/// Block for one incoming request from any source.
pub(crate) fn receive_request<C: Comm>(comm: &C) -> Result<(usize, Vec<usize>), ExchangeError> {
    let incoming = comm.probe(Tag::Req)?;
    let body = comm.recv_ints(incoming.source, Tag::Req)?;
    Ok((incoming.source, body))
}

/// Parse a `RepInd` body `[n, row_1..row_n, len_1, ind.., len_2, ind.., ..]`
/// into per-row bindings `(row, range-into-body)`.
fn parse_reply(peer: usize, body: &[usize]) -> Result<Vec<(usize, Range<usize>)>, ExchangeError> {
    let malformed = |reason| ExchangeError::Protocol { peer, reason };
    let n = *body.first().ok_or_else(|| malformed("empty reply"))?;
    if n >= body.len() {
        return Err(malformed("reply shorter than its row-number header"));
    }
    let mut bindings = Vec::with_capacity(n);
    let mut at = 1 + n;
    for k in 0..n {
        let len = *body.get(at).ok_or_else(|| malformed("truncated row header"))?;
        at += 1;
        if len > body.len() - at {
            return Err(malformed("row body overruns the reply"));
        }
        bindings.push((body[1 + k], at..at + len));
        at += len;
    }
    if at != body.len() {
        return Err(malformed("trailing data after the last row"));
    }
    Ok(bindings)
}

/// Answer one request with the pruned patterns of the requested rows.
/// The returned handle must be kept until the level's `waitall`.
fn send_reply_pruned<C: Comm>(
    comm: &C,
    dest: usize,
    req: &[usize],
    pruned: &PrunedRows,
) -> Result<SendHandle, ExchangeError> {
    let mut body = Vec::with_capacity(1 + 2 * req.len());
    body.push(req.len());
    body.extend_from_slice(req);
    for &row in req {
        let ind = pruned.get(row).ok_or(ExchangeError::Protocol {
            peer: dest,
            reason: "request for a row this rank does not own",
        })?;
        body.push(ind.len());
        body.extend_from_slice(ind);
    }
    Ok(comm.isend_ints(dest, Tag::RepInd, body)?)
}

/// Receive one pruned-row reply: bind its rows into `pruned` and merge each
/// row's external indices into `patt`, feeding the next frontier.
fn receive_reply_pruned<C: Comm>(
    comm: &C,
    local: &Range<usize>,
    pruned: &mut PrunedRows,
    patt: &mut RowPattern,
) -> Result<(), ExchangeError> {
    let incoming = comm.probe(Tag::RepInd)?;
    let body = comm.recv_ints(incoming.source, Tag::RepInd)?;
    let bindings = parse_reply(incoming.source, &body)?;
    for (_, span) in &bindings {
        patt.merge_external(&body[span.clone()], local)?;
    }
    pruned.adopt_chunk(body, bindings);
    Ok(())
}

/// Fetch the pruned rows needed for `num_levels` of pattern expansion.
///
/// Per level: take the pattern frontier, request those rows from their
/// owners, answer the same number of incoming requests, receive the same
/// number of replies, then wait for the outgoing replies before the next
/// level begins. Returns the per-level request counts.
pub fn exchange_pruned<C: Comm>(
    comm: &C,
    part: &RowPartition,
    pruned: &mut PrunedRows,
    num_levels: usize,
) -> Result<Vec<usize>, ExchangeError> {
    let local = part.range(comm.rank());
    let mut patt = RowPattern::new();
    for row in local.clone() {
        let ind = pruned.get(row).ok_or(ExchangeError::Protocol {
            peer: comm.rank(),
            reason: "local pruned row missing at exchange start",
        })?;
        patt.merge_external(ind, &local)?;
    }

    let mut level_requests = Vec::with_capacity(num_levels);
    for level in 1..=num_levels {
        let frontier = patt.frontier().to_vec();
        let num_requests = send_requests(comm, part, frontier)?;

        let mut replies = Vec::with_capacity(num_requests);
        for _ in 0..num_requests {
            let (source, req) = receive_request(comm)?;
            replies.push(send_reply_pruned(comm, source, &req, pruned)?);
        }
        for _ in 0..num_requests {
            receive_reply_pruned(comm, &local, pruned, &mut patt)?;
        }
        comm.waitall(replies)?;
        trace!(level, num_requests, "pruned-row exchange level drained");
        level_requests.push(num_requests);
    }
    Ok(level_requests)
}

/// Answer one request with whole `(indices, values)` rows of `A`: a
/// `RepInd` body and a paired `RepVal` body. Both handles must be kept
/// until the final `waitall`.
fn send_reply_stored<C: Comm>(
    comm: &C,
    dest: usize,
    req: &[usize],
    a: &DistMatrix,
    stored: &StoredRows,
) -> Result<(SendHandle, SendHandle), ExchangeError> {
    let mut ind_body = Vec::with_capacity(1 + 2 * req.len());
    let mut val_body = Vec::new();
    ind_body.push(req.len());
    ind_body.extend_from_slice(req);
    for &row in req {
        let (ind, val) = stored.get(a, row).ok_or(ExchangeError::Protocol {
            peer: dest,
            reason: "request for a row this rank does not own",
        })?;
        ind_body.push(ind.len());
        ind_body.extend_from_slice(ind);
        val_body.extend_from_slice(val);
    }
    let ind_handle = comm.isend_ints(dest, Tag::RepInd, ind_body)?;
    let val_handle = comm.isend_vals(dest, Tag::RepVal, val_body)?;
    Ok((ind_handle, val_handle))
}

/// Receive one stored-row reply pair and bind its rows.
fn receive_reply_stored<C: Comm>(comm: &C, stored: &mut StoredRows) -> Result<(), ExchangeError> {
    let incoming = comm.probe(Tag::RepInd)?;
    let ind_body = comm.recv_ints(incoming.source, Tag::RepInd)?;
    let bindings = parse_reply(incoming.source, &ind_body)?;
    // The value body follows on its own tag, FIFO from the same source.
    let val_body = comm.recv_vals(incoming.source, Tag::RepVal)?;
    let total: usize = bindings.iter().map(|(_, span)| span.len()).sum();
    if val_body.len() != total {
        return Err(ExchangeError::Protocol {
            peer: incoming.source,
            reason: "value body length disagrees with the index header",
        });
    }
    stored.adopt_reply(ind_body, val_body, bindings);
    Ok(())
}

/// Fetch the rows of `A` that `M`'s pattern references on other processes.
///
/// The communication graph here is asymmetric: this process answers exactly
/// `num_replies` requests (counted in advance by the pattern construction
/// pass), independent of how many it sends. Returns the number of requests
/// sent.
pub fn exchange_stored<C: Comm>(
    comm: &C,
    part: &RowPartition,
    a: &DistMatrix,
    m: &DistMatrix,
    stored: &mut StoredRows,
    num_replies: usize,
) -> Result<usize, ExchangeError> {
    let local = part.range(comm.rank());
    // M is triangular, so its merged external pattern is not already known.
    let mut patt = RowPattern::new();
    for row in local.clone() {
        let (ind, _) = m.row(row);
        patt.merge_external(ind, &local)?;
    }
    let num_requests = send_requests(comm, part, patt.all().to_vec())?;

    let mut replies = Vec::with_capacity(2 * num_replies);
    for _ in 0..num_replies {
        let (source, req) = receive_request(comm)?;
        let (ind_handle, val_handle) = send_reply_stored(comm, source, &req, a, stored)?;
        replies.push(ind_handle);
        replies.push(val_handle);
    }
    for _ in 0..num_requests {
        receive_reply_stored(comm, stored)?;
    }
    comm.waitall(replies)?;
    trace!(num_requests, num_replies, "stored-row exchange drained");
    Ok(num_requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::scale::DiagScale;
    use std::thread;

    /// Tridiagonal (-1, 2, -1) block for one rank.
    fn tridiag_block(part: &RowPartition, rank: usize, n: usize) -> DistMatrix {
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
        a
    }

    #[test]
    fn single_rank_sends_nothing() {
        let comms = LocalComm::universe(1);
        let part = RowPartition::even(6, 1);
        let a = tridiag_block(&part, 0, 6);
        let scale = DiagScale::new(&comms[0], &a).unwrap();
        let mut pruned = PrunedRows::from_matrix(&a, &scale, 0.0);
        let counts = exchange_pruned(&comms[0], &part, &mut pruned, 3).unwrap();
        assert_eq!(counts, vec![0, 0, 0]);
    }

    #[test]
    fn pruned_rows_round_trip_across_two_ranks() {
        let n = 8;
        let part = RowPartition::even(n, 2);
        let comms = LocalComm::universe(2);

        let fetched: Vec<Vec<(usize, Vec<usize>)>> = thread::scope(|scope| {
            let joins: Vec<_> = comms
                .iter()
                .map(|comm| {
                    let part = part.clone();
                    scope.spawn(move || {
                        let rank = comm.rank();
                        let a = tridiag_block(&part, rank, n);
                        let scale = DiagScale::new(comm, &a).unwrap();
                        let mut pruned = PrunedRows::from_matrix(&a, &scale, 0.0);
                        let counts = exchange_pruned(comm, &part, &mut pruned, 2).unwrap();
                        // Level 1 crosses the block boundary once; level 2
                        // reaches one row deeper.
                        assert_eq!(counts, vec![1, 1]);
                        let probe: Vec<usize> = if rank == 0 { vec![4, 5] } else { vec![3, 2] };
                        probe
                            .into_iter()
                            .map(|row| (row, pruned.get(row).unwrap().to_vec()))
                            .collect()
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });

        // Fetched patterns equal the owner's pruned patterns.
        for (row, ind) in fetched.concat() {
            let mut want = vec![row - 1, row, row + 1];
            want.retain(|&j| j < n);
            let mut got = ind;
            got.sort_unstable();
            assert_eq!(got, want, "row {row}");
        }
    }

    #[test]
    fn stored_exchange_is_asymmetric() {
        let n = 8;
        let part = RowPartition::even(n, 2);
        let comms = LocalComm::universe(2);

        thread::scope(|scope| {
            for comm in &comms {
                let part = part.clone();
                scope.spawn(move || {
                    let rank = comm.rank();
                    let a = tridiag_block(&part, rank, n);
                    // Lower-tridiagonal M structure: row r references r-1, r.
                    let mut m = DistMatrix::new(part.clone(), rank);
                    for row in part.range(rank) {
                        let ind: Vec<usize> =
                            (row.saturating_sub(1)..=row).collect();
                        m.set_structure(row, ind);
                    }
                    // Rank 1's row 4 references row 3, owned by rank 0; that
                    // is the only cross-block edge, so rank 0 answers one
                    // request and rank 1 answers none.
                    let num_replies = if rank == 0 { 1 } else { 0 };
                    let mut stored = StoredRows::new(part.range(rank));
                    let sent =
                        exchange_stored(comm, &part, &a, &m, &mut stored, num_replies).unwrap();
                    if rank == 1 {
                        assert_eq!(sent, 1);
                        let (ind, val) = stored.get(&a, 3).unwrap();
                        assert_eq!(ind, &[2, 3, 4]);
                        assert_eq!(val, &[-1.0, 2.0, -1.0]);
                    } else {
                        assert_eq!(sent, 0);
                    }
                });
            }
        });
    }

    #[test]
    fn malformed_reply_is_a_protocol_error() {
        assert!(parse_reply(0, &[]).is_err());
        assert!(parse_reply(0, &[2, 7]).is_err());
        // Row body runs past the end.
        assert!(parse_reply(0, &[1, 7, 3, 1, 2]).is_err());
        // Trailing garbage.
        assert!(parse_reply(0, &[1, 7, 1, 5, 5]).is_err());
        // Well-formed: one row (7) of length 2.
        let ok = parse_reply(0, &[1, 7, 2, 5, 6]).unwrap();
        assert_eq!(ok, vec![(7, 3..5)]);
    }
}
