//! Segmented one-sided transfers.
//!
//! A logical transfer between two descriptors is planned as a list of pieces, each lying inside
//! one source segment and one destination segment. Every piece is issued to the network layer
//! as its own operation; the request completes when the last piece does, and fails as soon as
//! one piece fails for good.
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use ferry_na::{Address, NaError, NaOpId};
use ferry_util::{Condition, Mutex};

use super::descriptor::{BulkDescriptor, Segment};
use crate::context::{wait_until, Context, OpTarget};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    /// Read the remote region into local memory.
    Pull,
    /// Write local memory into the remote region.
    Push,
}

#[derive(Debug, Clone)]
pub enum BulkStatus {
    Pending,
    Completed,
    Failed(Error),
}

impl BulkStatus {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, BulkStatus::Pending)
    }
}

/// One micro-transfer, contained in a single segment on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Piece {
    pub(crate) src_seg: usize,
    pub(crate) src_va: u64,
    pub(crate) dst_seg: usize,
    pub(crate) dst_va: u64,
    pub(crate) len: u64,
}

fn locate(segments: &[Segment], offset: u64) -> (usize, u64) {
    let mut start = 0;
    for (i, seg) in segments.iter().enumerate() {
        if offset < start + seg.len {
            return (i, offset - start);
        }
        start += seg.len;
    }
    (segments.len(), 0)
}

/// Walk both segment lists in parallel, cutting at every boundary of either side.
///
/// Callers check that both ranges lie inside their regions.
pub(crate) fn plan(
    src: &[Segment],
    src_offset: u64,
    dst: &[Segment],
    dst_offset: u64,
    len: u64,
) -> Vec<Piece> {
    let mut pieces = Vec::new();
    if len == 0 {
        return pieces;
    }
    let (mut si, mut s_in) = locate(src, src_offset);
    let (mut di, mut d_in) = locate(dst, dst_offset);
    let mut left = len;
    while left > 0 {
        let n = (src[si].len - s_in).min(dst[di].len - d_in).min(left);
        pieces.push(Piece {
            src_seg: si,
            src_va: src[si].base + s_in,
            dst_seg: di,
            dst_va: dst[di].base + d_in,
            len: n,
        });
        left -= n;
        s_in += n;
        d_in += n;
        if s_in == src[si].len {
            si += 1;
            s_in = 0;
        }
        if d_in == dst[di].len {
            di += 1;
            d_in = 0;
        }
    }
    pieces
}

struct RequestState {
    status: BulkStatus,
    outstanding: usize,
    in_flight: Vec<Option<NaOpId>>,
    attempts: Vec<u32>,
    cancel_requested: bool,
    freed: bool,
}

impl RequestState {
    /// Fail the request and hand back the operations that are still out.
    fn fail(&mut self, err: Error) -> Vec<NaOpId> {
        self.status = BulkStatus::Failed(err);
        self.in_flight.iter_mut().filter_map(Option::take).collect()
    }
}

pub(crate) struct RequestInner {
    id: u64,
    op: BulkOp,
    local: BulkDescriptor,
    remote: BulkDescriptor,
    peer: Address,
    pieces: Vec<Piece>,
    state: Mutex<RequestState>,
    cond: Condition,
}

impl RequestInner {
    fn poll(&self) -> Option<Result<()>> {
        let state = self.state.lock();
        if state.freed {
            return Some(Err(Error::AlreadyFreed));
        }
        match &state.status {
            BulkStatus::Pending => None,
            BulkStatus::Completed => Some(Ok(())),
            BulkStatus::Failed(e) => Some(Err(e.clone())),
        }
    }

    fn block_until(&self, until: ferry_util::Time) {
        let state = self.state.lock();
        if state.status.is_pending() && !state.freed {
            let _ = wait_until(&self.cond, state, until);
        }
    }
}

/// A pending or finished transfer.
///
/// The caller owns the request; the engine keeps only a weak reference for delivering
/// completions.
#[derive(Clone)]
pub struct BulkRequest {
    inner: Arc<RequestInner>,
}

impl BulkRequest {
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn op(&self) -> BulkOp {
        self.inner.op
    }

    /// Number of micro-transfers the request was split into.
    #[inline]
    pub fn num_pieces(&self) -> usize {
        self.inner.pieces.len()
    }
}

impl fmt::Debug for BulkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkRequest")
            .field("id", &self.inner.id)
            .field("op", &self.inner.op)
            .field("peer", &self.inner.peer)
            .field("pieces", &self.inner.pieces.len())
            .finish()
    }
}

impl Context {
    /// Read `len` bytes at `remote_offset` of `remote` into `local` at `local_offset`.
    pub fn bulk_pull(
        &self,
        remote: &BulkDescriptor,
        remote_offset: u64,
        local: &BulkDescriptor,
        local_offset: u64,
        len: u64,
    ) -> Result<BulkRequest> {
        self.bulk_start(BulkOp::Pull, remote, remote_offset, local, local_offset, len)
    }

    /// Write `len` bytes at `local_offset` of `local` into `remote` at `remote_offset`.
    pub fn bulk_push(
        &self,
        remote: &BulkDescriptor,
        remote_offset: u64,
        local: &BulkDescriptor,
        local_offset: u64,
        len: u64,
    ) -> Result<BulkRequest> {
        self.bulk_start(BulkOp::Push, remote, remote_offset, local, local_offset, len)
    }

    /// Read the whole remote region into the start of `local`.
    pub fn bulk_pull_all(
        &self,
        remote: &BulkDescriptor,
        local: &BulkDescriptor,
    ) -> Result<BulkRequest> {
        self.bulk_pull(remote, 0, local, 0, remote.size())
    }

    fn bulk_start(
        &self,
        op: BulkOp,
        remote: &BulkDescriptor,
        remote_offset: u64,
        local: &BulkDescriptor,
        local_offset: u64,
        len: u64,
    ) -> Result<BulkRequest> {
        if !local.is_local() {
            return Err(Error::InvalidArgument(String::from(
                "the local side of a transfer must be a local descriptor",
            )));
        }
        local.ensure_live()?;
        remote.ensure_live()?;
        let peer = if remote.is_local() {
            self.addr_self()
        } else {
            remote.peer().cloned().ok_or_else(|| {
                Error::InvalidArgument(String::from("remote descriptor is not bound to a peer"))
            })?
        };

        let (readable, writable) = match op {
            BulkOp::Pull => (remote, local),
            BulkOp::Push => (local, remote),
        };
        if !readable.access().can_read() {
            return Err(Error::InvalidArgument(format!(
                "{:?} source region is not readable",
                readable.access()
            )));
        }
        if !writable.access().can_write() {
            return Err(Error::InvalidArgument(format!(
                "{:?} destination region is not writable",
                writable.access()
            )));
        }
        for (desc, offset) in [(remote, remote_offset), (local, local_offset)] {
            let end = offset.checked_add(len);
            if !matches!(end, Some(end) if end <= desc.size()) {
                return Err(Error::InvalidArgument(format!(
                    "range [{}, +{}) exceeds a {}-byte region",
                    offset,
                    len,
                    desc.size()
                )));
            }
        }

        let pieces = match op {
            BulkOp::Pull => plan(remote.segments(), remote_offset, local.segments(), local_offset, len),
            BulkOp::Push => plan(local.segments(), local_offset, remote.segments(), remote_offset, len),
        };
        let n = pieces.len();
        let inner = Arc::new(RequestInner {
            id: self.next_request_id(),
            op,
            local: local.clone(),
            remote: remote.clone(),
            peer,
            pieces,
            state: Mutex::new(RequestState {
                status: if n == 0 {
                    BulkStatus::Completed
                } else {
                    BulkStatus::Pending
                },
                outstanding: n,
                in_flight: vec![None; n],
                attempts: vec![0; n],
                cancel_requested: false,
                freed: false,
            }),
            cond: Condition::new(),
        });
        tracing::debug!(
            "bulk request {} {:?} {} bytes in {} pieces with {}",
            inner.id,
            op,
            len,
            n,
            inner.peer
        );

        for index in 0..n {
            if let Err(e) = self.issue_piece(&inner, index) {
                let stray = inner.state.lock().fail(Error::BulkFailed {
                    index,
                    source: Box::new(e.clone()),
                });
                self.cancel_ops(&stray);
                return Err(Error::BulkFailed {
                    index,
                    source: Box::new(e),
                });
            }
        }
        Ok(BulkRequest { inner })
    }

    fn issue_piece(&self, inner: &Arc<RequestInner>, index: usize) -> Result<()> {
        let piece = inner.pieces[index];
        let na = self.na();
        // Hold the table while issuing so the completion cannot be looked up before it is known.
        let mut ops = self.ops().lock();
        let op = match inner.op {
            BulkOp::Pull => na.get(
                inner.local.token(piece.dst_seg),
                piece.dst_va,
                &inner.peer,
                inner.remote.token(piece.src_seg),
                piece.src_va,
                piece.len,
            )?,
            BulkOp::Push => na.put(
                inner.local.token(piece.src_seg),
                piece.src_va,
                &inner.peer,
                inner.remote.token(piece.dst_seg),
                piece.dst_va,
                piece.len,
            )?,
        };
        ops.insert(op, OpTarget::Bulk(Arc::downgrade(inner), index));
        let abandoned = {
            let mut state = inner.state.lock();
            state.in_flight[index] = Some(op);
            state.cancel_requested || state.freed
        };
        drop(ops);
        // A cancel or free that ran while this piece was being reissued did not see `op`.
        if abandoned {
            tracing::debug!("bulk request {} abandoned, canceling reissued {}", inner.id, op);
            self.cancel_ops(&[op]);
        }
        tracing::trace!(
            "bulk request {} piece {} issued as {} ({} bytes)",
            inner.id,
            index,
            op,
            piece.len
        );
        Ok(())
    }

    fn cancel_ops(&self, ops: &[NaOpId]) {
        for &op in ops {
            if let Err(e) = self.na().cancel(op) {
                tracing::warn!("failed to cancel {}: {}", op, e);
            }
        }
    }

    /// Deliver the outcome of one micro-transfer. Returns true when the request reached a final
    /// state.
    pub(crate) fn bulk_complete(
        &self,
        target: Weak<RequestInner>,
        index: usize,
        result: ferry_na::Result<()>,
    ) -> bool {
        let inner = match target.upgrade() {
            Some(inner) => inner,
            None => return false,
        };
        let mut state = inner.state.lock();
        state.in_flight[index] = None;
        if !state.status.is_pending() || state.freed {
            return false;
        }
        let stray = match result {
            Ok(()) => {
                state.outstanding -= 1;
                if state.outstanding > 0 {
                    return false;
                }
                state.status = BulkStatus::Completed;
                tracing::debug!("bulk request {} completed", inner.id);
                Vec::new()
            }
            Err(NaError::Canceled) => {
                tracing::debug!("bulk request {} canceled", inner.id);
                state.fail(Error::Canceled)
            }
            Err(e)
                if e.is_transient()
                    && !state.cancel_requested
                    && state.attempts[index] < self.config().max_transfer_retries =>
            {
                state.attempts[index] += 1;
                let attempt = state.attempts[index];
                drop(state);
                tracing::warn!(
                    "bulk request {} piece {} failed transiently ({}), retry {}",
                    inner.id,
                    index,
                    e,
                    attempt
                );
                let reissued = self.issue_piece(&inner, index);
                state = inner.state.lock();
                match reissued {
                    Ok(()) => return false,
                    Err(e) => state.fail(Error::BulkFailed {
                        index,
                        source: Box::new(e),
                    }),
                }
            }
            Err(e) => {
                tracing::debug!("bulk request {} piece {} failed: {}", inner.id, index, e);
                state.fail(Error::BulkFailed {
                    index,
                    source: Box::new(e.into()),
                })
            }
        };
        inner.cond.broadcast();
        drop(state);
        self.cancel_ops(&stray);
        true
    }

    /// Wait up to `timeout_ms` for the request to finish.
    ///
    /// `Err(Timeout)` leaves the request pending. Once finished, every call returns the same
    /// outcome until the request is freed.
    pub fn bulk_wait(&self, req: &BulkRequest, timeout_ms: u64) -> Result<()> {
        let inner = &req.inner;
        self.wait_on(timeout_ms, || inner.poll(), |until| inner.block_until(until))?
    }

    /// Current state of the request, without waiting or driving progress.
    pub fn bulk_test(&self, req: &BulkRequest) -> Result<BulkStatus> {
        let state = req.inner.state.lock();
        if state.freed {
            return Err(Error::AlreadyFreed);
        }
        Ok(state.status.clone())
    }

    /// Ask the network layer to abort the outstanding pieces. The request fails with
    /// `Canceled` once the layer acknowledges, unless it completes first.
    pub fn bulk_cancel(&self, req: &BulkRequest) -> Result<()> {
        let mut state = req.inner.state.lock();
        if state.freed {
            return Err(Error::AlreadyFreed);
        }
        if !state.status.is_pending() {
            return Ok(());
        }
        state.cancel_requested = true;
        let ops: Vec<NaOpId> = state.in_flight.iter().flatten().copied().collect();
        drop(state);
        tracing::debug!("canceling bulk request {} ({} ops)", req.inner.id, ops.len());
        for op in ops {
            self.na().cancel(op)?;
        }
        Ok(())
    }

    /// Release the request. Pieces still in flight are canceled and their outcome discarded.
    pub fn bulk_free_request(&self, req: &BulkRequest) -> Result<()> {
        let mut state = req.inner.state.lock();
        if state.freed {
            return Err(Error::AlreadyFreed);
        }
        state.freed = true;
        let stray: Vec<NaOpId> = if state.status.is_pending() {
            state.cancel_requested = true;
            state.in_flight.iter().flatten().copied().collect()
        } else {
            Vec::new()
        };
        req.inner.cond.broadcast();
        drop(state);
        self.cancel_ops(&stray);
        Ok(())
    }

    fn next_request_id(&self) -> u64 {
        self.request_counter().fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use ferry_na::loopback::Fabric;

    use super::*;
    use crate::bulk::BulkAccess;
    use crate::{Code, ContextConfig};

    fn segs(lens: &[u64]) -> Vec<Segment> {
        let mut base = 0x1000;
        lens.iter()
            .map(|&len| {
                let s = Segment { base, len };
                base += len + 0x100;
                s
            })
            .collect()
    }

    #[test]
    fn contiguous_to_scatter() {
        let src = segs(&[1024]);
        let dst = segs(&[500, 524]);
        let pieces = plan(&src, 0, &dst, 0, 1024);
        assert_eq!(pieces.len(), 2);
        assert_eq!((pieces[0].dst_seg, pieces[0].len), (0, 500));
        assert_eq!((pieces[1].dst_seg, pieces[1].len), (1, 524));
        assert_eq!(pieces[1].src_va, src[0].base + 500);
        assert_eq!(pieces[1].dst_va, dst[1].base);
    }

    #[test]
    fn offsets_land_mid_segment() {
        let src = segs(&[10, 10, 10]);
        let dst = segs(&[7, 23]);
        let pieces = plan(&src, 5, &dst, 3, 20);
        let lens: Vec<u64> = pieces.iter().map(|p| p.len).collect();
        // source cuts at region offsets 10 and 20, destination at 7
        assert_eq!(lens, vec![4, 1, 10, 5]);
        assert_eq!(pieces[0].src_va, src[0].base + 5);
        assert_eq!(pieces[0].dst_va, dst[0].base + 3);
        assert_eq!(pieces.iter().map(|p| p.len).sum::<u64>(), 20);
    }

    #[test]
    fn empty_transfer_has_no_pieces() {
        let s = segs(&[8]);
        assert!(plan(&s, 8, &s, 0, 0).is_empty());
    }

    #[test]
    fn pieces_never_cross_boundaries() {
        let src = segs(&[3, 1, 4, 1, 5, 9, 2, 6]);
        let dst = segs(&[2, 7, 1, 8, 2, 8, 3]);
        for p in plan(&src, 2, &dst, 1, 28) {
            let s = src[p.src_seg];
            let d = dst[p.dst_seg];
            assert!(p.src_va >= s.base && p.src_va + p.len <= s.base + s.len);
            assert!(p.dst_va >= d.base && p.dst_va + p.len <= d.base + d.len);
        }
    }

    #[test]
    fn piece_reissued_after_cancel_is_canceled() {
        let fabric = Fabric::new();
        let server = Context::new(Arc::new(fabric.endpoint()), ContextConfig::default());
        let client = Context::new(Arc::new(fabric.endpoint()), ContextConfig::default());
        let exposed = BulkDescriptor::alloc(&client, 64, BulkAccess::ReadOnly).unwrap();
        let remote = BulkDescriptor::deserialize(&exposed.serialize().unwrap())
            .unwrap()
            .with_peer(client.addr_self())
            .unwrap();
        fabric.set_responsive(&client.addr_self(), false).unwrap();

        let local = BulkDescriptor::alloc(&server, 64, BulkAccess::WriteOnly).unwrap();
        let req = server.bulk_pull_all(&remote, &local).unwrap();
        server.bulk_cancel(&req).unwrap();
        // a retry that reissues the piece after the cancel collected the in-flight ops
        req.inner.state.lock().in_flight[0] = None;
        server.issue_piece(&req.inner, 0).unwrap();

        assert_eq!(server.bulk_wait(&req, 1000).unwrap_err().code(), Code::Canceled);
        for _ in 0..3 {
            let _ = server.process(10);
        }
        assert!(server.ops().lock().is_empty());
        server.bulk_free_request(&req).unwrap();
    }
}
