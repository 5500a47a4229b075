//! In-process fabric.
//!
//! Endpoints created from one [`Fabric`] can message each other and perform one-sided
//! operations on each other's registered [`MemBuffer`]s. Every operation completes
//! asynchronously: its outcome is queued and reported by the next [`NetworkLayer::progress`]
//! call of the initiating endpoint.
//!
//! Two knobs exist for exercising failure paths: a peer can be made unresponsive, in which case
//! one-sided operations against it stall until canceled, and a number of transient failures
//! can be injected into upcoming one-sided operations.
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use fnv::{FnvBuildHasher, FnvHashMap};

use crate::{
    Address, Completion, MemBuffer, MemToken, Message, MsgKind, NaError, NaEvent, NaOpId,
    NetworkLayer, OpKind, Result, Tag,
};

pub const DEFAULT_MSG_MAX_SIZE: usize = 4096;

const SCHEME: &str = "loop://";

struct FabricShared {
    endpoints: DashMap<Address, Arc<EndpointShared>, FnvBuildHasher>,
    next_endpoint: AtomicU64,
    next_op: AtomicU64,
    transient_failures: AtomicU32,
    msg_max_size: usize,
}

struct EndpointShared {
    addr: Address,
    events: Sender<NaEvent>,
    responsive: AtomicBool,
    regions: DashMap<u64, MemBuffer, FnvBuildHasher>,
    next_key: AtomicU64,
    // One-sided operations issued by this endpoint against an unresponsive peer.
    stalled: spin::Mutex<FnvHashMap<NaOpId, OpKind>>,
}

impl EndpointShared {
    #[inline]
    fn complete(&self, op: NaOpId, kind: OpKind, result: Result<()>) {
        // The owning `Endpoint` holds the receiver for as long as this endpoint is reachable.
        let _ = self
            .events
            .send(NaEvent::Completion(Completion { op, kind, result }));
    }

    fn region(&self, token: &MemToken) -> Result<MemBuffer> {
        let key = decode_token(token)?;
        self.regions
            .get(&key)
            .map(|r| r.value().clone())
            .ok_or(NaError::InvalidToken)
    }
}

/// Translate a virtual address inside `buf` into an offset from its start.
#[inline]
fn offset_of(buf: &MemBuffer, va: u64, len: u64) -> Result<u64> {
    va.checked_sub(buf.base_addr()).ok_or(NaError::OutOfBounds {
        offset: va,
        len,
        size: buf.len() as u64,
    })
}

/// A process-local network joining any number of endpoints.
#[derive(Clone)]
pub struct Fabric {
    shared: Arc<FabricShared>,
}

impl Default for Fabric {
    fn default() -> Self {
        Fabric::new()
    }
}

impl Fabric {
    pub fn new() -> Self {
        Self::with_msg_max_size(DEFAULT_MSG_MAX_SIZE)
    }

    pub fn with_msg_max_size(msg_max_size: usize) -> Self {
        Fabric {
            shared: Arc::new(FabricShared {
                endpoints: DashMap::default(),
                next_endpoint: AtomicU64::new(1),
                next_op: AtomicU64::new(1),
                transient_failures: AtomicU32::new(0),
                msg_max_size,
            }),
        }
    }

    /// Open a new endpoint with a fresh address.
    pub fn endpoint(&self) -> Endpoint {
        let id = self.shared.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let addr = Address::new(format!("{SCHEME}{id}"));
        let (tx, rx) = channel::unbounded();
        let shared = Arc::new(EndpointShared {
            addr: addr.clone(),
            events: tx,
            responsive: AtomicBool::new(true),
            regions: DashMap::default(),
            next_key: AtomicU64::new(1),
            stalled: spin::Mutex::new(FnvHashMap::default()),
        });
        self.shared.endpoints.insert(addr, Arc::clone(&shared));
        tracing::debug!("loopback endpoint {} opened", shared.addr);
        Endpoint {
            fabric: Arc::clone(&self.shared),
            shared,
            events: rx,
        }
    }

    /// When a peer is unresponsive, one-sided operations targeting it never complete on their
    /// own; only [`NetworkLayer::cancel`] finishes them.
    pub fn set_responsive(&self, addr: &Address, responsive: bool) -> Result<()> {
        let ep = self
            .shared
            .endpoints
            .get(addr)
            .ok_or_else(|| NaError::AddrNotFound(addr.clone()))?;
        ep.responsive.store(responsive, Ordering::Release);
        Ok(())
    }

    /// Fail the next `n` one-sided operations issued anywhere on the fabric with a transient
    /// error.
    pub fn inject_transient_failures(&self, n: u32) {
        self.shared.transient_failures.fetch_add(n, Ordering::AcqRel);
    }

    /// Make `addr` unreachable. Its owner keeps draining already queued events.
    pub fn close(&self, addr: &Address) -> Result<()> {
        self.shared
            .endpoints
            .remove(addr)
            .map(|_| ())
            .ok_or_else(|| NaError::AddrNotFound(addr.clone()))
    }

    /// Number of endpoints currently reachable.
    pub fn num_endpoints(&self) -> usize {
        self.shared.endpoints.len()
    }
}

/// One endpoint of a [`Fabric`]. Dropping it makes its address unreachable.
pub struct Endpoint {
    fabric: Arc<FabricShared>,
    shared: Arc<EndpointShared>,
    events: Receiver<NaEvent>,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.fabric.endpoints.remove(&self.shared.addr);
        tracing::debug!("loopback endpoint {} closed", self.shared.addr);
    }
}

#[inline]
fn encode_token(key: u64) -> MemToken {
    MemToken(key.to_le_bytes().to_vec())
}

#[inline]
fn decode_token(token: &MemToken) -> Result<u64> {
    let bytes: [u8; 8] = token
        .as_bytes()
        .try_into()
        .map_err(|_| NaError::InvalidToken)?;
    Ok(u64::from_le_bytes(bytes))
}

impl Endpoint {
    fn peer(&self, addr: &Address) -> Result<Arc<EndpointShared>> {
        self.fabric
            .endpoints
            .get(addr)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| NaError::AddrNotFound(addr.clone()))
    }

    fn take_transient_failure(&self) -> bool {
        self.fabric
            .transient_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    #[allow(clippy::too_many_arguments)]
    fn one_sided(
        &self,
        kind: OpKind,
        local: &MemToken,
        local_va: u64,
        remote_addr: &Address,
        remote: &MemToken,
        remote_va: u64,
        len: u64,
    ) -> Result<NaOpId> {
        let local_buf = self.shared.region(local)?;
        let peer = self.peer(remote_addr)?;
        let op = NaOpId(self.fabric.next_op.fetch_add(1, Ordering::Relaxed));

        if self.take_transient_failure() {
            tracing::trace!("{} {:?} {} failed by injection", self.shared.addr, kind, op);
            self.shared.complete(
                op,
                kind,
                Err(NaError::Transient(String::from("injected failure"))),
            );
            return Ok(op);
        }

        if !peer.responsive.load(Ordering::Acquire) {
            tracing::trace!("{} {:?} {} stalled on {}", self.shared.addr, kind, op, peer.addr);
            self.shared.stalled.lock().insert(op, kind);
            return Ok(op);
        }

        let result = peer.region(remote).and_then(|remote_buf| {
            let local_offset = offset_of(&local_buf, local_va, len)?;
            let remote_offset = offset_of(&remote_buf, remote_va, len)?;
            match kind {
                OpKind::Put => {
                    MemBuffer::copy(&local_buf, local_offset, &remote_buf, remote_offset, len)
                }
                _ => MemBuffer::copy(&remote_buf, remote_offset, &local_buf, local_offset, len),
            }
        });
        self.shared.complete(op, kind, result);
        Ok(op)
    }
}

impl NetworkLayer for Endpoint {
    fn name(&self) -> &str {
        "loopback"
    }

    fn addr_self(&self) -> Address {
        self.shared.addr.clone()
    }

    fn msg_max_size(&self) -> usize {
        self.fabric.msg_max_size
    }

    fn msg_send(&self, dest: &Address, kind: MsgKind, tag: Tag, payload: Vec<u8>) -> Result<NaOpId> {
        if payload.len() > self.fabric.msg_max_size {
            return Err(NaError::MsgSize {
                size: payload.len(),
                max: self.fabric.msg_max_size,
            });
        }
        let peer = self.peer(dest)?;
        let op = NaOpId(self.fabric.next_op.fetch_add(1, Ordering::Relaxed));
        let msg = Message {
            source: self.shared.addr.clone(),
            kind,
            tag,
            payload,
        };
        let result = peer
            .events
            .send(NaEvent::Message(msg))
            .map_err(|_| NaError::Closed);
        self.shared.complete(op, OpKind::Send, result);
        Ok(op)
    }

    fn mem_register(&self, buf: &MemBuffer) -> Result<MemToken> {
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        self.shared.regions.insert(key, buf.clone());
        Ok(encode_token(key))
    }

    fn mem_deregister(&self, token: &MemToken) -> Result<()> {
        let key = decode_token(token)?;
        self.shared
            .regions
            .remove(&key)
            .map(|_| ())
            .ok_or(NaError::InvalidToken)
    }

    fn get(
        &self,
        local: &MemToken,
        local_va: u64,
        remote_addr: &Address,
        remote: &MemToken,
        remote_va: u64,
        len: u64,
    ) -> Result<NaOpId> {
        self.one_sided(OpKind::Get, local, local_va, remote_addr, remote, remote_va, len)
    }

    fn put(
        &self,
        local: &MemToken,
        local_va: u64,
        remote_addr: &Address,
        remote: &MemToken,
        remote_va: u64,
        len: u64,
    ) -> Result<NaOpId> {
        self.one_sided(OpKind::Put, local, local_va, remote_addr, remote, remote_va, len)
    }

    fn cancel(&self, op: NaOpId) -> Result<()> {
        // Anything not stalled has already had its completion queued.
        if let Some(kind) = self.shared.stalled.lock().remove(&op) {
            self.shared.complete(op, kind, Err(NaError::Canceled));
        }
        Ok(())
    }

    fn progress(&self, timeout: Duration, events: &mut Vec<NaEvent>) -> Result<usize> {
        let before = events.len();
        let first = if timeout.is_zero() {
            self.events.try_recv().ok()
        } else {
            match self.events.recv_timeout(timeout) {
                Ok(ev) => Some(ev),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return Err(NaError::Closed),
            }
        };
        if let Some(ev) = first {
            events.push(ev);
            events.extend(self.events.try_iter());
        }
        Ok(events.len() - before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(ep: &Endpoint) -> Vec<NaEvent> {
        let mut events = Vec::new();
        ep.progress(Duration::from_millis(100), &mut events).unwrap();
        events
    }

    fn single_completion(ep: &Endpoint) -> Completion {
        match drain(ep).pop() {
            Some(NaEvent::Completion(c)) => c,
            other => panic!("expected a completion, got {:?}", other),
        }
    }

    #[test]
    fn message_roundtrip() {
        let fabric = Fabric::new();
        let a = fabric.endpoint();
        let b = fabric.endpoint();
        a.msg_send(&b.addr_self(), MsgKind::Unexpected, 7, b"hello".to_vec())
            .unwrap();
        let events = drain(&b);
        match &events[0] {
            NaEvent::Message(m) => {
                assert_eq!(m.source, a.addr_self());
                assert_eq!(m.tag, 7);
                assert_eq!(m.kind, MsgKind::Unexpected);
                assert_eq!(m.payload, b"hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(single_completion(&a).result.is_ok());
    }

    #[test]
    fn oversized_message_rejected() {
        let fabric = Fabric::with_msg_max_size(8);
        let a = fabric.endpoint();
        let err = a
            .msg_send(&a.addr_self(), MsgKind::Unexpected, 0, vec![0; 9])
            .unwrap_err();
        assert_eq!(err, NaError::MsgSize { size: 9, max: 8 });
    }

    #[test]
    fn get_and_put_copy_bytes() {
        let fabric = Fabric::new();
        let a = fabric.endpoint();
        let b = fabric.endpoint();
        let src = MemBuffer::from_vec((0u8..64).collect());
        let dst = MemBuffer::zeroed(64);
        let remote = b.mem_register(&src).unwrap();
        let local = a.mem_register(&dst).unwrap();

        a.get(&local, dst.base_addr(), &b.addr_self(), &remote, src.base_addr() + 16, 32)
            .unwrap();
        assert!(single_completion(&a).result.is_ok());
        assert_eq!(&dst.to_vec()[..32], &(16u8..48).collect::<Vec<_>>()[..]);

        dst.write_at(0, &[0xff; 4]).unwrap();
        a.put(&local, dst.base_addr(), &b.addr_self(), &remote, src.base_addr() + 60, 4)
            .unwrap();
        assert!(single_completion(&a).result.is_ok());
        assert_eq!(&src.to_vec()[60..], &[0xff; 4]);
    }

    #[test]
    fn stalled_op_completes_only_on_cancel() {
        let fabric = Fabric::new();
        let a = fabric.endpoint();
        let b = fabric.endpoint();
        let (src, dst) = (MemBuffer::zeroed(8), MemBuffer::zeroed(8));
        let remote = b.mem_register(&src).unwrap();
        let local = a.mem_register(&dst).unwrap();
        fabric.set_responsive(&b.addr_self(), false).unwrap();

        let op = a
            .get(&local, dst.base_addr(), &b.addr_self(), &remote, src.base_addr(), 8)
            .unwrap();
        let mut events = Vec::new();
        assert_eq!(a.progress(Duration::from_millis(20), &mut events).unwrap(), 0);

        a.cancel(op).unwrap();
        let c = single_completion(&a);
        assert_eq!(c.op, op);
        assert_eq!(c.result, Err(NaError::Canceled));
    }

    #[test]
    fn injected_failures_are_transient() {
        let fabric = Fabric::new();
        let a = fabric.endpoint();
        let mem = MemBuffer::zeroed(8);
        let base = mem.base_addr();
        let buf = a.mem_register(&mem).unwrap();
        fabric.inject_transient_failures(1);
        a.put(&buf, base, &a.addr_self(), &buf, base, 4).unwrap();
        assert!(single_completion(&a).result.unwrap_err().is_transient());
        a.put(&buf, base, &a.addr_self(), &buf, base + 4, 4).unwrap();
        assert!(single_completion(&a).result.is_ok());
    }

    #[test]
    fn dropped_endpoint_is_unreachable() {
        let fabric = Fabric::new();
        let a = fabric.endpoint();
        let b = fabric.endpoint();
        let addr = b.addr_self();
        drop(b);
        assert_eq!(fabric.num_endpoints(), 1);
        let err = a.msg_send(&addr, MsgKind::Unexpected, 0, vec![]).unwrap_err();
        assert_eq!(err, NaError::AddrNotFound(addr));
    }

    #[test]
    fn deregistered_token_is_invalid() {
        let fabric = Fabric::new();
        let a = fabric.endpoint();
        let token = a.mem_register(&MemBuffer::zeroed(4)).unwrap();
        a.mem_deregister(&token).unwrap();
        assert_eq!(a.mem_deregister(&token), Err(NaError::InvalidToken));
    }
}
