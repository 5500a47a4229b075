//! Network abstraction consumed by the ferry runtime.
//!
//! A network layer moves small byte envelopes between addressed endpoints and executes
//! one-sided reads and writes against memory that a peer registered beforehand. The runtime
//! only talks to the [`NetworkLayer`] trait; [`loopback`] provides an in-process fabric.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod loopback;
pub mod mem;

pub use mem::MemBuffer;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NaError {
    #[error("address {0} not found")]
    AddrNotFound(Address),
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MsgSize { size: usize, max: usize },
    #[error("invalid memory registration token")]
    InvalidToken,
    #[error("access of {len} bytes at offset {offset} is out of bounds of a {size}-byte region")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("operation canceled")]
    Canceled,
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("endpoint closed")]
    Closed,
}

impl NaError {
    /// Transient failures may succeed when the same operation is issued again.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, NaError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, NaError>;

/// Opaque endpoint address. Equality and hashing follow the string form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(Arc<str>);

impl Address {
    #[inline]
    pub fn new(s: impl AsRef<str>) -> Self {
        Address(Arc::from(s.as_ref()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token produced by registering local memory. Peers embed it in descriptors and hand it back
/// in one-sided operations; its content is meaningful only to the network layer that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemToken(pub Vec<u8>);

impl MemToken {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Identifies an issued send or one-sided operation until its completion is reported.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaOpId(pub u64);

impl fmt::Display for NaOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Unexpected messages start a new exchange (requests); expected messages answer one (replies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    Unexpected,
    Expected,
}

/// Correlates an expected message with the unexpected message it answers.
pub type Tag = u32;

#[derive(Debug, Clone)]
pub struct Message {
    pub source: Address,
    pub kind: MsgKind,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Send,
    Get,
    Put,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub op: NaOpId,
    pub kind: OpKind,
    pub result: Result<()>,
}

#[derive(Debug, Clone)]
pub enum NaEvent {
    Message(Message),
    Completion(Completion),
}

/// The interface the runtime requires from a transport.
///
/// Implementations must be safe to use from several threads; distinct progress contexts own
/// distinct endpoints.
pub trait NetworkLayer: Send + Sync + 'static {
    /// Short transport name for logs.
    fn name(&self) -> &str;

    fn addr_self(&self) -> Address;

    /// Largest envelope `msg_send` accepts.
    fn msg_max_size(&self) -> usize;

    /// Enqueue an envelope for `dest`. A `Send` completion is reported through `progress`.
    fn msg_send(&self, dest: &Address, kind: MsgKind, tag: Tag, payload: Vec<u8>) -> Result<NaOpId>;

    fn mem_register(&self, buf: &MemBuffer) -> Result<MemToken>;

    fn mem_deregister(&self, token: &MemToken) -> Result<()>;

    /// One-sided read of `len` bytes from the peer's registered region into local memory.
    ///
    /// Both sides are addressed by virtual address, as reported by [`MemBuffer::base_addr`] of
    /// the registering peer, together with the token covering that address.
    fn get(
        &self,
        local: &MemToken,
        local_va: u64,
        remote_addr: &Address,
        remote: &MemToken,
        remote_va: u64,
        len: u64,
    ) -> Result<NaOpId>;

    /// One-sided write of `len` bytes from local memory into the peer's registered region.
    fn put(
        &self,
        local: &MemToken,
        local_va: u64,
        remote_addr: &Address,
        remote: &MemToken,
        remote_va: u64,
        len: u64,
    ) -> Result<NaOpId>;

    /// Ask the transport to abort an outstanding operation. Its completion, reporting either
    /// `Canceled` or the natural outcome if that came first, is still delivered by `progress`.
    fn cancel(&self, op: NaOpId) -> Result<()>;

    /// Wait up to `timeout` for at least one event and append every available event to
    /// `events`. Returns the number of events appended.
    fn progress(&self, timeout: Duration, events: &mut Vec<NaEvent>) -> Result<usize>;
}
