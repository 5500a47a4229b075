//! Server-side handles.
//!
//! A handle tracks one inbound invocation from the moment its envelope is accepted until the
//! reply send completes:
//!
//! ```text
//! Received -> InputDecoded -> HandlerRunning -> OutputReady -> ReplySent -> Retired
//! ```
//!
//! The progress loop owns a handle while it is `Received` or `ReplySent`; the handler owns it in
//! between. Retired handles leave the table, and a stale [`HandleId`] is detected by its sequence
//! number even after the slot is reused.
use std::any::Any;
use std::fmt;

use slab::Slab;

use ferry_na::{Address, Tag};

use crate::context::Context;
use crate::proc::{Decoder, Proc};
use crate::registry::{Entry, Input, RpcId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandleState {
    Received,
    InputDecoded,
    HandlerRunning,
    OutputReady,
    ReplySent,
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    key: usize,
    seq: u64,
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}.{}", self.key, self.seq)
    }
}

pub(crate) struct HandleSlot {
    seq: u64,
    pub(crate) peer: Address,
    pub(crate) tag: Tag,
    pub(crate) rpc_id: RpcId,
    pub(crate) entry: Option<Entry>,
    raw_input: Vec<u8>,
    input: Option<Input>,
    pub(crate) state: HandleState,
}

#[derive(Default)]
pub(crate) struct HandleTable {
    slots: Slab<HandleSlot>,
    next_seq: u64,
}

impl HandleTable {
    pub(crate) fn allocate(
        &mut self,
        peer: Address,
        tag: Tag,
        rpc_id: RpcId,
        entry: Option<Entry>,
        raw_input: Vec<u8>,
    ) -> HandleId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = self.slots.insert(HandleSlot {
            seq,
            peer,
            tag,
            rpc_id,
            entry,
            raw_input,
            input: None,
            state: HandleState::Received,
        });
        let id = HandleId { key, seq };
        tracing::debug!("{} allocated for {}", id, rpc_id);
        id
    }

    pub(crate) fn slot(&self, id: HandleId) -> Result<&HandleSlot> {
        match self.slots.get(id.key) {
            Some(slot) if slot.seq == id.seq => Ok(slot),
            _ => Err(Error::AlreadyFreed),
        }
    }

    pub(crate) fn slot_mut(&mut self, id: HandleId) -> Result<&mut HandleSlot> {
        match self.slots.get_mut(id.key) {
            Some(slot) if slot.seq == id.seq => Ok(slot),
            _ => Err(Error::AlreadyFreed),
        }
    }

    /// The slot of a handle that has not replied yet.
    ///
    /// A handle that already replied, including one retired since, gives `AlreadyCompleted`.
    pub(crate) fn slot_for_output(&self, id: HandleId) -> Result<&HandleSlot> {
        match self.slots.get(id.key) {
            Some(slot) if slot.seq == id.seq => {
                if slot.state >= HandleState::OutputReady {
                    Err(Error::AlreadyCompleted)
                } else {
                    Ok(slot)
                }
            }
            // Sequence numbers are never reused, so an older one has been retired.
            _ if id.seq < self.next_seq => Err(Error::AlreadyCompleted),
            _ => Err(Error::AlreadyFreed),
        }
    }

    /// Move a handle forward. States never go backwards.
    pub(crate) fn advance(&mut self, id: HandleId, to: HandleState) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if to < slot.state {
            return Err(Error::Internal(format!(
                "{} cannot move from {:?} back to {:?}",
                id, slot.state, to
            )));
        }
        tracing::debug!("{} {:?} -> {:?}", id, slot.state, to);
        slot.state = to;
        Ok(())
    }

    /// Run the registered decoder once and cache the record.
    pub(crate) fn decode_input(&mut self, id: HandleId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if slot.input.is_some() {
            return Ok(());
        }
        let entry = slot.entry.as_ref().ok_or(Error::UnknownOp(slot.rpc_id.0))?;
        let mut dec = Decoder::with_peer(&slot.raw_input, slot.peer.clone());
        let input = (entry.decoder)(&mut dec)?;
        dec.finish()?;
        slot.input = Some(input);
        if slot.state == HandleState::Received {
            self.advance(id, HandleState::InputDecoded)?;
        }
        Ok(())
    }

    pub(crate) fn input<T: Clone + 'static>(&mut self, id: HandleId) -> Result<T> {
        self.decode_input(id)?;
        let slot = self.slot(id)?;
        if slot.state >= HandleState::OutputReady {
            return Err(Error::AlreadyCompleted);
        }
        slot.input
            .as_ref()
            .and_then(|input| input.downcast_ref::<T>())
            .cloned()
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "input of {} is not a {}",
                    slot.rpc_id,
                    std::any::type_name::<T>()
                ))
            })
    }

    /// Called once the reply has left: the handle goes through `ReplySent` and is released.
    pub(crate) fn finish(&mut self, id: HandleId) -> Result<()> {
        self.advance(id, HandleState::ReplySent)?;
        self.advance(id, HandleState::Retired)?;
        self.slots.remove(id.key);
        Ok(())
    }

    /// Release a handle whose reply could not be sent. Handles already replying are left to
    /// their send completion.
    pub(crate) fn abandon(&mut self, id: HandleId) -> Result<()> {
        if self.slot(id)?.state >= HandleState::OutputReady {
            return Ok(());
        }
        self.advance(id, HandleState::Retired)?;
        self.slots.remove(id.key);
        Ok(())
    }

    #[inline]
    pub(crate) fn live(&self) -> usize {
        self.slots.len()
    }
}

/// A borrowed view of an in-flight invocation handed to handlers.
pub struct RpcHandle {
    ctx: Context,
    id: HandleId,
    rpc_id: RpcId,
    peer: Address,
}

impl RpcHandle {
    pub(crate) fn new(ctx: Context, id: HandleId, rpc_id: RpcId, peer: Address) -> Self {
        RpcHandle {
            ctx,
            id,
            rpc_id,
            peer,
        }
    }

    #[inline]
    pub fn id(&self) -> HandleId {
        self.id
    }

    #[inline]
    pub fn rpc_id(&self) -> RpcId {
        self.rpc_id
    }

    /// Address of the peer that sent the request.
    #[inline]
    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// The context this handle belongs to. Bulk operations are issued through it.
    #[inline]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn state(&self) -> Result<HandleState> {
        self.ctx.with_handles(|t| t.slot(self.id).map(|s| s.state))
    }

    /// The decoded input record. Repeated calls return equal copies.
    pub fn get_input<T: Clone + 'static>(&self) -> Result<T> {
        self.ctx.with_handles(|t| t.input::<T>(self.id))
    }

    /// Encode `out` and enqueue the reply. The handle must not be used afterwards.
    pub fn start_output<O: Proc + 'static>(&self, out: &O) -> Result<()> {
        self.ctx.submit_output(self.id, Some(out as &dyn Any))
    }

    #[inline]
    pub fn complete<O: Proc + 'static>(&self, out: &O) -> Result<()> {
        self.start_output(out)
    }

    /// Reply with success and an empty payload.
    pub fn complete_empty(&self) -> Result<()> {
        self.ctx.submit_output(self.id, None)
    }
}

impl fmt::Debug for RpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcHandle")
            .field("id", &self.id)
            .field("rpc_id", &self.rpc_id)
            .field("peer", &self.peer)
            .finish()
    }
}
