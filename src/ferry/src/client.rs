//! Initiator side: send a request and wait for its reply.
use fnv::FnvHashMap;

use ferry_na::{Address, Message, MsgKind, Tag};

use crate::context::{wait_until, Context, OpTarget};
use crate::envelope::{Reply, Request};
use crate::proc::{self, ErrorRecord, Proc};
use crate::registry::RpcId;
use crate::{Code, Error, Result};

pub(crate) enum CallState {
    Pending,
    Replied(Vec<u8>),
    Failed(Error),
}

pub(crate) type CallTable = FnvHashMap<Tag, CallState>;

/// An outstanding request. Replies are matched by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    tag: Tag,
    rpc_id: RpcId,
    dest: Address,
}

impl Call {
    #[inline]
    pub fn rpc_id(&self) -> RpcId {
        self.rpc_id
    }

    #[inline]
    pub fn dest(&self) -> &Address {
        &self.dest
    }
}

impl Context {
    /// Send an encoded input to `dest`.
    pub fn forward_raw(&self, dest: &Address, rpc_id: RpcId, payload: &[u8]) -> Result<Call> {
        let bytes = Request::encode(rpc_id, payload)?;
        let max = self.na().msg_max_size();
        if bytes.len() > max {
            return Err(Error::EncodeFailed(format!(
                "request of {} bytes exceeds the {}-byte message limit",
                bytes.len(),
                max
            )));
        }
        let tag = self.next_tag();
        let (calls, _) = self.calls();
        calls.lock().insert(tag, CallState::Pending);

        let mut ops = self.ops().lock();
        match self.na().msg_send(dest, MsgKind::Unexpected, tag, bytes) {
            Ok(op) => {
                ops.insert(op, OpTarget::Call(tag));
                tracing::trace!("forward {} to {} tag {} as {}", rpc_id, dest, tag, op);
                Ok(Call {
                    tag,
                    rpc_id,
                    dest: dest.clone(),
                })
            }
            Err(e) => {
                drop(ops);
                calls.lock().remove(&tag);
                Err(e.into())
            }
        }
    }

    pub fn forward<I: Proc>(&self, dest: &Address, rpc_id: RpcId, input: &I) -> Result<Call> {
        let payload = proc::encode(input)?;
        self.forward_raw(dest, rpc_id, &payload)
    }

    /// Wait for the reply payload. A nonzero reply status becomes [`Error::Remote`].
    ///
    /// After a timeout the call stays outstanding and may be waited on again; once a reply has
    /// been returned the call is consumed.
    pub fn wait_reply_raw(&self, call: &Call, timeout_ms: u64) -> Result<Vec<u8>> {
        let (calls, cond) = self.calls();
        let state = self.wait_on(
            timeout_ms,
            || {
                let mut calls = calls.lock();
                match calls.remove(&call.tag) {
                    Some(CallState::Pending) => {
                        calls.insert(call.tag, CallState::Pending);
                        None
                    }
                    Some(done) => Some(done),
                    None => Some(CallState::Failed(Error::AlreadyCompleted)),
                }
            },
            |until| {
                let guard = calls.lock();
                if matches!(guard.get(&call.tag), Some(CallState::Pending)) {
                    let _ = wait_until(cond, guard, until);
                }
            },
        )?;

        let bytes = match state {
            CallState::Replied(bytes) => bytes,
            CallState::Failed(e) => return Err(e),
            CallState::Pending => return Err(Error::Internal(String::from("call still pending"))),
        };
        let reply = Reply::decode(&bytes)?;
        if reply.rpc_id != call.rpc_id {
            return Err(Error::DecodeFailed(format!(
                "reply names {} but the call was {}",
                reply.rpc_id, call.rpc_id
            )));
        }
        if reply.status != Code::Success {
            let record: ErrorRecord = proc::decode(reply.payload, None)?;
            return Err(Error::Remote {
                code: reply.status,
                message: record.message,
            });
        }
        Ok(reply.payload.to_vec())
    }

    /// Wait for the reply and decode it. Descriptors in the output are bound to the callee.
    pub fn wait_reply<O: Proc>(&self, call: &Call, timeout_ms: u64) -> Result<O> {
        let payload = self.wait_reply_raw(call, timeout_ms)?;
        proc::decode(&payload, Some(&call.dest))
    }

    /// Forward and wait in one step.
    pub fn call<I: Proc, O: Proc>(
        &self,
        dest: &Address,
        rpc_id: RpcId,
        input: &I,
        timeout_ms: u64,
    ) -> Result<O> {
        let call = self.forward(dest, rpc_id, input)?;
        self.wait_reply(&call, timeout_ms)
    }

    /// Hand an expected message to its call. Returns false for unknown or stale tags.
    pub(crate) fn deliver_reply(&self, msg: Message) -> bool {
        let (calls, cond) = self.calls();
        let mut calls = calls.lock();
        match calls.get_mut(&msg.tag) {
            Some(state @ CallState::Pending) => {
                tracing::trace!("reply from {} tag {}", msg.source, msg.tag);
                *state = CallState::Replied(msg.payload);
                cond.broadcast();
                true
            }
            _ => {
                tracing::warn!("dropping reply from {} with unknown tag {}", msg.source, msg.tag);
                false
            }
        }
    }

    pub(crate) fn fail_call(&self, tag: Tag, err: Error) {
        let (calls, cond) = self.calls();
        let mut calls = calls.lock();
        if let Some(state @ CallState::Pending) = calls.get_mut(&tag) {
            tracing::warn!("request tag {} failed: {}", tag, err);
            *state = CallState::Failed(err);
            cond.broadcast();
        }
    }
}
