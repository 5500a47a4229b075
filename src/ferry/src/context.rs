//! The progress context.
//!
//! A context drives one network endpoint. Exactly one thread at a time holds the progress
//! token and with it the right to poll the network, dispatch handlers and deliver completions.
//! The holder may re-enter the loop from inside a handler (a wait issued by the handler pumps
//! progress on the same thread); such nesting is counted, and inbound requests are dispatched
//! only while the nesting depth is within `max_handler_depth`. Deeper, they are queued and
//! dispatched in arrival order once the loop unwinds.
//!
//! A thread that needs progress while another thread holds the token sleeps on the condition
//! variable of what it waits for; the holder wakes it when that completes.
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use fnv::FnvHashMap;

use ferry_na::{Address, Completion, Message, MsgKind, NaEvent, NaOpId, NetworkLayer, Tag};
use ferry_util::{Condition, Mutex, MutexGuard, Time};

use crate::bulk::engine::RequestInner;
use crate::client::CallTable;
use crate::envelope::{Reply, Request};
use crate::handle::{HandleId, HandleState, HandleTable, RpcHandle};
use crate::proc::{self, Encoder, ErrorRecord, Proc};
use crate::registry::{
    decoder_for, encoder_for, DecodeFn, DispatchFn, EncodeFn, Entry, Registry, RpcId,
    FINALIZE_NAME,
};
use crate::{Code, ContextConfig, Error, Result};

/// What a network operation was issued for.
pub(crate) enum OpTarget {
    Reply(HandleId),
    Call(Tag),
    Bulk(Weak<RequestInner>, usize),
}

#[derive(Default)]
struct ProgressToken {
    owner: Option<ThreadId>,
    depth: usize,
}

struct ProgressThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct ContextInner {
    config: ContextConfig,
    na: Arc<dyn NetworkLayer>,
    registry: Registry,
    handles: Mutex<HandleTable>,
    ops: Mutex<FnvHashMap<NaOpId, OpTarget>>,
    calls: Mutex<CallTable>,
    calls_cond: Condition,
    backlog: Mutex<VecDeque<Message>>,
    token: Mutex<ProgressToken>,
    token_cond: Condition,
    finalizing: AtomicBool,
    finalized: AtomicBool,
    finalize_count: AtomicUsize,
    next_tag: AtomicU32,
    next_request: AtomicU64,
    progress_thread: Mutex<Option<ProgressThread>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(t) = self.progress_thread.get_mut().take() {
            t.stop.store(true, Ordering::Release);
        }
    }
}

/// Released when the nesting level that acquired it unwinds.
pub(crate) struct ProgressGuard<'a> {
    inner: &'a ContextInner,
    depth: usize,
}

impl<'a> Drop for ProgressGuard<'a> {
    fn drop(&mut self) {
        let mut token = self.inner.token.lock();
        token.depth -= 1;
        if token.depth == 0 {
            token.owner = None;
            self.inner.token_cond.broadcast();
        }
    }
}

/// Timed wait on `cond` that never fails: a poisoned lock is recovered like [`Mutex::lock`]
/// does. Returns the guard and whether `deadline` has passed.
pub(crate) fn wait_until<'a, T>(
    cond: &Condition,
    guard: MutexGuard<'a, T>,
    deadline: Time,
) -> (MutexGuard<'a, T>, bool) {
    match cond.wait_until(guard, deadline) {
        Ok(r) => r,
        Err(e) => (e.into_guard(), false),
    }
}

fn encode_error_reply(record: &ErrorRecord, code: Code, rpc_id: RpcId) -> Result<Vec<u8>> {
    proc::encode(record).and_then(|payload| Reply::encode(code, rpc_id, &payload))
}

fn fatal_oom(what: &str) -> ! {
    tracing::error!("out of memory in the progress loop while {}", what);
    std::process::abort()
}

/// An explicit progress context: registry, handle table, bulk engine and client calls over one
/// network endpoint. Clones share the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(na: Arc<dyn NetworkLayer>, config: ContextConfig) -> Self {
        tracing::info!("context on {} ({}) with {:?}", na.addr_self(), na.name(), config);
        Context {
            inner: Arc::new(ContextInner {
                config,
                na,
                registry: Registry::default(),
                handles: Mutex::new(HandleTable::default()),
                ops: Mutex::new(FnvHashMap::default()),
                calls: Mutex::new(CallTable::default()),
                calls_cond: Condition::new(),
                backlog: Mutex::new(VecDeque::new()),
                token: Mutex::new(ProgressToken::default()),
                token_cond: Condition::new(),
                finalizing: AtomicBool::new(false),
                finalized: AtomicBool::new(false),
                finalize_count: AtomicUsize::new(0),
                next_tag: AtomicU32::new(1),
                next_request: AtomicU64::new(1),
                progress_thread: Mutex::new(None),
            }),
        }
    }

    #[inline]
    pub fn addr_self(&self) -> Address {
        self.inner.na.addr_self()
    }

    #[inline]
    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    #[inline]
    pub(crate) fn na(&self) -> &Arc<dyn NetworkLayer> {
        &self.inner.na
    }

    #[inline]
    pub(crate) fn ops(&self) -> &Mutex<FnvHashMap<NaOpId, OpTarget>> {
        &self.inner.ops
    }

    #[inline]
    pub(crate) fn calls(&self) -> (&Mutex<CallTable>, &Condition) {
        (&self.inner.calls, &self.inner.calls_cond)
    }

    #[inline]
    pub(crate) fn request_counter(&self) -> &AtomicU64 {
        &self.inner.next_request
    }

    #[inline]
    pub(crate) fn next_tag(&self) -> Tag {
        self.inner.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn with_handles<R>(&self, f: impl FnOnce(&mut HandleTable) -> R) -> R {
        f(&mut self.inner.handles.lock())
    }

    /// Number of handles not yet retired.
    pub fn live_handles(&self) -> usize {
        self.inner.handles.lock().live()
    }

    /// Number of finalize requests handled so far.
    pub fn finalize_count(&self) -> usize {
        self.inner.finalize_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_finalizing(&self) -> bool {
        self.inner.finalizing.load(Ordering::Acquire)
    }

    // ---- registry ----

    /// Register a typed operation. The handler reads its input with
    /// [`RpcHandle::get_input::<I>`](RpcHandle::get_input) and replies with an `O`.
    pub fn register<I, O, F>(&self, name: &str, handler: F) -> Result<RpcId>
    where
        I: Proc + Send + 'static,
        O: Proc + 'static,
        F: Fn(&RpcHandle) -> Result<()> + Send + Sync + 'static,
    {
        self.register_raw(name, decoder_for::<I>(), encoder_for::<O>(), Arc::new(handler))
    }

    pub fn register_raw(
        &self,
        name: &str,
        decoder: DecodeFn,
        encoder: EncodeFn,
        dispatcher: DispatchFn,
    ) -> Result<RpcId> {
        self.inner.registry.register(name, decoder, encoder, dispatcher)
    }

    /// Register the finalize control operation.
    ///
    /// Every finalize request bumps [`finalize_count`](Self::finalize_count) and is answered
    /// with an empty reply unless `handler` replies itself.
    pub fn register_finalize<F>(&self, handler: F) -> Result<RpcId>
    where
        F: Fn(&RpcHandle) -> Result<()> + Send + Sync + 'static,
    {
        let dispatcher: DispatchFn = Arc::new(move |h: &RpcHandle| {
            let result = handler(h);
            let count = h.context().inner.finalize_count.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!("finalize {} from {}", count, h.peer());
            result?;
            if h.state()? < HandleState::OutputReady {
                h.complete_empty()?;
            }
            Ok(())
        });
        self.register_raw(FINALIZE_NAME, decoder_for::<()>(), encoder_for::<()>(), dispatcher)
    }

    pub fn lookup(&self, id: RpcId) -> Result<Entry> {
        self.inner.registry.lookup(id)
    }

    // ---- progress ----

    fn try_progress(&self) -> Option<ProgressGuard<'_>> {
        let me = thread::current().id();
        let mut token = self.inner.token.lock();
        match token.owner {
            Some(owner) if owner == me => token.depth += 1,
            None => {
                token.owner = Some(me);
                token.depth = 1;
            }
            Some(_) => return None,
        }
        Some(ProgressGuard {
            inner: &self.inner,
            depth: token.depth,
        })
    }

    /// Drive the context for at most `timeout_ms` milliseconds, returning early once something
    /// observable happened: a handler ran, a reply was sent or received, or a bulk request
    /// finished. Returns `Err(Timeout)` when nothing did.
    pub fn process(&self, timeout_ms: u64) -> Result<()> {
        let deadline = Time::now() + Time::from_millis(timeout_ms);
        let guard = loop {
            if let Some(guard) = self.try_progress() {
                break guard;
            }
            let token = self.inner.token.lock();
            if token.owner.is_some() {
                let (_token, timed_out) = wait_until(&self.inner.token_cond, token, deadline);
                if timed_out {
                    return Err(Error::Timeout);
                }
            }
        };
        loop {
            let n = self.progress_once(&guard, deadline - Time::now())?;
            if n > 0 {
                return Ok(());
            }
            if !Time::now().less(&deadline) {
                return Err(Error::Timeout);
            }
        }
    }

    /// One poll of the network followed by dispatch. Returns the number of observable events.
    fn progress_once(&self, guard: &ProgressGuard<'_>, timeout: Time) -> Result<usize> {
        self.inner.registry.seal();
        let may_dispatch = guard.depth <= self.inner.config.max_handler_depth;
        let timeout = if may_dispatch && !self.inner.backlog.lock().is_empty() {
            Time::ZERO
        } else {
            timeout
        };

        let mut events = Vec::new();
        self.inner.na.progress(timeout.as_duration(), &mut events)?;

        let mut observable = 0;
        for event in events {
            match event {
                NaEvent::Message(msg) if msg.kind == MsgKind::Unexpected => {
                    tracing::trace!("request from {} tag {}", msg.source, msg.tag);
                    let mut backlog = self.inner.backlog.lock();
                    if backlog.try_reserve(1).is_err() {
                        fatal_oom("queueing a request");
                    }
                    backlog.push_back(msg);
                }
                NaEvent::Message(msg) => {
                    if self.deliver_reply(msg) {
                        observable += 1;
                    }
                }
                NaEvent::Completion(c) => {
                    if self.on_completion(c) {
                        observable += 1;
                    }
                }
            }
        }

        if may_dispatch {
            loop {
                // Pop under a short lock; the handler may nest and pop further entries.
                let next = self.inner.backlog.lock().pop_front();
                match next {
                    Some(msg) => {
                        self.dispatch(msg);
                        observable += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(observable)
    }

    fn on_completion(&self, c: Completion) -> bool {
        let target = self.inner.ops.lock().remove(&c.op);
        match target {
            None => {
                tracing::trace!("completion for untracked {}", c.op);
                false
            }
            Some(OpTarget::Reply(id)) => {
                if let Err(e) = &c.result {
                    tracing::error!("reply send for {} failed: {}", id, e);
                }
                if let Err(e) = self.inner.handles.lock().finish(id) {
                    tracing::warn!("finishing {}: {}", id, e);
                }
                true
            }
            Some(OpTarget::Call(tag)) => match c.result {
                Ok(()) => false,
                Err(e) => {
                    self.fail_call(tag, e.into());
                    true
                }
            },
            Some(OpTarget::Bulk(req, index)) => self.bulk_complete(req, index, c.result),
        }
    }

    /// Wait until `ready` yields a value or `timeout_ms` elapses.
    ///
    /// When this thread may drive progress it does so; otherwise it sleeps in `block`, which
    /// must return once woken or once the given deadline passes.
    pub(crate) fn wait_on<T>(
        &self,
        timeout_ms: u64,
        mut ready: impl FnMut() -> Option<T>,
        mut block: impl FnMut(Time),
    ) -> Result<T> {
        let deadline = Time::now() + Time::from_millis(timeout_ms);
        let slice = Time::from_millis(self.inner.config.progress_timeout_ms.max(1));
        loop {
            if let Some(v) = ready() {
                return Ok(v);
            }
            let now = Time::now();
            if !now.less(&deadline) {
                return Err(Error::Timeout);
            }
            let until = std::cmp::min(deadline, now + slice);
            match self.try_progress() {
                Some(guard) => {
                    self.progress_once(&guard, until - Time::now())?;
                }
                None => block(until),
            }
        }
    }

    // ---- server side ----

    fn dispatch(&self, msg: Message) {
        let Message {
            source,
            tag,
            payload,
            ..
        } = msg;

        let (rpc_id, body, header) = match Request::decode(&payload) {
            Ok(req) => (req.rpc_id, req.payload.to_vec(), Ok(())),
            Err(e) => (RpcId(0), Vec::new(), Err(e)),
        };
        let entry = self.inner.registry.lookup(rpc_id);
        let id = self.inner.handles.lock().allocate(
            source.clone(),
            tag,
            rpc_id,
            entry.as_ref().ok().cloned(),
            body,
        );

        if let Err(e) = header {
            tracing::warn!("malformed envelope from {}: {}", source, e);
            return self.reply_error(id, e);
        }
        if self.is_finalizing() {
            tracing::debug!("refusing {} from {} while finalizing", rpc_id, source);
            return self.reply_error(id, Error::Canceled);
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("unknown operation {} from {}", rpc_id, source);
                return self.reply_error(id, e);
            }
        };
        // Bind results first: a guard in an `if let` scrutinee would outlive the reply below.
        let decoded = self.inner.handles.lock().decode_input(id);
        if let Err(e) = decoded {
            tracing::warn!("failed to decode {} input from {}: {}", entry.name, source, e);
            return self.reply_error(id, e);
        }
        let running = self
            .inner
            .handles
            .lock()
            .advance(id, HandleState::HandlerRunning);
        if let Err(e) = running {
            return self.reply_error(id, e);
        }

        let handle = RpcHandle::new(self.clone(), id, rpc_id, source);
        let result = (entry.dispatcher)(&handle);
        let replied = match self.inner.handles.lock().slot(id) {
            Ok(slot) => slot.state >= HandleState::OutputReady,
            // Already retired: the reply went out while the handler kept running.
            Err(_) => true,
        };
        match (replied, result) {
            (false, Err(e)) => {
                tracing::debug!("handler for {} failed: {}", entry.name, e);
                self.reply_error(id, e);
            }
            (false, Ok(())) => {
                tracing::warn!("handler for {} returned without replying", entry.name);
                self.reply_error(
                    id,
                    Error::Internal(format!("handler for {} did not reply", entry.name)),
                );
            }
            (true, Err(e)) => {
                tracing::warn!("handler for {} failed after replying: {}", entry.name, e);
            }
            (true, Ok(())) => {}
        }
    }

    /// Answer `id` with an error envelope carrying the code of `err`.
    fn reply_error(&self, id: HandleId, err: Error) {
        let err = match err {
            Error::OutOfMemory => Error::Internal(String::from("handler ran out of memory")),
            e => e,
        };
        let rpc_id = match self.inner.handles.lock().slot(id) {
            Ok(slot) => slot.rpc_id,
            Err(_) => return,
        };
        let mut record = ErrorRecord::from_error(&err);
        let mut bytes = encode_error_reply(&record, err.code(), rpc_id);
        let max = self.inner.na.msg_max_size();
        if let Ok(encoded) = &bytes {
            if encoded.len() > max {
                let excess = encoded.len() - max;
                record.truncate_message(record.message.len().saturating_sub(excess));
                bytes = encode_error_reply(&record, err.code(), rpc_id);
            }
        }
        let sent = match bytes {
            Ok(bytes) => self.send_reply(id, bytes),
            Err(Error::OutOfMemory) => fatal_oom("encoding an error reply"),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::error!("error reply for {} not sent: {}", id, e);
            // Nobody else will retire it.
            let abandoned = self.inner.handles.lock().abandon(id);
            match abandoned {
                // A failed send already retired it.
                Ok(()) | Err(Error::AlreadyFreed) => {}
                Err(e) => tracing::warn!("abandoning {}: {}", id, e),
            }
        }
    }

    /// Encode a successful reply for `id`. `None` sends an empty payload.
    pub(crate) fn submit_output(&self, id: HandleId, out: Option<&dyn Any>) -> Result<()> {
        let (entry, rpc_id) = {
            let handles = self.inner.handles.lock();
            let slot = handles.slot_for_output(id)?;
            (slot.entry.clone(), slot.rpc_id)
        };
        let mut enc = Encoder::new();
        if let Some(out) = out {
            let entry = entry.ok_or(Error::UnknownOp(rpc_id.0))?;
            (entry.encoder)(out, &mut enc)?;
        }
        let bytes = Reply::encode(Code::Success, rpc_id, enc.as_bytes())?;
        self.send_reply(id, bytes)
    }

    fn send_reply(&self, id: HandleId, bytes: Vec<u8>) -> Result<()> {
        let max = self.inner.na.msg_max_size();
        if bytes.len() > max {
            return Err(Error::EncodeFailed(format!(
                "reply of {} bytes exceeds the {}-byte message limit",
                bytes.len(),
                max
            )));
        }
        let (peer, tag) = {
            let mut handles = self.inner.handles.lock();
            let slot = handles.slot_for_output(id)?;
            let target = (slot.peer.clone(), slot.tag);
            handles.advance(id, HandleState::OutputReady)?;
            target
        };
        let mut ops = self.inner.ops.lock();
        match self.inner.na.msg_send(&peer, MsgKind::Expected, tag, bytes) {
            Ok(op) => {
                ops.insert(op, OpTarget::Reply(id));
                tracing::trace!("reply for {} to {} as {}", id, peer, op);
                Ok(())
            }
            Err(e) => {
                drop(ops);
                tracing::error!("reply for {} to {} failed: {}", id, peer, e);
                let _ = self.inner.handles.lock().finish(id);
                Err(e.into())
            }
        }
    }

    // ---- lifecycle ----

    /// Drive progress on a dedicated thread until [`finalize`](Self::finalize).
    pub fn start_progress_thread(&self) -> Result<()> {
        let mut slot = self.inner.progress_thread.lock();
        if slot.is_some() {
            return Err(Error::InvalidArgument(String::from(
                "a progress thread is already running",
            )));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(&self.inner);
        let timeout_ms = self.inner.config.progress_timeout_ms;
        let handle = thread::Builder::new()
            .name(String::from("ferry-progress"))
            .spawn({
                let stop = Arc::clone(&stop);
                move || {
                    while !stop.load(Ordering::Acquire) {
                        let ctx = match weak.upgrade() {
                            Some(inner) => Context { inner },
                            None => break,
                        };
                        match ctx.process(timeout_ms) {
                            Ok(()) => {}
                            Err(e) if e.is_timeout() => {}
                            Err(e) => {
                                tracing::error!("progress thread stopping: {}", e);
                                break;
                            }
                        }
                    }
                }
            })
            .map_err(|e| Error::Internal(format!("cannot spawn progress thread: {}", e)))?;
        *slot = Some(ProgressThread { stop, handle });
        Ok(())
    }

    fn is_drained(&self) -> bool {
        self.inner.handles.lock().live() == 0
            && self.inner.ops.lock().is_empty()
            && self.inner.backlog.lock().is_empty()
    }

    /// Stop accepting requests, join the progress thread and drain outstanding handles and
    /// transfers, for at most `finalize_timeout_ms`.
    ///
    /// Requests arriving from now on are answered with `Canceled`. Must not be called from a
    /// handler.
    pub fn finalize(&self) -> Result<()> {
        if self.inner.finalized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.finalizing.store(true, Ordering::Release);

        let thread = self.inner.progress_thread.lock().take();
        if let Some(t) = thread {
            if t.handle.thread().id() == thread::current().id() {
                return Err(Error::InvalidArgument(String::from(
                    "finalize called from the progress thread",
                )));
            }
            t.stop.store(true, Ordering::Release);
            t.handle
                .join()
                .map_err(|_| Error::Internal(String::from("progress thread panicked")))?;
        }

        let drained = self.wait_on(
            self.inner.config.finalize_timeout_ms,
            || self.is_drained().then_some(()),
            |until| {
                let token = self.inner.token.lock();
                if token.owner.is_some() {
                    let _ = wait_until(&self.inner.token_cond, token, until);
                }
            },
        );
        match drained {
            Ok(()) => {
                self.inner.finalized.store(true, Ordering::Release);
                tracing::info!(
                    "context on {} finalized after {} finalize requests",
                    self.addr_self(),
                    self.finalize_count()
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "finalize gave up with {} live handles and {} pending operations",
                    self.live_handles(),
                    self.inner.ops.lock().len()
                );
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("addr", &self.addr_self())
            .field("live_handles", &self.live_handles())
            .finish()
    }
}
