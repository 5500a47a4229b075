//! RPC runtime with out-of-band bulk memory transfer.
//!
//! A [`Context`] owns one network endpoint, a registry of operations and a table of in-flight
//! server-side handles. Small request and reply envelopes travel as messages; large buffers
//! are described by a [`BulkDescriptor`] embedded in the request and moved with one-sided
//! transfers issued by the handler.
//!
//! All handler dispatch, decoding and bulk progress of a context happen on whichever thread is
//! currently driving [`Context::process`]. Waits issued from inside a handler pump that same
//! loop, so a handler blocked on a transfer never stalls the rest of the context.
pub extern crate tracing;
// alias
pub extern crate tracing as log;

pub mod bulk;
pub mod client;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod handle;
pub mod proc;
pub mod registry;

pub use bulk::{BulkAccess, BulkDescriptor, BulkOp, BulkRequest, BulkStatus, LocalSegment, Segment};
pub use client::Call;
pub use config::ContextConfig;
pub use context::Context;
pub use error::{Code, Error, Result};
pub use handle::{HandleId, HandleState, RpcHandle};
pub use proc::{Decoder, Encoder, ErrorRecord, Proc};
pub use registry::{rpc_id, RpcId, FINALIZE_NAME};

pub use ferry_na::{Address, MemBuffer, NetworkLayer};
