//! Out-of-band bulk transfer.
//!
//! A [`BulkDescriptor`] names a registered memory region; its serialized form travels inside an
//! RPC input so the receiver can reach the region with one-sided transfers. The engine splits a
//! logical transfer into per-segment pieces and tracks them as one [`BulkRequest`].
pub mod descriptor;
pub mod engine;

pub use descriptor::{BulkAccess, BulkDescriptor, LocalSegment, Segment};
pub use engine::{BulkOp, BulkRequest, BulkStatus};
