//! Batching, transport and replay of point changes.

mod batch;
mod coordinator;
mod transport;
mod view;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{
  fingerprint, BatchRequestItem, BatchResponse, ItemUpdate, PendingBatchItem, Target, TargetKind,
};
pub use coordinator::{SyncCoordinator, SyncStatus};
pub use transport::{BatchTransport, HttpTransport, FINGERPRINT_HEADER};
pub use view::{apply_update, MemoryPointsView, PointsView};
