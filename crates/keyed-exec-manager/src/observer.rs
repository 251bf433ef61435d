//! Lifecycle hooks for key workers.

use keyed_exec_core::{ExecutionStatus, ItemFailure, ItemId};

/// Receives worker lifecycle events.
///
/// Every method has an empty default, so implementors override only what
/// they need. Hooks run on the key's worker thread outside any queue lock;
/// a slow hook delays that key and nothing else.
pub trait ExecutionObserver: Send + Sync {
    /// A drain cycle began for `key`
    fn on_worker_started(&self, _key: &str) {}

    /// An item was taken off the queue and is about to run
    fn on_item_started(&self, _key: &str, _item_id: ItemId) {}

    /// One invocation of an item's action returned
    fn on_repeat(&self, _key: &str, _item_id: ItemId, _iteration: u32) {}

    /// An item finished all of its invocations (or was cut short by cancel)
    fn on_item_completed(&self, _key: &str, _item_id: ItemId, _failures: &[ItemFailure]) {}

    /// The worker for `key` retired with `status`
    fn on_drained(&self, _key: &str, _status: ExecutionStatus) {}
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}
