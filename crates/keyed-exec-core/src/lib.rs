mod action;
mod cancel;
mod error;
mod item;
mod state;
mod status;

pub use action::{Action, ActionResult};
pub use cancel::CancelToken;
pub use error::{ExecError, Result};
pub use item::{panic_message, ItemFailure, ItemId, WorkItem, WorkItemBuilder};
pub use state::{ExecutionState, StateSnapshot};
pub use status::ExecutionStatus;

/// Default bound on queued items per key.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1;
