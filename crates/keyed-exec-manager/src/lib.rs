pub mod config;
pub mod manager;
pub mod metrics;
pub mod observer;
pub mod queue;

pub use config::ManagerConfig;
pub use manager::{Manager, Submission};
pub use metrics::ManagerMetrics;
pub use observer::{ExecutionObserver, NoopObserver};
pub use queue::KeyedQueue;

pub use keyed_exec_core::{
    Action, ActionResult, CancelToken, ExecError, ExecutionState, ExecutionStatus, ItemFailure,
    ItemId, Result, StateSnapshot, WorkItem,
};
