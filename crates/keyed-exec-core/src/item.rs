use crate::{Action, CancelToken, ExecError, ExecutionState, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

/// Unique identifier for a work item
pub type ItemId = Uuid;

/// One failed invocation of a work item's action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Item whose action failed
    pub item_id: ItemId,

    /// Zero-based repeat index of the failing invocation
    pub iteration: u32,

    /// Rendered error, or the panic payload if the action panicked
    pub message: String,

    pub panicked: bool,

    pub at: DateTime<Utc>,
}

impl ItemFailure {
    pub fn new(item_id: ItemId, iteration: u32, message: String, panicked: bool) -> Self {
        ItemFailure {
            item_id,
            iteration,
            message,
            panicked,
            at: Utc::now(),
        }
    }
}

/// A single schedulable unit: an action run `repeat` times with `delay`
/// after every run.
pub struct WorkItem<T> {
    /// Unique item identifier
    pub id: ItemId,

    /// Owning key, assigned when the item is submitted
    key: Option<String>,

    action: Action<T>,

    repeat: u32,

    delay: Duration,

    failures: Vec<ItemFailure>,
}

impl<T> WorkItem<T> {
    /// Create an item that runs once with no delay
    pub fn new(action: Action<T>) -> Self {
        WorkItem {
            id: Uuid::new_v4(),
            key: None,
            action,
            repeat: 1,
            delay: Duration::ZERO,
            failures: Vec::new(),
        }
    }

    pub fn builder(action: Action<T>) -> WorkItemBuilder<T> {
        WorkItemBuilder::new(action)
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Bind the item to the key whose queue it is entering
    pub fn set_key(&mut self, key: impl Into<String>) {
        self.key = Some(key.into());
    }

    pub fn action(&self) -> &Action<T> {
        &self.action
    }

    pub fn repeat(&self) -> u32 {
        self.repeat
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Failures captured so far by this item
    pub fn failures(&self) -> &[ItemFailure] {
        &self.failures
    }

    pub fn take_failures(&mut self) -> Vec<ItemFailure> {
        std::mem::take(&mut self.failures)
    }

    /// Run the action `repeat` times. See [`execute_with`](Self::execute_with).
    pub fn execute(&mut self, state: &ExecutionState, cancel: &CancelToken) -> u32 {
        self.execute_with(state, cancel, |_| {})
    }

    /// Run the action `repeat` times, calling `on_repeat` with the iteration
    /// index after each invocation.
    ///
    /// Errors and panics raised by the action are recorded as failures and
    /// never stop the loop. The delay is slept after every invocation,
    /// including the last. Cancellation is checked before each invocation and
    /// cuts a pending delay short. Returns how many invocations ran.
    pub fn execute_with<F>(
        &mut self,
        state: &ExecutionState,
        cancel: &CancelToken,
        mut on_repeat: F,
    ) -> u32
    where
        F: FnMut(u32),
    {
        let mut invoked = 0;

        for iteration in 0..self.repeat {
            if cancel.is_cancelled() {
                debug!("Item {} cancelled before iteration {}", self.id, iteration);
                break;
            }

            let action = &mut self.action;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| action.invoke(state)));
            invoked += 1;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        key = state.id(),
                        item_id = %self.id,
                        iteration,
                        "Action failed: {:#}",
                        e
                    );
                    self.failures
                        .push(ItemFailure::new(self.id, iteration, format!("{:#}", e), false));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(
                        key = state.id(),
                        item_id = %self.id,
                        iteration,
                        "Action panicked: {}",
                        message
                    );
                    self.failures
                        .push(ItemFailure::new(self.id, iteration, message, true));
                }
            }

            on_repeat(iteration);

            if !self.delay.is_zero() && cancel.sleep(self.delay) {
                debug!("Item {} cancelled during delay", self.id);
                break;
            }
        }

        invoked
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("action", &self.action)
            .field("repeat", &self.repeat)
            .field("delay", &self.delay)
            .field("failures", &self.failures.len())
            .finish()
    }
}

/// Render a `catch_unwind` payload as a failure message
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: unknown payload".to_string()
    }
}

/// Builder for work items with custom repeat and delay
pub struct WorkItemBuilder<T> {
    action: Action<T>,
    repeat: u32,
    delay: Duration,
}

impl<T> WorkItemBuilder<T> {
    pub fn new(action: Action<T>) -> Self {
        WorkItemBuilder {
            action,
            repeat: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn build(self) -> Result<WorkItem<T>> {
        if self.repeat == 0 {
            return Err(ExecError::InvalidArgument(
                "repeat must be at least 1".to_string(),
            ));
        }

        let mut item = WorkItem::new(self.action);
        item.repeat = self.repeat;
        item.delay = self.delay;
        Ok(item)
    }
}
