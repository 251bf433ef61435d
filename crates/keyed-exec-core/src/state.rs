use crate::{ExecError, ExecutionStatus, ItemFailure, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Observable record for one key.
///
/// The key's worker advances status, timestamps, queue depth and failures.
/// Any caller thread may read those and may read or write checkpoints and
/// the value bag. Every field sits behind one lock so the two sides never
/// see a half-applied update.
pub struct ExecutionState {
    id: String,
    inner: Mutex<StateInner>,
    changed: Condvar,
}

#[derive(Default)]
struct StateInner {
    status: ExecutionStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    current_queue_depth: usize,
    checkpoints: HashMap<i32, DateTime<Utc>>,
    values: HashMap<String, Value>,
    failures: Vec<ItemFailure>,
}

/// Point-in-time copy of an [`ExecutionState`], suitable for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_queue_depth: usize,
    pub checkpoints: BTreeMap<i32, DateTime<Utc>>,
    pub values: BTreeMap<String, Value>,
    pub failures: Vec<ItemFailure>,
}

impl ExecutionState {
    /// Create a state in `Ready` for the given key
    pub fn new(id: impl Into<String>) -> Self {
        ExecutionState {
            id: id.into(),
            inner: Mutex::new(StateInner::default()),
            changed: Condvar::new(),
        }
    }

    /// The key this state belongs to
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.inner.lock().status
    }

    /// Transition to `status`.
    ///
    /// Entering `Started` stamps `started_at` and clears failures from the
    /// previous cycle. Entering `Completed` or `Aborted` stamps `finished_at`.
    pub fn set_status(&self, status: ExecutionStatus) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        match status {
            ExecutionStatus::Started => {
                inner.started_at = Some(now);
                inner.failures.clear();
            }
            ExecutionStatus::Completed | ExecutionStatus::Aborted => {
                inner.finished_at = Some(now);
            }
            ExecutionStatus::Ready | ExecutionStatus::Executing => {}
        }
        inner.status = status;
        drop(inner);
        self.changed.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().finished_at
    }

    /// Items left (including the one about to run) when the worker last looked
    pub fn current_queue_depth(&self) -> usize {
        self.inner.lock().current_queue_depth
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.inner.lock().current_queue_depth = depth;
    }

    /// Stamp `marker` with the current time and return the stamp
    pub fn set_checkpoint(&self, marker: i32) -> DateTime<Utc> {
        let now = Utc::now();
        self.inner.lock().checkpoints.insert(marker, now);
        now
    }

    pub fn checkpoint(&self, marker: i32) -> Option<DateTime<Utc>> {
        self.inner.lock().checkpoints.get(&marker).copied()
    }

    /// `(checkpoint[m1] - checkpoint[m2]) / divisor`
    pub fn checkpoint_delta(&self, m1: i32, m2: i32, divisor: i32) -> Result<chrono::Duration> {
        if divisor == 0 {
            return Err(ExecError::InvalidArgument(
                "checkpoint divisor must be non-zero".to_string(),
            ));
        }

        let inner = self.inner.lock();
        let first = inner
            .checkpoints
            .get(&m1)
            .ok_or(ExecError::InvalidCheckpoint(m1))?;
        let second = inner
            .checkpoints
            .get(&m2)
            .ok_or(ExecError::InvalidCheckpoint(m2))?;

        Ok((*first - *second) / divisor)
    }

    pub fn checkpoint_elapsed(&self, m1: i32, m2: i32) -> Result<chrono::Duration> {
        self.checkpoint_delta(m1, m2, 1)
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner.lock().values.get(key).cloned()
    }

    /// Store `value` under `key`, returning whatever was there before
    pub fn set_value(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.lock().values.insert(key.into(), value.into())
    }

    pub fn remove_value(&self, key: &str) -> Option<Value> {
        self.inner.lock().values.remove(key)
    }

    pub fn failures(&self) -> Vec<ItemFailure> {
        self.inner.lock().failures.clone()
    }

    pub fn failure_count(&self) -> usize {
        self.inner.lock().failures.len()
    }

    /// Append failures captured by a finished work item
    pub fn record_failures<I>(&self, failures: I)
    where
        I: IntoIterator<Item = ItemFailure>,
    {
        self.inner.lock().failures.extend(failures);
    }

    /// Block until the state is `Completed` or `Aborted`, or until `timeout`
    /// elapses. Returns whether the state finished in time.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        while !inner.status.is_finished() {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.status.is_finished();
            }
        }

        true
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            id: self.id.clone(),
            status: inner.status,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
            current_queue_depth: inner.current_queue_depth,
            checkpoints: inner.checkpoints.iter().map(|(k, v)| (*k, *v)).collect(),
            values: inner
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            failures: inner.failures.clone(),
        }
    }
}

impl std::fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ExecutionState")
            .field("id", &self.id)
            .field("status", &inner.status)
            .field("current_queue_depth", &inner.current_queue_depth)
            .field("failures", &inner.failures.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use uuid::Uuid;

    fn failure(iteration: u32) -> ItemFailure {
        ItemFailure::new(Uuid::new_v4(), iteration, "boom".to_string(), false)
    }

    #[test]
    fn test_new_state_is_ready() {
        let state = ExecutionState::new("device-1");

        assert_eq!(state.id(), "device-1");
        assert_eq!(state.status(), ExecutionStatus::Ready);
        assert!(state.started_at().is_none());
        assert!(state.finished_at().is_none());
        assert!(!state.is_finished());
    }

    #[test]
    fn test_status_timestamps() {
        let state = ExecutionState::new("k");

        state.set_status(ExecutionStatus::Started);
        assert!(state.started_at().is_some());
        assert!(state.finished_at().is_none());

        state.set_status(ExecutionStatus::Executing);
        assert!(!state.is_finished());

        state.set_status(ExecutionStatus::Completed);
        assert!(state.finished_at().is_some());
        assert!(state.is_finished());
        assert!(state.finished_at() >= state.started_at());
    }

    #[test]
    fn test_started_clears_previous_failures() {
        let state = ExecutionState::new("k");
        state.set_status(ExecutionStatus::Started);
        state.record_failures(vec![failure(0), failure(1)]);
        assert_eq!(state.failure_count(), 2);

        state.set_status(ExecutionStatus::Completed);
        assert_eq!(state.failure_count(), 2);

        state.set_status(ExecutionStatus::Started);
        assert_eq!(state.failure_count(), 0);
    }

    #[test]
    fn test_checkpoint_delta() {
        let state = ExecutionState::new("k");
        state.set_checkpoint(1);
        thread::sleep(Duration::from_millis(50));
        state.set_checkpoint(2);

        let delta = state.checkpoint_elapsed(2, 1).unwrap();
        assert!(delta.num_milliseconds() >= 50);
        assert!(delta.num_milliseconds() < 1000);

        let halved = state.checkpoint_delta(2, 1, 2).unwrap();
        assert_eq!(halved, delta / 2);

        let reversed = state.checkpoint_elapsed(1, 2).unwrap();
        assert!(reversed < chrono::Duration::zero());
    }

    #[test]
    fn test_checkpoint_missing_marker() {
        let state = ExecutionState::new("k");
        state.set_checkpoint(1);

        match state.checkpoint_elapsed(1, 7) {
            Err(ExecError::InvalidCheckpoint(7)) => {}
            other => panic!("Expected InvalidCheckpoint(7), got {:?}", other),
        }
        match state.checkpoint_elapsed(9, 1) {
            Err(ExecError::InvalidCheckpoint(9)) => {}
            other => panic!("Expected InvalidCheckpoint(9), got {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_zero_divisor() {
        let state = ExecutionState::new("k");
        state.set_checkpoint(1);
        state.set_checkpoint(2);

        assert!(matches!(
            state.checkpoint_delta(2, 1, 0),
            Err(ExecError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_value_bag() {
        let state = ExecutionState::new("k");

        assert!(state.value("missing").is_none());
        assert!(state.set_value("port", 8080).is_none());
        assert_eq!(state.value("port"), Some(Value::from(8080)));

        let previous = state.set_value("port", "COM3");
        assert_eq!(previous, Some(Value::from(8080)));
        assert_eq!(state.remove_value("port"), Some(Value::from("COM3")));
        assert!(state.value("port").is_none());
    }

    #[test]
    fn test_concurrent_value_writes() {
        let state = Arc::new(ExecutionState::new("k"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                thread::spawn(move || {
                    state.set_value(format!("writer-{}", i), i);
                    state.set_checkpoint(i);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = state.snapshot();
        assert_eq!(snapshot.values.len(), 8);
        assert_eq!(snapshot.checkpoints.len(), 8);
    }

    #[test]
    fn test_wait_finished() {
        let state = Arc::new(ExecutionState::new("k"));
        state.set_status(ExecutionStatus::Started);

        assert!(!state.wait_finished(Duration::from_millis(20)));

        let worker = {
            let state = state.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                state.set_status(ExecutionStatus::Completed);
            })
        };

        assert!(state.wait_finished(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn test_snapshot_serializes() {
        let state = ExecutionState::new("k");
        state.set_status(ExecutionStatus::Started);
        state.set_value("note", "hello");
        state.set_checkpoint(3);

        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["id"], "k");
        assert_eq!(json["status"], "started");
        assert_eq!(json["values"]["note"], "hello");
    }
}
