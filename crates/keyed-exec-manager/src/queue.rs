use crate::metrics::ManagerMetrics;
use crate::observer::ExecutionObserver;
use keyed_exec_core::{
    panic_message, CancelToken, ExecError, ExecutionState, ExecutionStatus, Result, WorkItem,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every queue of one manager
pub(crate) struct WorkerEnv {
    pub observer: Arc<dyn ExecutionObserver>,
    pub metrics: Arc<ManagerMetrics>,
    pub thread_name_prefix: String,
}

/// Result of offering an item to a queue
pub(crate) enum EnqueueOutcome<T> {
    Accepted,
    Rejected { depth: usize },
    /// The queue was pruned from the registry; the caller must look up a
    /// fresh one and retry with the returned item.
    Retired(WorkItem<T>),
}

/// FIFO of work items for one key, with its state and at most one worker.
pub struct KeyedQueue<T> {
    key: String,
    state: Arc<ExecutionState>,
    inner: Mutex<QueueInner<T>>,
    env: Arc<WorkerEnv>,
}

struct QueueInner<T> {
    pending: VecDeque<WorkItem<T>>,
    /// The head item has been taken by the worker and is still running
    executing: bool,
    worker: Option<WorkerHandle>,
    cycles: u64,
    retired: bool,
}

struct WorkerHandle {
    cycle: u64,
    cancel: CancelToken,
}

impl<T> QueueInner<T> {
    fn len(&self) -> usize {
        self.pending.len() + usize::from(self.executing)
    }
}

impl<T: Send + 'static> KeyedQueue<T> {
    pub(crate) fn new(key: &str, env: Arc<WorkerEnv>) -> Self {
        KeyedQueue {
            key: key.to_string(),
            state: Arc::new(ExecutionState::new(key)),
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                executing: false,
                worker: None,
                cycles: 0,
                retired: false,
            }),
            env,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> &Arc<ExecutionState> {
        &self.state
    }

    /// Waiting items plus the one currently executing
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when no worker holds this queue
    pub fn is_idle(&self) -> bool {
        self.inner.lock().worker.is_none()
    }

    /// Number of drain cycles started so far
    pub fn cycles(&self) -> u64 {
        self.inner.lock().cycles
    }

    /// Append `item` if the queue holds fewer than `max_queue_size` items,
    /// starting a worker when none is running. Admission, append and worker
    /// start happen under one lock.
    pub(crate) fn enqueue(
        self: &Arc<Self>,
        mut item: WorkItem<T>,
        max_queue_size: usize,
    ) -> Result<EnqueueOutcome<T>> {
        let mut inner = self.inner.lock();

        if inner.retired {
            return Ok(EnqueueOutcome::Retired(item));
        }

        let depth = inner.len();
        if depth >= max_queue_size {
            return Ok(EnqueueOutcome::Rejected { depth });
        }

        item.set_key(self.key.as_str());
        debug!("Enqueued item {} for key {} at depth {}", item.id, self.key, depth);
        inner.pending.push_back(item);

        let worker_cancelled = inner.worker.as_ref().map(|w| w.cancel.is_cancelled());
        match worker_cancelled {
            None => {
                if let Err(e) = self.spawn_worker(&mut inner) {
                    inner.pending.pop_back();
                    return Err(e);
                }
            }
            // A terminated worker is still winding down; it hands the queue
            // to a fresh cycle on exit. Move off Aborted now so waiters block.
            Some(true) => self.state.set_status(ExecutionStatus::Started),
            Some(false) => {}
        }

        Ok(EnqueueOutcome::Accepted)
    }

    /// Start a worker unless one is already running or nothing is queued
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.worker.is_some() || inner.pending.is_empty() {
            return Ok(());
        }
        self.spawn_worker(&mut inner)
    }

    /// Cancel the running drain cycle and discard everything still waiting.
    ///
    /// Fails if the key never started. A completed key is left untouched.
    /// The in-flight action, if any, is not interrupted; the worker stops at
    /// its next cancellation check.
    pub fn terminate(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        match self.state.status() {
            ExecutionStatus::Ready => Err(ExecError::InvalidOperation(format!(
                "worker for key {} was never started",
                self.key
            ))),
            ExecutionStatus::Completed => {
                debug!("Terminate on completed key {} ignored", self.key);
                Ok(())
            }
            ExecutionStatus::Aborted if inner.worker.is_none() => {
                debug!("Terminate on aborted key {} ignored", self.key);
                Ok(())
            }
            _ => {
                if let Some(worker) = &inner.worker {
                    worker.cancel.cancel();
                }
                let discarded = inner.pending.len();
                inner.pending.clear();
                self.state.set_status(ExecutionStatus::Aborted);
                self.env.metrics.terminations_total.inc();
                warn!("Terminated key {} ({} pending items discarded)", self.key, discarded);
                Ok(())
            }
        }
    }

    /// Mark the queue as removed from the registry if it is idle, empty and
    /// finished. Returns whether it was retired.
    pub(crate) fn retire_if_finished(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.worker.is_none() && inner.len() == 0 && self.state.is_finished() {
            inner.retired = true;
        }
        inner.retired
    }

    /// Must be called with the queue lock held and no worker active.
    fn spawn_worker(self: &Arc<Self>, inner: &mut QueueInner<T>) -> Result<()> {
        let cycle = inner.cycles + 1;
        let cancel = CancelToken::new();
        let name = format!("{}-{}", self.env.thread_name_prefix, self.key).replace('\0', "");

        let queue = Arc::clone(self);
        let token = cancel.clone();
        thread::Builder::new()
            .name(name)
            .spawn(move || queue.run_worker(token, cycle))?;

        // The worker blocks on the queue lock until we return, so it always
        // observes Started before moving on.
        inner.cycles = cycle;
        inner.worker = Some(WorkerHandle { cycle, cancel });
        self.state.set_status(ExecutionStatus::Started);
        self.env.metrics.workers_active.inc();
        Ok(())
    }

    fn run_worker(self: Arc<Self>, cancel: CancelToken, cycle: u64) {
        let env = Arc::clone(&self.env);
        info!("Worker for key {} started (cycle {})", self.key, cycle);
        self.notify("on_worker_started", || env.observer.on_worker_started(&self.key));

        let mut first = true;
        loop {
            let mut item = {
                let mut inner = self.inner.lock();
                inner.executing = false;

                if cancel.is_cancelled() {
                    self.retire_cancelled(&mut inner, cycle);
                    drop(inner);
                    self.notify("on_drained", || {
                        env.observer.on_drained(&self.key, ExecutionStatus::Aborted)
                    });
                    return;
                }

                if first {
                    self.state.set_status(ExecutionStatus::Executing);
                    first = false;
                }

                match inner.pending.pop_front() {
                    Some(item) => {
                        inner.executing = true;
                        self.state.set_queue_depth(inner.pending.len() + 1);
                        item
                    }
                    None => {
                        inner.worker = None;
                        self.state.set_queue_depth(0);
                        self.state.set_status(ExecutionStatus::Completed);
                        drop(inner);

                        env.metrics.workers_active.dec();
                        info!("Worker for key {} drained queue (cycle {})", self.key, cycle);
                        self.notify("on_drained", || {
                            env.observer.on_drained(&self.key, ExecutionStatus::Completed)
                        });
                        return;
                    }
                }
            };

            let item_id = item.id;
            debug!(
                "Key {} executing item {} ({} x{})",
                self.key,
                item_id,
                item.action().shape(),
                item.repeat()
            );
            self.notify("on_item_started", || env.observer.on_item_started(&self.key, item_id));

            item.execute_with(&self.state, &cancel, |iteration| {
                self.notify("on_repeat", || {
                    env.observer.on_repeat(&self.key, item_id, iteration)
                })
            });

            let failures = item.take_failures();
            env.metrics.observe_item(failures.len());
            self.notify("on_item_completed", || {
                env.observer.on_item_completed(&self.key, item_id, &failures)
            });
            self.state.record_failures(failures);
        }
    }

    /// Run an observer hook; a panic inside it is logged and swallowed.
    fn notify(&self, hook: &str, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            error!(
                "Observer hook {} for key {} panicked: {}",
                hook,
                self.key,
                panic_message(payload.as_ref())
            );
        }
    }

    /// Retire a cancelled worker. Items submitted after the abort get a
    /// fresh drain cycle so the key never has two workers.
    fn retire_cancelled(self: &Arc<Self>, inner: &mut QueueInner<T>, cycle: u64) {
        inner.worker = None;
        self.env.metrics.workers_active.dec();
        info!("Worker for key {} stopped by terminate (cycle {})", self.key, cycle);

        if inner.pending.is_empty() {
            return;
        }

        if let Err(e) = self.spawn_worker(inner) {
            error!("Failed to restart worker for key {}: {}", self.key, e);
            inner.pending.clear();
            self.state.set_status(ExecutionStatus::Aborted);
        }
    }
}

impl<T> std::fmt::Debug for KeyedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("KeyedQueue")
            .field("key", &self.key)
            .field("len", &inner.len())
            .field("worker_cycle", &inner.worker.as_ref().map(|w| w.cycle))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use keyed_exec_core::Action;
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_env() -> Arc<WorkerEnv> {
        Arc::new(WorkerEnv {
            observer: Arc::new(NoopObserver),
            metrics: Arc::new(ManagerMetrics::new().unwrap()),
            thread_name_prefix: "kx-test".to_string(),
        })
    }

    fn accepted(outcome: Result<EnqueueOutcome<u32>>) -> bool {
        matches!(outcome, Ok(EnqueueOutcome::Accepted))
    }

    #[test]
    fn test_enqueue_runs_item_and_completes() {
        let queue = Arc::new(KeyedQueue::new("k", test_env()));
        let (tx, rx) = mpsc::channel();

        let item = WorkItem::new(Action::with_arg(5u32, move |n| {
            tx.send(*n).unwrap();
            Ok(())
        }));
        assert!(accepted(queue.enqueue(item, 1)));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 5);
        assert!(queue.state().wait_finished(Duration::from_secs(5)));
        assert_eq!(queue.state().status(), ExecutionStatus::Completed);
        assert!(queue.is_empty());
        assert!(queue.is_idle());
        assert_eq!(queue.cycles(), 1);
    }

    #[test]
    fn test_executing_item_counts_toward_depth() {
        let queue = Arc::new(KeyedQueue::new("k", test_env()));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let item = WorkItem::new(Action::plain(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok(())
        }));
        assert!(accepted(queue.enqueue(item, 1)));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(queue.len(), 1);
        let second = WorkItem::new(Action::plain(|| Ok(())));
        assert!(matches!(
            queue.enqueue(second, 1),
            Ok(EnqueueOutcome::Rejected { depth: 1 })
        ));

        release_tx.send(()).unwrap();
        assert!(queue.state().wait_finished(Duration::from_secs(5)));
    }

    #[test]
    fn test_start_is_noop_when_empty() {
        let queue: Arc<KeyedQueue<u32>> = Arc::new(KeyedQueue::new("k", test_env()));
        queue.start().unwrap();

        assert!(queue.is_idle());
        assert_eq!(queue.cycles(), 0);
        assert_eq!(queue.state().status(), ExecutionStatus::Ready);
    }

    #[test]
    fn test_terminate_before_start_fails() {
        let queue: Arc<KeyedQueue<u32>> = Arc::new(KeyedQueue::new("k", test_env()));
        assert!(matches!(
            queue.terminate(),
            Err(ExecError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_retired_queue_hands_item_back() {
        let queue = Arc::new(KeyedQueue::new("k", test_env()));
        assert!(accepted(queue.enqueue(WorkItem::new(Action::plain(|| Ok(()))), 1)));
        assert!(queue.state().wait_finished(Duration::from_secs(5)));
        assert!(queue.is_idle());

        assert!(queue.retire_if_finished());
        let item = WorkItem::new(Action::plain(|| Ok(())));
        assert!(matches!(
            queue.enqueue(item, 1),
            Ok(EnqueueOutcome::Retired(_))
        ));
    }
}
