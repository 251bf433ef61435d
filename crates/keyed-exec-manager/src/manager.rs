use crate::config::ManagerConfig;
use crate::metrics::ManagerMetrics;
use crate::observer::{ExecutionObserver, NoopObserver};
use crate::queue::{EnqueueOutcome, KeyedQueue, WorkerEnv};
use dashmap::DashMap;
use keyed_exec_core::{Action, ActionResult, ExecError, ExecutionState, Result, WorkItem};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happened when work was submitted.
#[derive(Debug, Clone)]
pub enum Submission {
    /// Item queued; the key's state can be polled or waited on.
    Accepted(Arc<ExecutionState>),
    /// The key already holds `max_queue_size` items.
    Rejected { key: String, depth: usize },
}

impl Submission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Submission::Accepted(_))
    }

    pub fn state(&self) -> Option<&Arc<ExecutionState>> {
        match self {
            Submission::Accepted(state) => Some(state),
            Submission::Rejected { .. } => None,
        }
    }

    pub fn into_state(self) -> Option<Arc<ExecutionState>> {
        match self {
            Submission::Accepted(state) => Some(state),
            Submission::Rejected { .. } => None,
        }
    }
}

/// Registry of keyed queues.
///
/// Work submitted under one key runs in submission order on that key's
/// worker; different keys run in parallel. Queues are created on first
/// submission and kept until [`prune_finished`](Self::prune_finished)
/// removes them.
pub struct Manager<T> {
    queues: DashMap<String, Arc<KeyedQueue<T>>>,
    max_queue_size: AtomicUsize,
    env: Arc<WorkerEnv>,
}

impl<T: Send + 'static> Manager<T> {
    pub fn new(config: ManagerConfig) -> anyhow::Result<Self> {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        config: ManagerConfig,
        observer: Arc<dyn ExecutionObserver>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let metrics = ManagerMetrics::new()?;

        info!(
            "Created manager (max_queue_size: {})",
            config.max_queue_size
        );

        Ok(Manager {
            queues: DashMap::new(),
            max_queue_size: AtomicUsize::new(config.max_queue_size),
            env: Arc::new(WorkerEnv {
                observer,
                metrics: Arc::new(metrics),
                thread_name_prefix: config.thread_name_prefix,
            }),
        })
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size.load(Ordering::SeqCst)
    }

    /// Change the per-key bound. Items already queued are kept.
    pub fn set_max_queue_size(&self, max_queue_size: usize) -> Result<()> {
        if max_queue_size == 0 {
            return Err(ExecError::InvalidArgument(
                "max_queue_size must be at least 1".to_string(),
            ));
        }
        self.max_queue_size.store(max_queue_size, Ordering::SeqCst);
        Ok(())
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.env.metrics
    }

    /// True if a submission for `key` would currently be admitted
    pub fn can_enqueue(&self, key: &str) -> bool {
        match self.queues.get(key) {
            Some(queue) => queue.len() < self.max_queue_size(),
            None => true,
        }
    }

    /// Queue `item` under `key`, starting the key's worker if it is idle.
    ///
    /// Returns [`Submission::Rejected`] when the key is full. Errors only if
    /// a worker thread could not be spawned, in which case the item is
    /// dropped.
    pub fn submit(&self, key: &str, item: WorkItem<T>) -> Result<Submission> {
        let mut item = item;

        loop {
            let queue = self
                .queues
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(KeyedQueue::new(key, Arc::clone(&self.env))))
                .clone();

            match queue.enqueue(item, self.max_queue_size())? {
                EnqueueOutcome::Accepted => {
                    self.env.metrics.inc_submissions("accepted");
                    return Ok(Submission::Accepted(Arc::clone(queue.state())));
                }
                EnqueueOutcome::Rejected { depth } => {
                    self.env.metrics.inc_submissions("rejected");
                    warn!("Rejected submission for key {} (queue depth {})", key, depth);
                    return Ok(Submission::Rejected {
                        key: key.to_string(),
                        depth,
                    });
                }
                EnqueueOutcome::Retired(returned) => {
                    // Lost a race with prune_finished; drop the stale entry
                    // if it is still registered and try again.
                    self.queues
                        .remove_if(key, |_, current| Arc::ptr_eq(current, &queue));
                    item = returned;
                }
            }
        }
    }

    pub fn submit_plain<F>(&self, key: &str, f: F) -> Result<Submission>
    where
        F: FnMut() -> ActionResult + Send + 'static,
    {
        self.submit(key, WorkItem::new(Action::plain(f)))
    }

    pub fn submit_with_arg<F>(&self, key: &str, arg: T, f: F) -> Result<Submission>
    where
        F: FnMut(&T) -> ActionResult + Send + 'static,
    {
        self.submit(key, WorkItem::new(Action::with_arg(arg, f)))
    }

    pub fn submit_labeled<F>(
        &self,
        key: &str,
        label: impl Into<String>,
        arg: T,
        f: F,
    ) -> Result<Submission>
    where
        F: FnMut(&str, &T) -> ActionResult + Send + 'static,
    {
        self.submit(key, WorkItem::new(Action::labeled(label, arg, f)))
    }

    pub fn submit_with_state<F>(&self, key: &str, arg: T, f: F) -> Result<Submission>
    where
        F: FnMut(&T, &ExecutionState) -> ActionResult + Send + 'static,
    {
        self.submit(key, WorkItem::new(Action::with_state(arg, f)))
    }

    /// Submit `action` to run `repeat` times with `delay` after each run
    pub fn submit_repeated(
        &self,
        key: &str,
        repeat: u32,
        delay: Duration,
        action: Action<T>,
    ) -> Result<Submission> {
        let item = WorkItem::builder(action)
            .repeat(repeat)
            .delay(delay)
            .build()?;
        self.submit(key, item)
    }

    /// The queue registered for `key`, if any
    pub fn queue(&self, key: &str) -> Option<Arc<KeyedQueue<T>>> {
        self.queues.get(key).map(|queue| Arc::clone(queue.value()))
    }

    pub fn execution_state(&self, key: &str) -> Option<Arc<ExecutionState>> {
        self.queues.get(key).map(|queue| Arc::clone(queue.state()))
    }

    /// True if `key` has nothing queued or executing (or was never submitted)
    pub fn is_empty(&self, key: &str) -> bool {
        self.queues.get(key).map_or(true, |queue| queue.is_empty())
    }

    /// True if no key has anything queued or executing
    pub fn is_all_empty(&self) -> bool {
        self.queues.iter().all(|entry| entry.value().is_empty())
    }

    /// Keys with queued or executing work, sorted
    pub fn list_active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .queues
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Every registered key, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.queues.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Abort `key`'s drain cycle and discard its pending items.
    ///
    /// Fails with [`ExecError::InvalidOperation`] if the key was never
    /// submitted or never started; a completed key is left as is.
    pub fn terminate(&self, key: &str) -> Result<()> {
        let queue = self.queue(key).ok_or_else(|| {
            ExecError::InvalidOperation(format!("key {} was never submitted", key))
        })?;

        queue.terminate()
    }

    /// Terminate every key that currently has a running worker. Returns the
    /// keys that were aborted.
    pub fn terminate_all(&self) -> Vec<String> {
        let running: Vec<Arc<KeyedQueue<T>>> = self
            .queues
            .iter()
            .filter(|entry| entry.value().state().status().is_running())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut aborted = Vec::new();
        for queue in running {
            match queue.terminate() {
                Ok(()) => aborted.push(queue.key().to_string()),
                Err(e) => debug!("Skipping key {}: {}", queue.key(), e),
            }
        }
        aborted.sort();
        aborted
    }

    /// Drop idle, empty, finished queues from the registry. Returns how many
    /// were removed; their states are no longer reachable by key.
    pub fn prune_finished(&self) -> usize {
        let before = self.queues.len();
        self.queues.retain(|_, queue| !queue.retire_if_finished());
        let removed = before.saturating_sub(self.queues.len());
        if removed > 0 {
            info!("Pruned {} finished keys", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyed_exec_core::ExecutionStatus;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn manager(max_queue_size: usize) -> Manager<u32> {
        Manager::new(ManagerConfig {
            max_queue_size,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = Manager::<u32>::new(ManagerConfig {
            max_queue_size: 0,
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_submit_returns_state() {
        let manager = manager(1);
        let submission = manager.submit_with_arg("dev", 1, |_| Ok(())).unwrap();

        let state = submission.into_state().unwrap();
        assert_eq!(state.id(), "dev");
        assert!(state.wait_finished(WAIT));
        assert_eq!(state.status(), ExecutionStatus::Completed);
        assert!(Arc::ptr_eq(&state, &manager.execution_state("dev").unwrap()));
    }

    #[test]
    fn test_unknown_key() {
        let manager = manager(1);
        assert!(manager.execution_state("nope").is_none());
        assert!(manager.can_enqueue("nope"));
        assert!(manager.is_empty("nope"));
        assert!(manager.is_all_empty());
        assert!(manager.list_active_keys().is_empty());
        assert!(matches!(
            manager.terminate("nope"),
            Err(ExecError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_can_enqueue_tracks_depth() {
        let manager = manager(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let state = manager
            .submit_plain("dev", move || {
                release_rx.recv().ok();
                Ok(())
            })
            .unwrap()
            .into_state()
            .unwrap();

        assert!(!manager.can_enqueue("dev"));
        assert!(manager.can_enqueue("other"));
        assert_eq!(manager.list_active_keys(), vec!["dev".to_string()]);
        assert!(!manager.is_all_empty());

        release_tx.send(()).unwrap();
        assert!(state.wait_finished(WAIT));
        assert!(manager.can_enqueue("dev"));
        assert!(manager.is_empty("dev"));
    }

    #[test]
    fn test_set_max_queue_size() {
        let manager = manager(1);
        assert!(manager.set_max_queue_size(0).is_err());
        manager.set_max_queue_size(3).unwrap();
        assert_eq!(manager.max_queue_size(), 3);
    }

    #[test]
    fn test_submit_repeated_validates_repeat() {
        let manager = manager(1);
        let result = manager.submit_repeated("dev", 0, Duration::ZERO, Action::plain(|| Ok(())));
        assert!(matches!(result, Err(ExecError::InvalidArgument(_))));
        assert!(manager.execution_state("dev").is_none());
    }

    #[test]
    fn test_prune_finished() {
        let manager = manager(1);
        let state = manager
            .submit_plain("dev", || Ok(()))
            .unwrap()
            .into_state()
            .unwrap();
        assert!(state.wait_finished(WAIT));

        assert_eq!(manager.prune_finished(), 1);
        assert!(manager.execution_state("dev").is_none());
        assert!(manager.keys().is_empty());

        // Key can be reused after pruning
        let state = manager
            .submit_plain("dev", || Ok(()))
            .unwrap()
            .into_state()
            .unwrap();
        assert!(state.wait_finished(WAIT));
        assert_eq!(manager.keys(), vec!["dev".to_string()]);
    }

    #[test]
    fn test_submit_replaces_retired_queue() {
        let manager = manager(1);
        let old = manager
            .submit_plain("dev", || Ok(()))
            .unwrap()
            .into_state()
            .unwrap();
        assert!(old.wait_finished(WAIT));

        // Retired but still registered, as when prune_finished is mid-flight
        let stale = manager.queue("dev").unwrap();
        assert!(stale.retire_if_finished());

        let (tx, rx) = mpsc::channel();
        let state = manager
            .submit_plain("dev", move || {
                tx.send(()).ok();
                Ok(())
            })
            .unwrap()
            .into_state()
            .unwrap();

        rx.recv_timeout(WAIT).unwrap();
        assert!(state.wait_finished(WAIT));
        assert!(!Arc::ptr_eq(&old, &state));
        assert!(!Arc::ptr_eq(&stale, &manager.queue("dev").unwrap()));
        assert!(Arc::ptr_eq(&state, &manager.execution_state("dev").unwrap()));
        assert_eq!(manager.keys(), vec!["dev".to_string()]);
    }

    #[test]
    fn test_queue_exposes_cycles() {
        let manager = manager(1);
        assert!(manager.queue("dev").is_none());

        for _ in 0..2 {
            let state = manager
                .submit_plain("dev", || Ok(()))
                .unwrap()
                .into_state()
                .unwrap();
            assert!(state.wait_finished(WAIT));
        }

        let queue = manager.queue("dev").unwrap();
        assert_eq!(queue.key(), "dev");
        assert_eq!(queue.cycles(), 2);
        assert!(queue.is_idle());

        // Nothing queued, so start leaves the queue alone
        queue.start().unwrap();
        assert_eq!(queue.cycles(), 2);
        assert_eq!(queue.state().status(), ExecutionStatus::Completed);
    }
}
