//! Runs registered reconcilers on a pool of worker threads.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tracing::info_span;

use super::queue::DelayQueue;
use super::reconciler::{ReconcileEvent, Reconciler};
use crate::config::{EngineConfig, FailurePolicyKind};
use crate::error::ManagerError;

/// What happens to a reconciler whose pass failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Run it again after the given delay.
    Requeue { after: Duration },
    /// Leave it out of the schedule until it is enqueued again.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    pub workers: usize,
    pub resync_period: Duration,
    pub failure_policy: FailurePolicy,
}

impl ManagerOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        let failure_policy = match config.failure_policy {
            FailurePolicyKind::Requeue => FailurePolicy::Requeue {
                after: Duration::from_secs(config.failure_backoff_secs()),
            },
            FailurePolicyKind::Drop => FailurePolicy::Drop,
        };
        Self {
            workers: config.workers.max(1),
            resync_period: Duration::from_secs(config.resync_period_secs),
            failure_policy,
        }
    }
}

/// A reason given to `enqueue_after`, owed to the first pass starting at or after `due`.
struct Trigger {
    due: Instant,
    reason: String,
}

struct Shared {
    reconcilers: RwLock<BTreeMap<String, Arc<dyn Reconciler>>>,
    queue: DelayQueue<String>,
    triggers: Mutex<HashMap<String, Vec<Trigger>>>,
    options: ManagerOptions,
}

impl Shared {
    fn triggers(&self) -> MutexGuard<'_, HashMap<String, Vec<Trigger>>> {
        self.triggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes the reasons for `name` that are due by `now`, oldest first, joined.
    fn take_due_reasons(&self, name: &str, now: Instant) -> Option<String> {
        let mut triggers = self.triggers();
        let pending = triggers.remove(name)?;
        let (ready, later): (Vec<_>, Vec<_>) = pending.into_iter().partition(|t| t.due <= now);
        if !later.is_empty() {
            triggers.insert(name.to_string(), later);
        }
        if ready.is_empty() {
            return None;
        }
        let reasons: Vec<String> = ready.into_iter().map(|t| t.reason).collect();
        Some(reasons.join("; "))
    }

    fn next_trigger(&self, name: &str) -> Option<Instant> {
        self.triggers()
            .get(name)
            .and_then(|pending| pending.iter().map(|t| t.due).min())
    }
}

/// Owns the reconcilers and the workers that run them.
///
/// A name is never run by two workers at once: it is only put back on the
/// queue after its pass returns.
pub struct Manager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Manager {
    pub fn new(options: ManagerOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                reconcilers: RwLock::new(BTreeMap::new()),
                queue: DelayQueue::new(),
                triggers: Mutex::new(HashMap::new()),
                options,
            }),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Registers a reconciler and schedules its first pass.
    pub fn add(&self, reconciler: Arc<dyn Reconciler>) -> Result<(), ManagerError> {
        let name = reconciler.name().to_string();
        {
            let mut reconcilers = self
                .shared
                .reconcilers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if reconcilers.contains_key(&name) {
                return Err(ManagerError::DuplicateName(name));
            }
            reconcilers.insert(name.clone(), reconciler);
        }
        debug!("Registered reconciler {}", name);
        self.shared.queue.add(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.shared
            .reconcilers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Runs `name` as soon as a worker is free.
    pub fn enqueue(&self, name: &str, reason: &str) -> Result<(), ManagerError> {
        self.enqueue_after(name, reason, Duration::ZERO)
    }

    /// Runs `name` once `delay` has passed.
    ///
    /// `reason` goes to the first pass that starts after the delay. An earlier
    /// pass of the same name, such as a resync, does not consume it.
    pub fn enqueue_after(
        &self,
        name: &str,
        reason: &str,
        delay: Duration,
    ) -> Result<(), ManagerError> {
        let known = self
            .shared
            .reconcilers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name);
        if !known {
            return Err(ManagerError::UnknownName(name.to_string()));
        }
        self.shared
            .triggers()
            .entry(name.to_string())
            .or_default()
            .push(Trigger {
                due: Instant::now() + delay,
                reason: reason.to_string(),
            });
        self.shared.queue.add_after(name.to_string(), delay)
    }

    /// Spawns the worker threads. May be called once.
    pub fn start(&self) -> Result<(), ManagerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }
        if self.shared.queue.is_shut_down() {
            return Err(ManagerError::ShutDown);
        }

        let count = self.shared.options.workers.max(1);
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for worker_id in 0..count {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("hydros-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, shared))
                .map_err(|e| ManagerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} workers", count);
        Ok(())
    }

    /// Refuses new work, runs the passes already due and waits for every worker to exit.
    pub fn shutdown(&self) {
        info!("Shutting down reconciliation manager...");
        self.shared.queue.shut_down();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for (i, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if !self.shared.queue.is_shut_down() {
            self.shutdown();
        }
    }
}

fn run_worker(worker_id: usize, shared: Arc<Shared>) {
    debug!("Worker {} started", worker_id);

    while let Some(name) = shared.queue.get() {
        let reconciler = shared
            .reconcilers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&name)
            .cloned();
        let Some(reconciler) = reconciler else {
            warn!("No reconciler named {}", name);
            shared.queue.done(&name);
            continue;
        };

        let event = match shared.take_due_reasons(&name, Instant::now()) {
            Some(reason) => ReconcileEvent::triggered(reason),
            None => ReconcileEvent::resync(),
        };

        let succeeded = {
            let _span = info_span!("reconcile", name = %name, worker = worker_id).entered();
            match panic::catch_unwind(AssertUnwindSafe(|| reconciler.run(&event))) {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!("Reconcile of {} failed: {}", name, e);
                    false
                }
                Err(_) => {
                    error!("Reconcile of {} panicked", name);
                    false
                }
            }
        };

        shared.queue.done(&name);

        let delay = if succeeded {
            Some(shared.options.resync_period)
        } else {
            match shared.options.failure_policy {
                FailurePolicy::Requeue { after } => Some(after),
                FailurePolicy::Drop => {
                    warn!("{} will not run again until it is enqueued", name);
                    None
                }
            }
        };
        // A reason still owed keeps its own slot, whatever the policy says.
        let owed = shared
            .next_trigger(&name)
            .map(|due| due.saturating_duration_since(Instant::now()));
        for delay in [delay, owed].into_iter().flatten() {
            if shared.queue.add_after(name.clone(), delay).is_err() {
                debug!("Queue shut down, not rescheduling {}", name);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HydrosError, Result};
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        name: String,
        fail: bool,
        runs: AtomicUsize,
    }

    impl Counting {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail,
                runs: AtomicUsize::new(0),
            })
        }
    }

    impl Reconciler for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(&self, _event: &ReconcileEvent) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HydrosError::Validation("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn options(policy: FailurePolicy) -> ManagerOptions {
        ManagerOptions {
            workers: 2,
            resync_period: Duration::from_millis(20),
            failure_policy: policy,
        }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let manager = Manager::new(options(FailurePolicy::Drop));
        manager.add(Counting::new("a", false)).unwrap();
        assert!(matches!(
            manager.add(Counting::new("a", false)),
            Err(ManagerError::DuplicateName(name)) if name == "a"
        ));
        assert_eq!(manager.names(), vec!["a"]);
    }

    #[test]
    fn test_unknown_name_cannot_be_enqueued() {
        let manager = Manager::new(options(FailurePolicy::Drop));
        assert!(matches!(
            manager.enqueue("missing", "test"),
            Err(ManagerError::UnknownName(_))
        ));
    }

    #[test]
    fn test_successful_runs_are_resynced() {
        let manager = Manager::new(options(FailurePolicy::Drop));
        let reconciler = Counting::new("a", false);
        manager.add(reconciler.clone()).unwrap();
        manager.start().unwrap();

        wait_for(|| reconciler.runs.load(Ordering::SeqCst) >= 3);
        manager.shutdown();
        assert!(reconciler.runs.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_drop_policy_runs_failure_once() {
        let manager = Manager::new(options(FailurePolicy::Drop));
        let failing = Counting::new("failing", true);
        let healthy = Counting::new("healthy", false);
        manager.add(failing.clone()).unwrap();
        manager.add(healthy.clone()).unwrap();
        manager.start().unwrap();

        wait_for(|| healthy.runs.load(Ordering::SeqCst) >= 4);
        manager.shutdown();
        assert_eq!(failing.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_requeue_policy_retries_failure() {
        let manager = Manager::new(options(FailurePolicy::Requeue {
            after: Duration::from_millis(10),
        }));
        let failing = Counting::new("failing", true);
        manager.add(failing.clone()).unwrap();
        manager.start().unwrap();

        wait_for(|| failing.runs.load(Ordering::SeqCst) >= 2);
        manager.shutdown();
        assert!(failing.runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_start_twice() {
        let manager = Manager::new(options(FailurePolicy::Drop));
        manager.start().unwrap();
        assert!(matches!(manager.start(), Err(ManagerError::AlreadyStarted)));
        manager.shutdown();
    }
}
