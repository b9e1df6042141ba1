//! A delay-ordered, de-duplicating work queue.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::ManagerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Due {
    at: Instant,
    seq: u64,
}

struct State<T> {
    waiting: HashMap<T, Due>,
    processing: HashSet<T>,
    /// Re-added while processing; moved to `waiting` by `done`.
    parked: HashMap<T, Instant>,
    seq: u64,
    shut_down: bool,
}

/// Items become available once their delay has passed, earliest first.
///
/// An item is held by at most one consumer: adding it while it is being
/// processed parks it until `done` is called. Adding an item that is already
/// waiting keeps the earlier due time.
pub struct DelayQueue<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Default for DelayQueue<T>
where
    T: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DelayQueue<T>
where
    T: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                waiting: HashMap::new(),
                processing: HashSet::new(),
                parked: HashMap::new(),
                seq: 0,
                shut_down: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn add(&self, item: T) -> Result<(), ManagerError> {
        self.add_after(item, Duration::ZERO)
    }

    pub fn add_after(&self, item: T, delay: Duration) -> Result<(), ManagerError> {
        let at = Instant::now() + delay;
        let mut state = self.lock();
        if state.shut_down {
            return Err(ManagerError::ShutDown);
        }

        if state.processing.contains(&item) {
            let parked = state.parked.entry(item).or_insert(at);
            *parked = (*parked).min(at);
            return Ok(());
        }

        state.seq += 1;
        let due = Due { at, seq: state.seq };
        let earlier = state.waiting.get(&item).is_some_and(|existing| existing.at <= at);
        if !earlier {
            state.waiting.insert(item, due);
        }
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    /// Blocks until an item is due.
    ///
    /// After shutdown the items that were already due are still handed out,
    /// earliest first, without blocking; then `None`.
    pub fn get(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.shut_down {
                let (item, _) = state
                    .waiting
                    .iter()
                    .min_by_key(|(_, due)| **due)
                    .map(|(item, due)| (item.clone(), *due))?;
                state.waiting.remove(&item);
                state.processing.insert(item.clone());
                return Some(item);
            }

            let next = state
                .waiting
                .iter()
                .min_by_key(|(_, due)| **due)
                .map(|(item, due)| (item.clone(), due.at));

            match next {
                None => {
                    state = self
                        .ready
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some((item, at)) => {
                    let now = Instant::now();
                    if at <= now {
                        state.waiting.remove(&item);
                        state.processing.insert(item.clone());
                        return Some(item);
                    }
                    state = self
                        .ready
                        .wait_timeout(state, at - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
            }
        }
    }

    /// Marks `item` as finished, releasing anything added while it ran.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if let Some(at) = state.parked.remove(item) {
            if !state.shut_down {
                state.seq += 1;
                let due = Due { at, seq: state.seq };
                state.waiting.insert(item.clone(), due);
            }
        }
        drop(state);
        self.ready.notify_all();
    }

    /// Stops handing out items and wakes every waiting consumer.
    ///
    /// Items still waiting are dropped.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shut_down = true;
        state.waiting.clear();
        state.parked.clear();
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
