//! Deduplicating FIFO work queue with in-flight exclusion and retry
//! accounting.
//!
//! Invariants:
//! - an item held by a worker (between `get` and `done`) is never handed out
//!   again; a concurrent `add` of an equal item only marks it dirty, and the
//!   item re-enters the FIFO at `done` time,
//! - adding an item already queued is a no-op,
//! - distinct items come out in FIFO order,
//! - after `shutdown`, `get` drains the remaining items and then resolves to
//!   `None`; in-flight items may still call `done`.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::sync::Notify;

use crate::limiter::RateLimiter;

struct QueueState<T> {
    queue: VecDeque<T>,
    /// Items needing processing: queued, or re-added while in flight.
    dirty: FxHashSet<T>,
    /// Items currently held by a worker.
    processing: FxHashSet<T>,
    shutting_down: bool,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

pub struct WorkQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter,
            }),
        }
    }

    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            // Coalesced: re-enqueued when the in-flight copy calls done().
            return;
        }
        state.queue.push_back(item);
        gauge!("workqueue_depth", state.queue.len() as f64);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Re-enqueue through the rate limiter, bumping the item's retry count.
    pub fn add_rate_limited(&self, item: T) {
        counter!("workqueue_requeues_total", 1u64);
        let delay = self.inner.limiter.when(&item);
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Next item to process; `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(item) = state.queue.pop_front() {
                    gauge!("workqueue_depth", state.queue.len() as f64);
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
                // Register interest while still holding the lock so a
                // notify between unlock and await cannot be missed.
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Mark processing finished. If the item went dirty while in flight it
    /// re-enters the FIFO here, exactly once.
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock().unwrap();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn forget(&self, item: &T) {
        self.inner.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.limiter.retries(item)
    }

    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.shutting_down = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
