//! Run jobs only once and share the results across tasks.
//!
//! We often have jobs `Fn(K) -> V` that must run exactly once per key while
//! other tasks wait on the result, e.g. configuring a provider that many
//! resources share. The first task to [`OnceMap::register`] a key runs the
//! job and publishes with [`OnceMap::done`]; everyone else suspends in
//! [`OnceMap::wait`] until the result (or cancellation) arrives.

use std::hash::Hash;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("the operation was cancelled")]
    Cancelled,
}

pub struct OnceMap<K: Eq + Hash, V> {
    /// Jobs that were started, including those that have finished.
    started: Mutex<FxHashSet<K>>,
    results: DashMap<K, V>,
    notify: Notify,
    cancelled: AtomicBool,
}

impl<K: Eq + Hash + Clone, V: Clone> OnceMap<K, V> {
    /// Register intent to run the job for `key`.
    ///
    /// Returns `true` if the caller now owns the job and must eventually
    /// call [`OnceMap::done`] (or [`OnceMap::cancel_all`]), `false` if the
    /// job is already running or finished and the caller should
    /// [`OnceMap::wait`].
    pub fn register(&self, key: &K) -> bool {
        let mut started = self.started.lock().unwrap();
        if started.contains(key) {
            return false;
        }
        started.insert(key.clone())
    }

    /// Publish the result of a job registered with [`OnceMap::register`].
    pub fn done(&self, key: K, value: V) {
        self.results.insert(key, value);
        self.notify.notify_waiters();
    }

    /// Wait for the result of a registered job.
    ///
    /// Suspends until [`OnceMap::done`] publishes for `key` or
    /// [`OnceMap::cancel_all`] releases every waiter.
    pub async fn wait(&self, key: &K) -> Result<V, Error> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            // A published result wins over cancellation: jobs that finished
            // before the cancel must still be observable.
            if let Some(value) = self.results.get(key) {
                return Ok(value.clone());
            }
            if self.cancelled.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            notified.await;
        }
    }

    /// The result of a finished job, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        self.results.get(key).map(|value| value.clone())
    }

    /// Whether a job for `key` has been registered.
    pub fn is_registered(&self, key: &K) -> bool {
        self.started.lock().unwrap().contains(key)
    }

    /// Release every waiter, current and future, with [`Error::Cancelled`].
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

impl<K: Eq + Hash, V> Default for OnceMap<K, V> {
    fn default() -> Self {
        Self {
            started: Mutex::new(FxHashSet::default()),
            results: DashMap::new(),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        }
    }
}
