//! Deduplicating, rate-limited work queue
//!
//! Keys are `namespace/name` strings. A key is pending at most once; a key
//! added while a worker holds it is parked and handed out again after the
//! worker calls [`WorkQueue::done`], so no key is processed by two workers
//! at the same time.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

/// Default first retry delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Default retry delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Decides how long a failing key waits before it is retried
pub trait RateLimiter: Send + Sync {
    /// Record a failure of `item` and return its retry delay
    fn when(&self, item: &str) -> Duration;
    /// Clear the failure history of `item`
    fn forget(&self, item: &str);
    /// Failures recorded for `item` since the last `forget`
    fn num_requeues(&self, item: &str) -> u32;
}

/// `base * 2^failures`, capped at `max`
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: DashMap<String, u32>,
}

impl ItemExponentialFailureRateLimiter {
    /// Create a limiter with the given base delay and cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }
}

impl Default for ItemExponentialFailureRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, item: &str) -> Duration {
        let mut failures = self.failures.entry(item.to_string()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, item: &str) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &str) -> u32 {
        self.failures.get(item).map_or(0, |f| *f)
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: Box<dyn RateLimiter>,
}

/// Work queue shared by the workers of one controller
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").field("len", &self.len()).finish()
    }
}

impl WorkQueue {
    /// Queue with the default exponential failure limiter
    pub fn new() -> Self {
        Self::with_rate_limiter(ItemExponentialFailureRateLimiter::default())
    }

    /// Queue with a custom rate limiter
    pub fn with_rate_limiter(limiter: impl RateLimiter + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // No mutation under this lock can panic halfway.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.state();
            if state.shutting_down || !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.shared.notify.notify_one();
    }

    /// Wait for the next key
    ///
    /// Returns `(None, true)` once the queue is shut down and drained.
    pub async fn get(&self) -> (Option<String>, bool) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return (Some(key), false);
                }
                if state.shutting_down {
                    return (None, true);
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing; requeue it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.shared.notify.notify_one();
        }
    }

    /// Reset the failure history of `key`
    pub fn forget(&self, key: &str) {
        self.shared.limiter.forget(key);
    }

    /// Requeue `key` after its rate-limited delay
    pub fn add_rate_limited(&self, key: &str) -> Duration {
        let delay = self.shared.limiter.when(key);
        self.add_after(key.to_string(), delay);
        delay
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(&self, key: String, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Failures recorded for `key`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.shared.limiter.num_requeues(key)
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// True if no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    /// True once [`WorkQueue::shutdown`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
