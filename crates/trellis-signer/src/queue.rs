//! Rate-limited work queue.
//!
//! Keys are deduplicated while queued and marked in-flight while a worker
//! holds them, so at most one worker processes a given key at a time. A key
//! re-added while in flight is parked dirty and re-queued when the worker
//! calls [`WorkQueue::done`]. Failed keys come back through
//! [`WorkQueue::add_rate_limited`], which composes per-key exponential
//! backoff with a global token bucket.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Default per-key backoff floor.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
/// Default per-key backoff ceiling.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
/// Default global refill rate (keys per second).
const DEFAULT_RATE: f64 = 10.0;
/// Default global burst size.
const DEFAULT_BURST: f64 = 100.0;

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shut_down: bool,
}

/// A deduplicating FIFO work queue with retry rate limiting.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    wakeup: Notify,
    limiter: Mutex<RequeueLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// A queue with the default retry limits (per-key backoff from 200 ms
    /// up to 1000 s, 10 rps with burst 100 globally).
    pub fn new() -> Arc<Self> {
        Self::with_rate_limits(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_RATE,
            DEFAULT_BURST,
        )
    }

    /// A queue with explicit retry limits.
    pub fn with_rate_limits(base: Duration, max: Duration, rate: f64, burst: f64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shut_down: false,
            }),
            wakeup: Notify::new(),
            limiter: Mutex::new(RequeueLimiter::new(base, max, rate, burst)),
        })
    }

    /// Enqueue a key. Keys already queued are collapsed; keys in flight are
    /// parked dirty and re-queued on [`WorkQueue::done`].
    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.shut_down {
                return;
            }
            if !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.wakeup.notify_one();
    }

    /// Enqueue a key after its retry delay elapses.
    pub fn add_rate_limited(self: Arc<Self>, key: K) {
        let delay = self
            .limiter
            .lock()
            .expect("limiter lock poisoned")
            .next_delay(&key);
        let queue = self;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.add(key);
        });
    }

    /// Reset the per-key retry backoff after a success.
    pub fn forget(&self, key: &K) {
        self.limiter
            .lock()
            .expect("limiter lock poisoned")
            .forget(key);
    }

    /// Pop the next key, waiting if the queue is empty. Returns `None` once
    /// the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.wakeup.notified();
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // Pass the baton so a single stored wakeup permit
                        // cannot strand other idle workers.
                        self.wakeup.notify_one();
                    }
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key's processing finished, re-queuing it if it went dirty
    /// while in flight.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shut_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.wakeup.notify_one();
        }
    }

    /// Stop accepting new keys. Workers drain the remaining queue, then
    /// [`WorkQueue::get`] returns `None`.
    pub fn shut_down(&self) {
        self.state.lock().expect("queue lock poisoned").shut_down = true;
        self.wakeup.notify_waiters();
    }

    /// Number of keys waiting (excluding in-flight keys).
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").queue.len()
    }

    /// Whether no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-key exponential backoff composed (max) with a global token bucket.
struct RequeueLimiter<K> {
    failures: HashMap<K, u32>,
    base: Duration,
    max: Duration,
    bucket: TokenBucket,
}

impl<K: Clone + Eq + Hash> RequeueLimiter<K> {
    fn new(base: Duration, max: Duration, rate: f64, burst: f64) -> Self {
        Self {
            failures: HashMap::new(),
            base,
            max,
            bucket: TokenBucket::new(rate, burst),
        }
    }

    fn next_delay(&mut self, key: &K) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exponent = (*failures).min(63);
        *failures += 1;

        let backoff = self
            .base
            .checked_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
            .unwrap_or(self.max)
            .min(self.max);

        backoff.max(self.bucket.reserve())
    }

    fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

/// Token bucket that reserves slots in the future when drained.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    refreshed: Instant,
}

impl TokenBucket {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate,
            refreshed: Instant::now(),
        }
    }

    /// Take one token, returning how long the caller must wait for it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refreshed).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.refreshed = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}
