use crate::types::ResourceKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Overall limit on rate-limited re-adds, shared by every key.
///
/// Holds up to `burst` tokens refilled at `qps`; a caller that finds the
/// bucket empty is told how long to wait for its token.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(10.0, 100)
    }
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last: Instant::now(),
        }
    }

    /// Take one token and return the wait until it is available.
    pub fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let refill = now.saturating_duration_since(self.last).as_secs_f64() * self.qps;
        self.tokens = (self.tokens + refill).min(self.burst);
        self.last = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<ResourceKey>,
    // Keys waiting to be processed, whether queued or parked behind an
    // in-flight attempt.
    dirty: HashSet<ResourceKey>,
    processing: HashSet<ResourceKey>,
    failures: HashMap<ResourceKey, u32>,
    bucket: TokenBucket,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<State>,
    backoff: Backoff,
    // Wakes workers blocked in `get`.
    available: Notify,
    // Wakes `shut_down_with_drain` whenever an in-flight key completes.
    idle: Notify,
}

/// Deduplicating, rate-limited FIFO of resource keys.
///
/// A key is handed to at most one caller of [`WorkQueue::get`] until that
/// caller reports [`WorkQueue::done`]. Keys added while in flight are parked
/// and redelivered once the current attempt completes.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}

impl WorkQueue {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                backoff,
                available: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    pub fn add(&self, key: ResourceKey) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(&self, key: ResourceKey, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-add `key` after a backoff derived from its failure count, or
    /// later if the overall bucket is exhausted.
    pub fn add_rate_limited(&self, key: ResourceKey) {
        let delay = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.get(&key).copied().unwrap_or(0);
            state.failures.insert(key.clone(), failures + 1);
            self.inner.backoff.delay(failures).max(state.bucket.reserve())
        };
        self.add_after(key, delay);
    }

    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &ResourceKey) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing. A key re-added meanwhile is queued
    /// again.
    pub fn done(&self, key: &ResourceKey) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        let requeue = state.dirty.contains(key) && !state.shutting_down;
        if requeue {
            state.queue.push_back(key.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);

        if requeue {
            self.inner.available.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Stop handing out keys. Blocked and future `get` calls return `None`.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.available.notify_waiters();
    }

    /// Shut down and wait until every in-flight key has been marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("default", name)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(4), Duration::from_millis(80));
        assert_eq!(backoff.delay(30), Duration::from_secs(1000));
        assert_eq!(backoff.delay(200), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_limits_overall_rate() {
        let mut bucket = TokenBucket::new(10.0, 2);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::from_millis(100));
        assert_eq!(bucket.reserve(), Duration::from_millis(200));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.reserve(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_burst_spreads_out() {
        let queue = WorkQueue::default();
        for i in 0..101 {
            queue.add_rate_limited(key(&format!("k{}", i)));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 100, "the key past the burst waits for a token");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.len(), 101);
    }

    #[tokio::test]
    async fn test_add_deduplicates_pending() {
        let queue = WorkQueue::default();
        for _ in 0..10 {
            queue.add(key("a"));
        }
        queue.add(key("b"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_key_parked_until_done() {
        let queue = WorkQueue::default();
        queue.add(key("a"));
        let got = queue.get().await.unwrap();

        queue.add(key("a"));
        queue.add(key("a"));
        assert_eq!(queue.len(), 0, "in-flight key must not be handed out twice");

        queue.done(&got);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_key() {
        let queue = WorkQueue::default();
        queue.add(key("a"));
        let got = queue.get().await.unwrap();
        queue.done(&got);
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_under_concurrent_adds() {
        let queue = WorkQueue::default();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            let overlaps = overlaps.clone();
            let processed = processed.clone();
            workers.push(tokio::spawn(async move {
                while let Some(k) = queue.get().await {
                    if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.done(&k);
                }
            }));
        }

        let mut adders = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            adders.push(tokio::spawn(async move {
                for _ in 0..200 {
                    queue.add(key("hot"));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for adder in adders {
            adder.await.unwrap();
        }

        queue.shut_down_with_drain().await;
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(processed.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeue_and_forget() {
        let queue = WorkQueue::default();
        let k = key("a");

        queue.add_rate_limited(k.clone());
        queue.add_rate_limited(k.clone());
        assert_eq!(queue.num_requeues(&k), 2);
        assert!(queue.is_empty(), "requeue must wait for its backoff");

        assert_eq!(queue.get().await, Some(k.clone()));
        queue.done(&k);

        queue.forget(&k);
        assert_eq!(queue.num_requeues(&k), 0);
    }

    #[tokio::test]
    async fn test_shut_down_releases_blocked_get() {
        let queue = WorkQueue::default();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("late"));
        assert_eq!(queue.get().await, None);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shut_down_with_drain_waits_for_in_flight() {
        let queue = WorkQueue::default();
        queue.add(key("a"));
        let k = queue.get().await.unwrap();
        queue.shut_down();
        assert_eq!(queue.get().await, None);

        let drained = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.shut_down_with_drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drained.is_finished());

        queue.done(&k);
        drained.await.unwrap();
    }
}
