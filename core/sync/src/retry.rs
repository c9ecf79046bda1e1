//! Retry policy and the delayed retry queue.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use offsync_common::ActionId;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts allowed before an action is marked failed.
    pub max_retries: u32,
    /// Base delay; the n-th retry waits `n * retry_delay`.
    pub retry_delay: Duration,
    /// Cap for the linear growth.
    pub max_delay: Duration,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: false,
        }
    }

    /// Set the base delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether an action that has failed `retry_count` times is spent.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Delay before the retry that follows the `retry_count`-th failure.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let base_delay = self.retry_delay.as_millis() as f64 * f64::from(retry_count.max(1));
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<(Instant, ActionId)>>,
    /// Live deadline per action. Heap entries that disagree are stale.
    scheduled: HashMap<ActionId, Instant>,
}

/// Actions waiting for their next attempt, ordered by deadline.
///
/// Cancelled or rescheduled entries are dropped lazily when they reach the
/// top of the heap.
#[derive(Debug, Default)]
pub struct RetryQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule `id` to fire after `delay`, replacing any earlier schedule.
    pub fn schedule(&self, id: ActionId, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            state.scheduled.insert(id, deadline);
            state.heap.push(Reverse((deadline, id)));
        }
        debug!("Retry for action {} scheduled in {:?}", id, delay);
        self.wake.notify_one();
    }

    /// Drop the pending retry for `id`. Returns whether one existed.
    pub fn cancel(&self, id: ActionId) -> bool {
        self.lock().scheduled.remove(&id).is_some()
    }

    pub fn contains(&self, id: ActionId) -> bool {
        self.lock().scheduled.contains_key(&id)
    }

    /// Whether `id` has a retry scheduled for later than `now`.
    pub fn is_waiting(&self, id: ActionId, now: Instant) -> bool {
        self.lock()
            .scheduled
            .get(&id)
            .is_some_and(|deadline| *deadline > now)
    }

    pub fn len(&self) -> usize {
        self.lock().scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending retry.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.heap.clear();
        state.scheduled.clear();
    }

    /// Remove and return the actions whose deadline has passed, plus the
    /// next live deadline.
    fn pop_due(&self, now: Instant) -> (Vec<ActionId>, Option<Instant>) {
        let mut state = self.lock();
        let mut due = Vec::new();

        while let Some(Reverse((deadline, id))) = state.heap.peek().copied() {
            if state.scheduled.get(&id) != Some(&deadline) {
                state.heap.pop();
                continue;
            }
            if deadline > now {
                return (due, Some(deadline));
            }
            state.heap.pop();
            state.scheduled.remove(&id);
            due.push(id);
        }

        (due, None)
    }

    /// Fire `on_due` for each action as its deadline passes, until
    /// `shutdown` is cancelled. Pending retries are discarded on shutdown.
    pub async fn run<F>(&self, shutdown: CancellationToken, on_due: F)
    where
        F: Fn(ActionId),
    {
        loop {
            let (due, next) = self.pop_due(Instant::now());
            for id in due {
                trace!("Retry for action {} is due", id);
                on_due(id);
            }

            let deadline = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let dropped = self.len();
                    self.clear();
                    debug!("Retry queue stopped, {} pending retries dropped", dropped);
                    break;
                }
                _ = self.wake.notified() => {}
                _ = sleep_until(deadline) => {}
            }
        }
    }
}
