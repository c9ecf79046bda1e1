//! Sync scheduling: explicit requests, periodic ticks and connectivity
//! transitions funnelled into one serial loop.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use offsync_common::{ActionId, Error, Result};

/// Why a sync pass (or single retry) was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
    /// Called directly by the host.
    Manual,
    /// Forced by the host; fails fast while offline.
    Forced,
    /// Connectivity went from offline to online.
    NetworkRestored,
    /// Periodic tick.
    Timer,
    /// A critical or high priority action was queued while online.
    PriorityEnqueued,
    /// A delayed retry of one action came due.
    Retry(ActionId),
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Manual => f.write_str("manual"),
            SyncTrigger::Forced => f.write_str("forced"),
            SyncTrigger::NetworkRestored => f.write_str("network restored"),
            SyncTrigger::Timer => f.write_str("timer"),
            SyncTrigger::PriorityEnqueued => f.write_str("priority enqueue"),
            SyncTrigger::Retry(id) => write!(f, "retry of action {}", id),
        }
    }
}

/// Result of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub success_count: usize,
    /// Attempts that did not complete, including those left for a retry.
    pub failure_count: usize,
    /// Actions that reached `Failed` during the pass.
    pub failed_permanently: usize,
    /// Actions left alone because a dependency was still pending.
    pub deferred_count: usize,
    /// Actions skipped because their conflicts need a person.
    pub manual_count: usize,
    /// Conflicting fields settled automatically.
    pub conflicts_resolved: usize,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl SyncReport {
    pub fn empty(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            success_count: 0,
            failure_count: 0,
            failed_permanently: 0,
            deferred_count: 0,
            manual_count: 0,
            conflicts_resolved: 0,
            duration: Duration::ZERO,
        }
    }

    /// Number of actions attempted.
    pub fn attempted(&self) -> usize {
        self.success_count + self.failure_count
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

type Request = (SyncTrigger, Option<oneshot::Sender<Result<SyncReport>>>);

/// Front end of the scheduler. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<Request>,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    /// Create a scheduler ticking every `period`, watching `connectivity`,
    /// and stopping when `shutdown` is cancelled.
    pub fn new(
        period: Duration,
        connectivity: watch::Receiver<bool>,
        shutdown: CancellationToken,
    ) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let initially_online = *connectivity.borrow();

        let scheduler = Self {
            request_tx,
            shutdown: shutdown.clone(),
        };

        let handle = SyncSchedulerHandle {
            request_rx,
            period,
            connectivity,
            initially_online,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Run a pass for `trigger` on the scheduler loop and wait for its
    /// result.
    pub async fn request(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((trigger, Some(response_tx)))
            .await
            .map_err(|_| Error::Shutdown("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Shutdown("Scheduler stopped before replying".to_string()))?
    }

    /// Queue `trigger` without waiting. Returns false if the request was
    /// dropped because the queue is full or the scheduler is gone.
    pub fn notify(&self, trigger: SyncTrigger) -> bool {
        match self.request_tx.try_send((trigger, None)) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropped sync trigger ({}): {}", trigger, e);
                false
            }
        }
    }

    /// Stop the scheduler loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    request_rx: mpsc::Receiver<Request>,
    period: Duration,
    connectivity: watch::Receiver<bool>,
    /// State when the scheduler was created; transitions after that point
    /// are observed by the loop even if it starts late.
    initially_online: bool,
    shutdown: CancellationToken,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `sync_fn` is called for every
    /// trigger, one at a time. Timer ticks are skipped while offline.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncReport>> + Send,
    {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut was_online = self.initially_online;
        let mut watching = true;

        info!("Sync scheduler started (interval {:?})", self.period);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Sync scheduler shutting down");
                    break;
                }

                Some((trigger, response_tx)) = self.request_rx.recv() => {
                    debug!("Processing sync trigger: {}", trigger);
                    let result = sync_fn(trigger).await;
                    match response_tx {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => Self::log_result(trigger, &result),
                    }
                }

                changed = self.connectivity.changed(), if watching => {
                    if changed.is_err() {
                        debug!("Connectivity source closed");
                        watching = false;
                        continue;
                    }
                    let online = *self.connectivity.borrow_and_update();
                    if online && !was_online {
                        info!("Network restored, syncing");
                        let result = sync_fn(SyncTrigger::NetworkRestored).await;
                        Self::log_result(SyncTrigger::NetworkRestored, &result);
                    }
                    was_online = online;
                }

                _ = ticker.tick() => {
                    if !*self.connectivity.borrow() {
                        debug!("Offline, skipping periodic sync");
                        continue;
                    }
                    let result = sync_fn(SyncTrigger::Timer).await;
                    Self::log_result(SyncTrigger::Timer, &result);
                }
            }
        }
    }

    fn log_result(trigger: SyncTrigger, result: &Result<SyncReport>) {
        match result {
            Ok(report) => debug!(
                "Sync ({}) finished: {} synced, {} failed",
                trigger, report.success_count, report.failure_count
            ),
            Err(Error::SyncInProgress) => debug!("Sync ({}) skipped: pass in progress", trigger),
            Err(Error::Shutdown(_)) => debug!("Sync ({}) interrupted by shutdown", trigger),
            Err(Error::Offline(_)) => warn!("Sync ({}) skipped: offline", trigger),
            Err(e) => error!("Sync ({}) failed: {}", trigger, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn spawn_recording(
        handle: SyncSchedulerHandle,
    ) -> (Arc<Mutex<Vec<SyncTrigger>>>, tokio::task::JoinHandle<()>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let task = tokio::spawn(async move {
            handle
                .run(move |trigger| {
                    let seen = seen_clone.clone();
                    async move {
                        seen.lock().unwrap().push(trigger);
                        let mut report = SyncReport::empty(trigger);
                        report.success_count = 1;
                        Ok(report)
                    }
                })
                .await;
        });
        (seen, task)
    }

    #[tokio::test]
    async fn test_sync_request() {
        let (_tx, rx) = watch::channel(true);
        let (scheduler, handle) =
            SyncScheduler::new(Duration::from_secs(3600), rx, CancellationToken::new());

        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let task = tokio::spawn(async move {
            handle
                .run(move |trigger| {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(SyncReport::empty(trigger))
                    }
                })
                .await;
        });

        let report = scheduler.request(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.trigger, SyncTrigger::Manual);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.shutdown();
        task.await.unwrap();
        assert!(scheduler.request(SyncTrigger::Manual).await.is_err());
    }

    #[tokio::test]
    async fn test_network_restore_triggers_once() {
        let (tx, rx) = watch::channel(false);
        let (scheduler, handle) =
            SyncScheduler::new(Duration::from_secs(3600), rx, CancellationToken::new());
        let (seen, task) = spawn_recording(handle);

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Flush the loop with an explicit request.
        scheduler.request(SyncTrigger::Manual).await.unwrap();
        scheduler.shutdown();
        task.await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![SyncTrigger::NetworkRestored, SyncTrigger::Manual]);
    }

    #[tokio::test]
    async fn test_timer_skipped_while_offline() {
        let (tx, rx) = watch::channel(false);
        let (scheduler, handle) =
            SyncScheduler::new(Duration::from_millis(20), rx, CancellationToken::new());
        let (seen, task) = spawn_recording(handle);

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(seen.lock().unwrap().is_empty());

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(90)).await;
        scheduler.shutdown();
        task.await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&SyncTrigger::NetworkRestored));
        assert!(seen.contains(&SyncTrigger::Timer));
    }

    #[tokio::test]
    async fn test_notify_does_not_wait() {
        let (_tx, rx) = watch::channel(true);
        let (scheduler, handle) =
            SyncScheduler::new(Duration::from_secs(3600), rx, CancellationToken::new());

        assert!(scheduler.notify(SyncTrigger::PriorityEnqueued));
        let (seen, task) = spawn_recording(handle);

        scheduler.request(SyncTrigger::Manual).await.unwrap();
        scheduler.shutdown();
        task.await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![SyncTrigger::PriorityEnqueued, SyncTrigger::Manual]);
    }
}
