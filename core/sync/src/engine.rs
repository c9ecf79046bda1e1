//! Sync engine: replays queued actions against the remote service.
//!
//! Two pass algorithms are available:
//!
//! - **Sequential**: pending actions are attempted one at a time in enqueue
//!   order. A failed attempt schedules a delayed retry of that single action
//!   (`retry_delay * retry_count`) until `max_retries` is reached.
//! - **Prioritized**: pending actions are drained in batches ordered by
//!   priority tier, enqueue time and id, with the actions in a batch sent
//!   concurrently. Actions whose dependencies are still pending wait for a
//!   later batch or pass. Failures stay pending for the next pass.
//!
//! In both modes, updates sent with PUT or PATCH first read the remote entity
//! and run it through the [`ConflictResolver`] before the write goes out.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use offsync_common::{
    ActionId, ActionStatus, ActionType, Error, HttpMethod, LogStatus, Result,
};
use offsync_storage::{ActionLog, OfflineAction, SyncLogEntry};

use crate::conflict::ConflictResolver;
use crate::connectivity::ConnectivityNotifier;
use crate::queue::PassQueue;
use crate::retry::{RetryConfig, RetryQueue};
use crate::scheduler::{SyncReport, SyncScheduler, SyncSchedulerHandle, SyncTrigger};
use crate::transport::{RemoteRequest, RemoteResponse, RemoteTransport};

/// Pass algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    #[default]
    Sequential,
    Prioritized,
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineMode::Sequential => f.write_str("sequential"),
            EngineMode::Prioritized => f.write_str("prioritized"),
        }
    }
}

impl FromStr for EngineMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(EngineMode::Sequential),
            "prioritized" => Ok(EngineMode::Prioritized),
            other => Err(Error::InvalidInput(format!("Unknown engine mode: {}", other))),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: EngineMode,
    /// Attempts per action before it is marked failed.
    pub max_retries: u32,
    /// Base delay between retries of one action (sequential mode).
    pub retry_delay: Duration,
    /// Actions sent concurrently per batch (prioritized mode).
    pub batch_size: usize,
    /// Pause between batches (prioritized mode).
    pub batch_delay: Duration,
    /// Periodic pass interval. Defaults to 5 minutes in sequential mode and
    /// 30 seconds in prioritized mode.
    pub sync_interval: Option<Duration>,
    /// Deadline for each remote request.
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::Sequential,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            batch_size: 10,
            batch_delay: Duration::from_millis(100),
            sync_interval: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Defaults for the given mode.
    pub fn new(mode: EngineMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: EngineMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Effective periodic interval.
    pub fn interval(&self) -> Duration {
        self.sync_interval.unwrap_or(match self.mode {
            EngineMode::Sequential => Duration::from_secs(5 * 60),
            EngineMode::Prioritized => Duration::from_secs(30),
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries).with_retry_delay(self.retry_delay)
    }

    /// # Errors
    /// - `Error::InvalidInput` for a zero batch size, retry limit or timeout
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidInput("max_retries must be at least 1".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidInput("request_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Emitted once per completed pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A sequential pass finished.
    #[serde(rename_all = "camelCase")]
    SyncCompleted {
        success_count: usize,
        failure_count: usize,
    },
    /// A prioritized pass finished.
    #[serde(rename_all = "camelCase")]
    IncrementalSyncCompleted {
        success_count: usize,
        failure_count: usize,
    },
}

impl SyncEvent {
    fn for_pass(mode: EngineMode, report: &SyncReport) -> Self {
        let (success_count, failure_count) = (report.success_count, report.failure_count);
        match mode {
            EngineMode::Sequential => SyncEvent::SyncCompleted {
                success_count,
                failure_count,
            },
            EngineMode::Prioritized => SyncEvent::IncrementalSyncCompleted {
                success_count,
                failure_count,
            },
        }
    }

    pub fn success_count(&self) -> usize {
        match self {
            SyncEvent::SyncCompleted { success_count, .. }
            | SyncEvent::IncrementalSyncCompleted { success_count, .. } => *success_count,
        }
    }

    pub fn failure_count(&self) -> usize {
        match self {
            SyncEvent::SyncCompleted { failure_count, .. }
            | SyncEvent::IncrementalSyncCompleted { failure_count, .. } => *failure_count,
        }
    }
}

/// What happened to one action in one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Completed { conflicts: usize },
    Retrying { retry_count: u32 },
    Failed,
    NeedsManual,
    Interrupted,
}

/// Clears the in-progress flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Background tasks of a started engine.
pub struct EngineHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop the scheduler and retry timers and wait for them to exit.
    /// In-flight requests are abandoned and their actions stay pending.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Sync task ended abnormally: {}", e);
            }
        }
        info!("Sync engine stopped");
    }
}

/// Replays queued actions when connectivity allows.
pub struct SyncEngine {
    log: Arc<ActionLog>,
    transport: Arc<dyn RemoteTransport>,
    connectivity: Arc<dyn ConnectivityNotifier>,
    resolver: ConflictResolver,
    config: SyncConfig,
    retry: RetryConfig,
    retries: RetryQueue,
    syncing: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    scheduler: SyncScheduler,
    scheduler_handle: Mutex<Option<SyncSchedulerHandle>>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    /// Create an engine over an initialized log.
    ///
    /// # Preconditions
    /// - `log` has been initialized
    ///
    /// # Errors
    /// - `Error::Initialization` if the log is not ready
    /// - `Error::InvalidInput` if the config is invalid
    pub fn new(
        log: Arc<ActionLog>,
        transport: Arc<dyn RemoteTransport>,
        connectivity: Arc<dyn ConnectivityNotifier>,
        config: SyncConfig,
    ) -> Result<Self> {
        if !log.is_ready() {
            return Err(Error::Initialization(
                "Action log must be initialized before the sync engine".to_string(),
            ));
        }
        config.validate()?;

        let shutdown = CancellationToken::new();
        let (scheduler, handle) =
            SyncScheduler::new(config.interval(), connectivity.subscribe(), shutdown.clone());
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            log,
            transport,
            connectivity,
            resolver: ConflictResolver::with_defaults(),
            retry: config.retry_config(),
            config,
            retries: RetryQueue::new(),
            syncing: AtomicBool::new(false),
            events,
            scheduler,
            scheduler_handle: Mutex::new(Some(handle)),
            shutdown,
        })
    }

    /// Replace the conflict resolver.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<ActionLog> {
        &self.log
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Actions currently waiting on a delayed retry.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Completion events for every pass from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Spawn the scheduler loop and the retry timer.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the engine was already started
    /// - `Error::Shutdown` if the engine was shut down
    pub fn start(self: &Arc<Self>) -> Result<EngineHandle> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown("Sync engine is shut down".to_string()));
        }
        let handle = self
            .scheduler_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| Error::InvalidInput("Sync engine already started".to_string()))?;

        let runner = Arc::clone(self);
        let scheduler_task = tokio::spawn(async move {
            handle
                .run(move |trigger| {
                    let engine = Arc::clone(&runner);
                    async move { engine.handle_trigger(trigger).await }
                })
                .await;
        });

        let engine = Arc::clone(self);
        let scheduler = self.scheduler.clone();
        let token = self.shutdown.clone();
        let retry_task = tokio::spawn(async move {
            engine
                .retries
                .run(token, move |id| {
                    scheduler.notify(SyncTrigger::Retry(id));
                })
                .await;
        });

        info!(
            "Sync engine started ({} mode, interval {:?})",
            self.config.mode,
            self.config.interval()
        );

        Ok(EngineHandle {
            shutdown: self.shutdown.clone(),
            tasks: vec![scheduler_task, retry_task],
        })
    }

    /// Stop background work. Pending retries are dropped and any in-flight
    /// request is abandoned.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Shut down and close the underlying log.
    pub async fn close(&self) -> Result<()> {
        self.shutdown();
        self.log.close().await
    }

    async fn handle_trigger(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        match trigger {
            SyncTrigger::Retry(id) => self.run_due_retry(id).await,
            SyncTrigger::Forced => self.force_sync().await,
            other => self.run_pass(other).await,
        }
    }

    /// Queue a mutation. Critical and high priority actions queued while
    /// online trigger an immediate pass on a started engine.
    pub async fn enqueue(&self, action: offsync_storage::NewAction) -> Result<ActionId> {
        let priority = action.priority;
        let id = self.log.add_offline_action(action).await?;

        if priority.is_urgent() && self.connectivity.is_online() {
            debug!("Action {} is {}, requesting immediate sync", id, priority);
            self.scheduler.notify(SyncTrigger::PriorityEnqueued);
        }
        Ok(id)
    }

    /// Run one pass now. Does nothing while offline.
    ///
    /// # Errors
    /// - `Error::SyncInProgress` if another pass is running
    /// - `Error::Shutdown` after shutdown
    pub async fn sync_pending(&self) -> Result<SyncReport> {
        self.run_pass(SyncTrigger::Manual).await
    }

    /// Run one pass now.
    ///
    /// # Errors
    /// - `Error::Offline` while offline
    /// - `Error::SyncInProgress` if another pass is running
    pub async fn force_sync(&self) -> Result<SyncReport> {
        if !self.connectivity.is_online() {
            return Err(Error::Offline("Cannot force sync while offline".to_string()));
        }
        self.run_pass(SyncTrigger::Forced).await
    }

    /// Attempt one pending action now, dropping any scheduled retry for it.
    ///
    /// Non-pending actions are left alone.
    pub async fn retry_action(&self, id: ActionId) -> Result<SyncReport> {
        self.retries.cancel(id);
        self.attempt_single(id).await
    }

    /// Mark an action failed without attempting it.
    pub async fn fail_action(&self, id: ActionId, reason: &str) -> Result<()> {
        self.retries.cancel(id);
        self.log.fail_action(id, reason).await
    }

    async fn run_due_retry(&self, id: ActionId) -> Result<SyncReport> {
        if self.retries.contains(id) {
            debug!("Action {} was rescheduled, skipping stale retry", id);
            return Ok(SyncReport::empty(SyncTrigger::Retry(id)));
        }
        self.attempt_single(id).await
    }

    async fn attempt_single(&self, id: ActionId) -> Result<SyncReport> {
        let trigger = SyncTrigger::Retry(id);
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown("Sync engine is shut down".to_string()));
        }

        let action = self.log.get_action(id).await?;
        if !action.is_pending() {
            debug!("Action {} is {}, nothing to retry", id, action.status);
            return Ok(SyncReport::empty(trigger));
        }
        if !self.connectivity.is_online() {
            debug!("Offline, leaving action {} for the next pass", id);
            return Ok(SyncReport::empty(trigger));
        }

        let Some(_guard) = PassGuard::acquire(&self.syncing) else {
            self.retries.schedule(id, self.retry.retry_delay);
            return Err(Error::SyncInProgress);
        };

        let started = Instant::now();
        let mut report = SyncReport::empty(trigger);
        let attempt = self.attempt(&action).await;
        self.tally(&action, attempt, &mut report);
        report.duration = started.elapsed();
        Ok(report)
    }

    async fn run_pass(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown("Sync engine is shut down".to_string()));
        }
        if !self.connectivity.is_online() {
            if trigger == SyncTrigger::Forced {
                return Err(Error::Offline("Cannot force sync while offline".to_string()));
            }
            debug!("Offline, skipping sync ({})", trigger);
            return Ok(SyncReport::empty(trigger));
        }

        let _guard = PassGuard::acquire(&self.syncing).ok_or(Error::SyncInProgress)?;
        let started = Instant::now();
        let mut report = SyncReport::empty(trigger);

        match self.config.mode {
            EngineMode::Sequential => self.sequential_pass(&mut report).await?,
            EngineMode::Prioritized => self.prioritized_pass(&mut report).await?,
        }
        report.duration = started.elapsed();

        info!(
            "Sync ({}) completed: {} synced, {} failed, {} deferred in {:?}",
            trigger,
            report.success_count,
            report.failure_count,
            report.deferred_count,
            report.duration
        );
        // No subscribers is fine.
        let _ = self.events.send(SyncEvent::for_pass(self.config.mode, &report));

        Ok(report)
    }

    async fn sequential_pass(&self, report: &mut SyncReport) -> Result<()> {
        let mut actions = self.log.get_pending_actions().await?;
        // Due retries run inline; only those still waiting belong to the timer.
        let now = Instant::now();
        actions.retain(|a| !self.retries.is_waiting(a.id, now));
        for action in &actions {
            self.retries.cancel(action.id);
        }
        actions.sort_by_key(|a| (a.timestamp, a.id));
        debug!("Sequential pass over {} actions", actions.len());

        for action in &actions {
            if self.shutdown.is_cancelled() {
                break;
            }
            let attempt = self.attempt(action).await;
            self.tally(action, attempt, report);
        }
        Ok(())
    }

    async fn prioritized_pass(&self, report: &mut SyncReport) -> Result<()> {
        let mut queue = PassQueue::new(self.log.get_pending_actions().await?);
        debug!("Prioritized pass over {} actions", queue.remaining());

        let mut first = true;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let batch = queue.next_batch(self.config.batch_size);
            if batch.is_empty() {
                break;
            }
            if !first {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.batch_delay) => {}
                }
            }
            first = false;

            let attempts = join_all(batch.iter().map(|action| self.attempt(action))).await;
            for (action, attempt) in batch.iter().zip(attempts) {
                if self.tally(action, attempt, report) {
                    queue.complete(action.id);
                }
            }
        }

        report.deferred_count = queue.remaining();
        if report.deferred_count > 0 {
            debug!(
                "{} actions deferred behind pending dependencies",
                report.deferred_count
            );
        }
        Ok(())
    }

    /// Fold one attempt into the report; returns whether the action
    /// completed.
    fn tally(
        &self,
        action: &OfflineAction,
        attempt: Result<Attempt>,
        report: &mut SyncReport,
    ) -> bool {
        match attempt {
            Ok(Attempt::Completed { conflicts }) => {
                report.success_count += 1;
                report.conflicts_resolved += conflicts;
                true
            }
            Ok(Attempt::Retrying { retry_count }) => {
                report.failure_count += 1;
                if self.config.mode == EngineMode::Sequential {
                    self.retries
                        .schedule(action.id, self.retry.delay_for_retry(retry_count));
                }
                false
            }
            Ok(Attempt::Failed) => {
                report.failure_count += 1;
                report.failed_permanently += 1;
                false
            }
            Ok(Attempt::NeedsManual) => {
                report.failure_count += 1;
                report.manual_count += 1;
                false
            }
            Ok(Attempt::Interrupted) => false,
            Err(e) => {
                error!("Could not record outcome of action {}: {}", action.id, e);
                report.failure_count += 1;
                false
            }
        }
    }

    /// Send one action and record the outcome in the log.
    async fn attempt(&self, action: &OfflineAction) -> Result<Attempt> {
        match self.execute(action).await {
            Ok(conflicts) => {
                self.log
                    .update_action_status(action.id, ActionStatus::Completed, None)
                    .await?;
                self.audit(
                    action,
                    LogStatus::Success,
                    format!("{} {} synced", action.method, action.endpoint),
                    json!({ "attempt": action.retry_count + 1, "conflicts": conflicts }),
                )
                .await?;
                debug!("Action {} synced", action.id);
                Ok(Attempt::Completed { conflicts })
            }
            Err(Error::Shutdown(_)) => Ok(Attempt::Interrupted),
            Err(e @ Error::ManualResolutionRequired(_)) => {
                warn!("Action {} needs manual conflict resolution", action.id);
                self.audit(
                    action,
                    LogStatus::Error,
                    e.to_string(),
                    json!({ "attempt": action.retry_count + 1, "manual": true }),
                )
                .await?;
                Ok(Attempt::NeedsManual)
            }
            Err(e) => {
                let message = e.to_string();
                let retry_count = self.log.record_failed_attempt(action.id, &message).await?;

                if !e.is_retryable() || self.retry.is_exhausted(retry_count) {
                    self.log
                        .update_action_status(action.id, ActionStatus::Failed, Some(message.clone()))
                        .await?;
                    self.audit(
                        action,
                        LogStatus::Error,
                        format!("Gave up after {} attempt(s): {}", retry_count, message),
                        json!({ "attempt": retry_count, "final": true }),
                    )
                    .await?;
                    warn!(
                        "Action {} ({}) failed permanently: {}",
                        action.id,
                        action.label(),
                        message
                    );
                    Ok(Attempt::Failed)
                } else {
                    self.audit(
                        action,
                        LogStatus::Error,
                        message.clone(),
                        json!({ "attempt": retry_count }),
                    )
                    .await?;
                    debug!(
                        "Action {} attempt {} failed: {}",
                        action.id, retry_count, message
                    );
                    Ok(Attempt::Retrying { retry_count })
                }
            }
        }
    }

    /// Deliver one action. Returns the number of conflicts resolved on the
    /// way.
    async fn execute(&self, action: &OfflineAction) -> Result<usize> {
        let mut request = RemoteRequest::for_action(action);
        let mut conflicts = 0;

        let checks_remote = action.action_type == ActionType::Update
            && matches!(action.method, HttpMethod::Put | HttpMethod::Patch);
        if checks_remote {
            if let Some(local) = request.body.as_mut() {
                let snapshot = RemoteRequest::get(action.endpoint.clone(), action.headers.clone());
                match self.send(&snapshot).await {
                    Ok(remote) => {
                        let resolution =
                            self.resolver
                                .reconcile(&action.module, local, &remote.body);
                        if resolution.requires_manual {
                            return Err(Error::ManualResolutionRequired(format!(
                                "{} conflicting field(s) on {}",
                                resolution.conflict_count, action.endpoint
                            )));
                        }
                        if resolution.conflict_count > 0 {
                            debug!(
                                "Resolved {} conflict(s) on {} ({})",
                                resolution.conflict_count, action.endpoint, resolution.strategy
                            );
                            resolution.apply_to(local);
                            conflicts = resolution.conflict_count;
                        }
                    }
                    Err(e @ Error::Shutdown(_)) => return Err(e),
                    Err(e) => debug!(
                        "Could not read {} before update, sending queued payload: {}",
                        action.endpoint, e
                    ),
                }
            }
        }

        let response = self.send(&request).await?;

        if action.method == HttpMethod::Get {
            if let Err(e) = self
                .log
                .cache_data(&action.endpoint, response.body, &action.module)
                .await
            {
                warn!("Failed to cache response for {}: {}", action.endpoint, e);
            }
        }
        Ok(conflicts)
    }

    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse> {
        let timeout = self.config.request_timeout;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                Err(Error::Shutdown("Request abandoned on shutdown".to_string()))
            }
            result = tokio::time::timeout(timeout, self.transport.send(request)) => {
                result.map_err(|_| {
                    Error::Timeout(format!(
                        "{} {} exceeded {:?}",
                        request.method, request.endpoint, timeout
                    ))
                })?
            }
        }
    }

    async fn audit(
        &self,
        action: &OfflineAction,
        status: LogStatus,
        message: String,
        extra: Value,
    ) -> Result<()> {
        let mut details = json!({
            "actionId": action.id,
            "phase": "attempt",
            "method": action.method,
            "endpoint": action.endpoint,
        });
        if let (Value::Object(fields), Value::Object(extra)) = (&mut details, extra) {
            fields.extend(extra);
        }

        self.log
            .add_sync_log(SyncLogEntry::new(
                format!("sync {}", action.label()),
                status,
                message,
                details,
                self.log.clock().now(),
            ))
            .await
    }
}
