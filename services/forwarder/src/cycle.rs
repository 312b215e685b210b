//! The forwarder loop.
//!
//! One cycle = maintenance (when due) -> backoff gate -> select batch ->
//! remote delivery -> record outcome locally. The queue lock is taken for each
//! local operation separately and is never held across a remote call, so the
//! producer can keep appending while a delivery is in flight.
//!
//! No error leaves the loop. Every failure becomes a backoff decision:
//!
//! | failure                    | attempts        | backoff curve |
//! |----------------------------|-----------------|---------------|
//! | remote (any class)         | +1 per reading  | remote        |
//! | rejected reading(s) only   | +1 per rejected | remote        |
//! | local queue                | unchanged       | local         |

use crate::backoff::{BackoffPolicy, BackoffScheduler};
use crate::config::RelayConfig;
use crate::gateway::UpsertGateway;
use crate::remote::{DeviceInfo, RemoteError, RemoteStore};
use crate::selector::BatchSelector;
use crate::sweeper::MaintenanceSweeper;
use chrono::{NaiveDate, Utc};
use relay_queue::{QueueError, QueueStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shortest pause between cycles while delivery is off.
const DELIVERY_OFF_MIN_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl CycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::Queue(_) => "local",
            CycleError::Remote(e) => e.kind(),
        }
    }
}

/// Outcome of one `Forwarder::step`.
#[derive(Debug)]
pub enum Step {
    /// No remote configured; only maintenance ran.
    DeliveryOff,
    /// Backoff window still closed; no remote work done.
    BackingOff { remaining: Duration },
    /// Nothing pending.
    Idle,
    /// Whole batch stored remotely. `backlog` is set when the batch was full.
    Delivered { sent: usize, backlog: bool },
    /// The cycle failed; `sent` readings were still stored before or around it.
    Failed {
        cause: CycleError,
        sent: usize,
        wait: Duration,
    },
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub interval: Duration,
    pub idle_poll: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retention_days: Option<u32>,
    pub remote_backoff: BackoffPolicy,
    pub local_backoff: BackoffPolicy,
}

impl ForwarderSettings {
    pub fn from_config(cfg: &RelayConfig) -> Self {
        let f = &cfg.forwarder;
        ForwarderSettings {
            interval: f.interval,
            idle_poll: f.idle_poll,
            batch_size: f.batch_size,
            max_attempts: f.max_attempts,
            retention_days: cfg.retention.enabled.then_some(cfg.retention.days),
            remote_backoff: BackoffPolicy {
                base: f.backoff_base,
                ceiling: f.backoff_ceiling,
                exponent_cap: f.backoff_exponent_cap,
            },
            local_backoff: BackoffPolicy {
                base: f.backoff_base,
                ceiling: f.local_backoff_ceiling,
                exponent_cap: f.local_exponent_cap,
            },
        }
    }
}

impl Step {
    /// How long the loop pauses after this step.
    pub fn pause(&self, settings: &ForwarderSettings) -> Duration {
        match self {
            Step::DeliveryOff => settings.interval.max(DELIVERY_OFF_MIN_PAUSE),
            Step::BackingOff { remaining } => settings.idle_poll.min(*remaining),
            Step::Idle | Step::Delivered { backlog: false, .. } => settings.interval,
            Step::Delivered { backlog: true, .. } => Duration::ZERO,
            Step::Failed { wait, .. } => settings.idle_poll.min(*wait),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state (read by the status endpoint)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ForwarderState {
    pub delivery_enabled: bool,
    pub consecutive_failures: u32,
    pub next_attempt_at: Instant,
    pub last_maintenance_date: Option<NaiveDate>,
}

pub type SharedState = Arc<RwLock<ForwarderState>>;

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

pub struct Forwarder<R> {
    queue: Arc<Mutex<QueueStore>>,
    /// None runs the loop with delivery off.
    remote: Option<R>,
    identity: DeviceInfo,
    settings: ForwarderSettings,
    selector: BatchSelector,
    sweeper: MaintenanceSweeper,
    backoff: BackoffScheduler,
    /// Failed attempts the queue could not record yet.
    uncounted: Vec<Uuid>,
    state: SharedState,
}

impl<R: RemoteStore> Forwarder<R> {
    pub fn new(
        queue: Arc<Mutex<QueueStore>>,
        remote: Option<R>,
        identity: DeviceInfo,
        settings: ForwarderSettings,
    ) -> Self {
        let now = Instant::now();
        let state = Arc::new(RwLock::new(ForwarderState {
            delivery_enabled: remote.is_some(),
            consecutive_failures: 0,
            next_attempt_at: now,
            last_maintenance_date: None,
        }));
        Forwarder {
            queue,
            selector: BatchSelector::new(settings.batch_size),
            sweeper: MaintenanceSweeper::new(settings.max_attempts, settings.retention_days),
            backoff: BackoffScheduler::new(now),
            uncounted: Vec::new(),
            remote,
            identity,
            settings,
            state,
        }
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn settings(&self) -> &ForwarderSettings {
        &self.settings
    }

    /// Run cycles until `shutdown` flips to true. An in-flight cycle always
    /// completes before the loop exits.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            device_key = %self.identity.device_key,
            delivery_enabled = self.remote.is_some(),
            interval_secs = self.settings.interval.as_secs_f64(),
            batch_size = self.settings.batch_size,
            "forwarder loop started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let step = self.step().await;
            let pause = step.pause(&self.settings);
            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("forwarder loop stopped");
    }

    /// One full cycle.
    pub async fn step(&mut self) -> Step {
        self.maintain().await;
        let step = self.deliver().await;
        self.publish().await;
        step
    }

    async fn maintain(&mut self) {
        let mut queue = self.queue.lock().await;
        if let Err(e) = self.sweeper.run_if_due(&mut queue, Utc::now()) {
            warn!(error = %e, transient = e.is_transient(), "maintenance sweep failed, will retry");
        }
    }

    async fn deliver(&mut self) -> Step {
        if self.remote.is_none() {
            return Step::DeliveryOff;
        }

        let now = Instant::now();
        if !self.backoff.is_open(now) {
            return Step::BackingOff {
                remaining: self.backoff.remaining(now),
            };
        }

        if let Err(e) = self.flush_uncounted().await {
            return self.local_failure(e, 0);
        }

        let selected = {
            let queue = self.queue.lock().await;
            self.selector.next_batch(&queue)
        };
        let batch = match selected {
            Ok(batch) => batch,
            Err(e) => return self.local_failure(e, 0),
        };
        if batch.is_empty() {
            debug!("queue idle");
            return Step::Idle;
        }

        let Some(remote) = self.remote.as_ref() else {
            return Step::DeliveryOff;
        };
        let ids: Vec<Uuid> = batch.iter().map(|q| q.reading.id).collect();
        let outcome = UpsertGateway::new(remote, &self.identity)
            .deliver_batch(&batch)
            .await;

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                self.count_attempts(&ids).await;
                return self.remote_failure(e, 0);
            }
        };

        let sent = report.delivered.len();
        let rejected: Vec<Uuid> = report.rejected.iter().map(|r| r.id).collect();
        {
            let mut queue = self.queue.lock().await;
            if let Err(e) = queue.mark_synced(&report.delivered) {
                // Delivered rows stay pending; the idempotent upsert absorbs the re-send.
                drop(queue);
                return self.local_failure(e, sent);
            }
        }

        if !rejected.is_empty() {
            self.count_attempts(&rejected).await;
            let cause = RemoteError::Rejected(format!(
                "{} of {} readings rejected",
                rejected.len(),
                batch.len()
            ));
            return self.remote_failure(cause, sent);
        }

        self.backoff.record_success(Instant::now());
        info!(sent, write_calls = report.write_calls, "batch delivered");
        Step::Delivered {
            sent,
            backlog: self.selector.is_full(batch.len()),
        }
    }

    /// Record one failed attempt per id. Ids the queue refuses are kept and
    /// recorded before the next batch is selected.
    async fn count_attempts(&mut self, ids: &[Uuid]) {
        let result = self.queue.lock().await.mark_failed_attempt(ids);
        if let Err(e) = result {
            warn!(error = %e, batch = ids.len(), "could not record failed attempts, deferring");
            self.uncounted.extend_from_slice(ids);
        }
    }

    async fn flush_uncounted(&mut self) -> Result<(), QueueError> {
        if self.uncounted.is_empty() {
            return Ok(());
        }
        self.queue.lock().await.mark_failed_attempt(&self.uncounted)?;
        debug!(recorded = self.uncounted.len(), "deferred attempts recorded");
        self.uncounted.clear();
        Ok(())
    }

    /// Failed attempts waiting to be written to the queue.
    pub fn uncounted_attempts(&self) -> usize {
        self.uncounted.len()
    }

    fn remote_failure(&mut self, err: RemoteError, sent: usize) -> Step {
        let wait = self
            .backoff
            .record_failure(Instant::now(), &self.settings.remote_backoff);
        warn!(
            kind = err.kind(),
            transient = err.is_transient(),
            error = %err,
            sent,
            failures = self.backoff.consecutive_failures(),
            wait_secs = wait.as_secs(),
            "delivery cycle failed"
        );
        Step::Failed {
            cause: err.into(),
            sent,
            wait,
        }
    }

    fn local_failure(&mut self, err: QueueError, sent: usize) -> Step {
        let wait = self
            .backoff
            .record_failure(Instant::now(), &self.settings.local_backoff);
        warn!(
            error = %err,
            transient = err.is_transient(),
            failures = self.backoff.consecutive_failures(),
            wait_secs = wait.as_secs(),
            "local queue error"
        );
        Step::Failed {
            cause: err.into(),
            sent,
            wait,
        }
    }

    async fn publish(&self) {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.consecutive_failures = self.backoff.consecutive_failures();
        state.next_attempt_at = now + self.backoff.remaining(now);
        state.last_maintenance_date = self.sweeper.last_run();
    }
}
