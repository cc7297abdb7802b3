//! Per-pump job execution. Each pump gets one worker task owning a
//! bounded FIFO of jobs; the worker holds the pump's lock entity for
//! the whole actuation sequence, so no two zones on a pump ever run
//! at once. Cancellation truncates the current job to the safety
//! shutdown path (zone off, settle, lock off) and drops pending jobs.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::db::{Pump, Settings};
use crate::host::HostApi;
use crate::store::ConfigStore;

/// Timing knobs resolved from the settings singleton when a job is
/// submitted, so the worker never touches the store mid-sequence.
#[derive(Debug, Clone, Copy)]
struct Timings {
    startup: Duration,
    switch_gap: Duration,
    stuck_timeout: Duration,
}

impl From<&Settings> for Timings {
    fn from(s: &Settings) -> Self {
        Self {
            startup: secs(s.pump_startup_delay_sec),
            switch_gap: secs(s.zone_switch_delay_sec),
            stuck_timeout: secs(s.stuck_lock_timeout_sec),
        }
    }
}

/// What actually travels through a pump's queue.
struct QueuedJob {
    job: Job,
    timings: Timings,
}

/// Pending jobs per pump. Overflow means the executor is wedged or the
/// configuration fans out absurdly; submissions are dropped with a
/// warning rather than blocking the scheduler.
pub const QUEUE_CAPACITY: usize = 32;

/// Re-read interval while waiting out an externally held pump lock.
const STUCK_LOCK_POLL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOrigin {
    Scheduled,
    Manual,
}

/// One watering run for one zone on one pump. Built at scheduler tick
/// or manual request, discarded when it leaves the pump queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: u64,
    pub pump_id: i64,
    pub zone_id: i64,
    pub zone_name: String,
    pub switch_entity: String,
    pub run_seconds: i64,
    pub origin: JobOrigin,
    pub submitted_at: NaiveDateTime,
    pub scheduled_for: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Ok,
    Cancelled,
    Failed,
}

// ---------------------------------------------------------------------------
// Status projection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpState {
    Idle,
    Running,
    Queued,
}

/// Cheap read-only view of a pump's executor, published on every
/// state transition.
#[derive(Debug, Clone, Serialize)]
pub struct PumpStatus {
    pub pump_id: i64,
    pub state: PumpState,
    pub active_zone: Option<String>,
    pub queued: usize,
    pub last_error: Option<String>,
}

impl PumpStatus {
    pub fn idle(pump_id: i64) -> Self {
        Self {
            pump_id,
            state: PumpState::Idle,
            active_zone: None,
            queued: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("pump {0} job queue is full")]
    QueueFull(i64),
    #[error("pump {0} executor is not running")]
    Closed(i64),
}

// ---------------------------------------------------------------------------
// Executor handle
// ---------------------------------------------------------------------------

/// Handle to one pump's worker task.
pub struct PumpExecutor {
    pump_id: i64,
    tx: mpsc::Sender<QueuedJob>,
    queued: Arc<AtomicUsize>,
    cancel_tx: Arc<watch::Sender<u64>>,
    status_rx: watch::Receiver<PumpStatus>,
    join: JoinHandle<()>,
}

impl PumpExecutor {
    pub fn spawn<H: HostApi, C: Clock>(
        pump: Pump,
        host: H,
        clock: C,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let queued = Arc::new(AtomicUsize::new(0));
        let (cancel_tx, cancel_rx) = watch::channel(0u64);
        let (status_tx, status_rx) = watch::channel(PumpStatus::idle(pump.id));

        let pump_id = pump.id;
        let worker = Worker {
            pump,
            host,
            clock,
            rx,
            queued: Arc::clone(&queued),
            cancel_rx,
            shutdown,
            status_tx,
            seen_gen: 0,
            holds_lock: false,
            last_error: None,
        };
        let join = tokio::spawn(worker.run());

        Self {
            pump_id,
            tx,
            queued,
            cancel_tx: Arc::new(cancel_tx),
            status_rx,
            join,
        }
    }

    /// Append a job to the FIFO. Non-blocking; returns the queue length
    /// after the append.
    pub fn submit(&self, job: Job, settings: &Settings) -> Result<usize, SubmitError> {
        let queued_job = QueuedJob {
            job,
            timings: settings.into(),
        };
        match self.tx.try_send(queued_job) {
            Ok(()) => Ok(self.queued.fetch_add(1, Ordering::SeqCst) + 1),
            Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull(self.pump_id)),
            Err(TrySendError::Closed(_)) => Err(SubmitError::Closed(self.pump_id)),
        }
    }

    /// Per-pump cancel: drop pending jobs and truncate the current one
    /// to the safety shutdown path.
    pub fn cancel(&self) {
        self.cancel_tx.send_modify(|gen| *gen += 1);
    }

    pub fn status(&self) -> PumpStatus {
        let mut status = self.status_rx.borrow().clone();
        status.queued = self.queued.load(Ordering::SeqCst);
        if status.state == PumpState::Idle && status.queued > 0 {
            status.state = PumpState::Queued;
        }
        status
    }

    /// False once the worker task has exited (including by panic).
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished() && !self.tx.is_closed()
    }

    pub async fn join(self) {
        if let Err(e) = self.join.await {
            if e.is_panic() {
                error!(pump = self.pump_id, "pump executor panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker<H: HostApi, C: Clock> {
    pump: Pump,
    host: H,
    clock: C,
    rx: mpsc::Receiver<QueuedJob>,
    queued: Arc<AtomicUsize>,
    cancel_rx: watch::Receiver<u64>,
    shutdown: watch::Receiver<bool>,
    status_tx: watch::Sender<PumpStatus>,
    /// Cancel generation already handled.
    seen_gen: u64,
    /// True while this worker believes it owns the lock entity.
    holds_lock: bool,
    last_error: Option<String>,
}

impl<H: HostApi, C: Clock> Worker<H, C> {
    async fn run(mut self) {
        info!(pump = self.pump.id, name = %self.pump.name, "pump executor started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.publish(PumpState::Idle, None);

            let seen = self.seen_gen;
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = self.cancel_rx.changed() => {
                    let gen = *self.cancel_rx.borrow_and_update();
                    if gen != seen {
                        self.seen_gen = gen;
                        self.drain_pending("cancelled");
                    }
                }
                queued_job = self.rx.recv() => {
                    let Some(QueuedJob { job, timings }) = queued_job else { break };
                    self.queued.fetch_sub(1, Ordering::SeqCst);

                    // A cancel that raced this job's pop drops it too.
                    let gen = *self.cancel_rx.borrow_and_update();
                    if gen != self.seen_gen {
                        self.seen_gen = gen;
                        debug!(pump = self.pump.id, job = job.job_id, "job dropped by cancel");
                        self.drain_pending("cancelled");
                        continue;
                    }

                    match self.run_job(&job, timings).await {
                        JobOutcome::Completed | JobOutcome::Failed => {}
                        JobOutcome::Cancelled => {
                            self.seen_gen = *self.cancel_rx.borrow_and_update();
                            self.drain_pending("cancelled");
                        }
                    }
                }
            }
        }

        self.drain_pending("shutting down");
        self.publish(PumpState::Idle, None);
        info!(pump = self.pump.id, "pump executor stopped");
    }

    /// Execute one job end to end:
    /// lock on -> startup delay -> zone on -> run -> zone off ->
    /// settle delay -> lock off.
    async fn run_job(&mut self, job: &Job, timings: Timings) -> JobOutcome {
        let Timings {
            startup,
            switch_gap,
            stuck_timeout,
        } = timings;
        let run_for = secs(job.run_seconds);

        info!(
            pump = self.pump.id,
            zone = job.zone_id,
            zone_name = %job.zone_name,
            job = job.job_id,
            origin = ?job.origin,
            run_secs = job.run_seconds,
            queued_secs = (self.clock.now() - job.submitted_at).num_seconds(),
            "job started"
        );
        self.publish(PumpState::Running, Some(job.zone_name.clone()));

        match self.await_lock_clear(stuck_timeout).await {
            StepOutcome::Ok => {}
            StepOutcome::Cancelled => {
                // Nothing driven on yet; abandoning is safe.
                info!(pump = self.pump.id, job = job.job_id, "job cancelled before start");
                return JobOutcome::Cancelled;
            }
            StepOutcome::Failed => return JobOutcome::Failed,
        }

        if let Err(e) = self.host.set_bool(&self.pump.lock_entity, true).await {
            return self.fail_job(job, format!("failed to take pump lock: {e}"));
        }
        self.holds_lock = true;

        // Let the pump pressurise before opening the zone valve.
        if self.sleep_cancellable(startup).await {
            self.safety_shutdown(&job.switch_entity, switch_gap).await;
            info!(pump = self.pump.id, job = job.job_id, "job cancelled during pump startup");
            return JobOutcome::Cancelled;
        }

        if let Err(e) = self.host.set_bool(&job.switch_entity, true).await {
            // The zone never opened; still give the lock back.
            match self.host.set_bool(&self.pump.lock_entity, false).await {
                Ok(()) => self.holds_lock = false,
                Err(e2) => {
                    error!(pump = self.pump.id, "failed to release lock after zone-on failure: {e2}");
                }
            }
            return self.fail_job(job, format!("failed to open zone switch: {e}"));
        }

        if self.sleep_cancellable(run_for).await {
            self.safety_shutdown(&job.switch_entity, switch_gap).await;
            info!(pump = self.pump.id, job = job.job_id, "job cancelled while running");
            return JobOutcome::Cancelled;
        }

        // Shutdown sequence: a zone-off failure is recorded but must
        // never stop the lock release.
        let mut zone_off_error = None;
        if let Err(e) = self.host.set_bool(&job.switch_entity, false).await {
            error!(pump = self.pump.id, zone = job.zone_id, "failed to close zone switch: {e}");
            zone_off_error = Some(format!("failed to close zone switch: {e}"));
        }

        self.clock.sleep(switch_gap).await;

        if let Err(e) = self.host.set_bool(&self.pump.lock_entity, false).await {
            // holds_lock stays set; the next job force-releases it.
            error!(pump = self.pump.id, "failed to release pump lock: {e}");
            self.last_error = Some(format!("failed to release pump lock: {e}"));
        } else {
            self.holds_lock = false;
        }

        if let Some(msg) = zone_off_error {
            self.last_error = Some(msg);
            warn!(pump = self.pump.id, zone = job.zone_id, job = job.job_id, "job finished with errors");
            JobOutcome::Failed
        } else {
            info!(pump = self.pump.id, zone = job.zone_id, job = job.job_id, "job completed");
            JobOutcome::Completed
        }
    }

    /// Make sure the lock entity is clear before taking it. An
    /// externally held lock is waited out up to `stuck_timeout`
    /// (re-reading every 5 s) and then force-reset; a lock left over
    /// from our own failed release is reclaimed immediately.
    async fn await_lock_clear(&mut self, stuck_timeout: Duration) -> StepOutcome {
        let held = match self.host.read_bool(&self.pump.lock_entity).await {
            Ok(v) => v,
            Err(e) => {
                self.record_error(format!("failed to read pump lock: {e}"));
                return StepOutcome::Failed;
            }
        };
        if !held {
            self.holds_lock = false;
            return StepOutcome::Ok;
        }

        if self.holds_lock {
            warn!(pump = self.pump.id, "pump lock still held from previous job, force-releasing");
            return match self.host.set_bool(&self.pump.lock_entity, false).await {
                Ok(()) => {
                    self.holds_lock = false;
                    StepOutcome::Ok
                }
                Err(e) => {
                    self.record_error(format!("failed to force-release own lock: {e}"));
                    StepOutcome::Failed
                }
            };
        }

        warn!(
            pump = self.pump.id,
            entity = %self.pump.lock_entity,
            "pump lock held externally, waiting for it to clear"
        );
        let mut waited = Duration::ZERO;
        while waited < stuck_timeout {
            let step = STUCK_LOCK_POLL.min(stuck_timeout - waited);
            if self.sleep_cancellable(step).await {
                return StepOutcome::Cancelled;
            }
            waited += step;
            match self.host.read_bool(&self.pump.lock_entity).await {
                Ok(false) => {
                    info!(pump = self.pump.id, waited_secs = waited.as_secs(), "pump lock cleared");
                    return StepOutcome::Ok;
                }
                Ok(true) => {}
                Err(e) => {
                    self.record_error(format!("failed to re-read pump lock: {e}"));
                    return StepOutcome::Failed;
                }
            }
        }

        warn!(
            pump = self.pump.id,
            entity = %self.pump.lock_entity,
            timeout_secs = stuck_timeout.as_secs(),
            "stuck pump lock, force-resetting"
        );
        match self.host.set_bool(&self.pump.lock_entity, false).await {
            Ok(()) => StepOutcome::Ok,
            Err(e) => {
                self.record_error(format!("failed to force-reset stuck lock: {e}"));
                StepOutcome::Failed
            }
        }
    }

    /// Best-effort safety path for a truncated job: both off-writes are
    /// always attempted, whatever fails in between.
    async fn safety_shutdown(&mut self, switch_entity: &str, switch_gap: Duration) {
        warn!(pump = self.pump.id, "truncating job: forcing zone and lock off");
        if let Err(e) = self.host.set_bool(switch_entity, false).await {
            error!(pump = self.pump.id, "shutdown: failed to close zone switch: {e}");
            self.last_error = Some(format!("shutdown: failed to close zone switch: {e}"));
        }

        self.clock.sleep(switch_gap).await;

        if let Err(e) = self.host.set_bool(&self.pump.lock_entity, false).await {
            error!(pump = self.pump.id, "shutdown: failed to release pump lock: {e}");
            self.last_error = Some(format!("shutdown: failed to release pump lock: {e}"));
        } else {
            self.holds_lock = false;
        }
    }

    /// Sleep that returns early (true) on per-pump cancel or global
    /// shutdown.
    async fn sleep_cancellable(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return false;
        }
        let seen = self.seen_gen;
        tokio::select! {
            _ = self.clock.sleep(duration) => false,
            _ = self.shutdown.wait_for(|stop| *stop) => true,
            _ = self.cancel_rx.wait_for(move |gen| *gen != seen) => true,
        }
    }

    fn drain_pending(&mut self, reason: &str) {
        let mut dropped = 0usize;
        while let Ok(QueuedJob { job, .. }) = self.rx.try_recv() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            debug!(pump = self.pump.id, job = job.job_id, zone = job.zone_id, "pending job dropped");
            dropped += 1;
        }
        if dropped > 0 {
            info!(pump = self.pump.id, dropped, "cleared pending jobs ({reason})");
        }
    }

    fn fail_job(&mut self, job: &Job, msg: String) -> JobOutcome {
        error!(pump = self.pump.id, zone = job.zone_id, job = job.job_id, "{msg}");
        self.last_error = Some(msg);
        JobOutcome::Failed
    }

    fn record_error(&mut self, msg: String) {
        error!(pump = self.pump.id, "{msg}");
        self.last_error = Some(msg);
    }

    fn publish(&self, state: PumpState, active_zone: Option<String>) {
        self.status_tx.send_replace(PumpStatus {
            pump_id: self.pump.id,
            state,
            active_zone,
            queued: self.queued.load(Ordering::SeqCst),
            last_error: self.last_error.clone(),
        });
    }
}

fn secs(v: i64) -> Duration {
    Duration::from_secs(v.max(0) as u64)
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Lazily-created executors, one per pump. Shared by the scheduler,
/// the manual controller, and the status surface. A worker that died
/// (panic) is replaced on the next submission.
pub struct ExecutorPool<H: HostApi, C: Clock> {
    host: H,
    clock: C,
    store: ConfigStore,
    shutdown: watch::Receiver<bool>,
    inner: Mutex<HashMap<i64, PumpExecutor>>,
}

impl<H: HostApi, C: Clock> ExecutorPool<H, C> {
    pub fn new(host: H, clock: C, store: ConfigStore, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            host,
            clock,
            store,
            shutdown,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a job to its pump's executor, creating the executor on
    /// first use. The current settings ride along with the job.
    pub async fn submit(&self, pump: &Pump, job: Job) -> Result<usize, SubmitError> {
        debug_assert_eq!(pump.id, job.pump_id);
        let settings = match self.store.snapshot().await {
            Ok(snap) => snap.settings.clone(),
            Err(e) => {
                warn!(pump = pump.id, "using default settings, snapshot failed: {e:#}");
                Settings::default()
            }
        };

        let mut map = self.inner.lock().await;
        let exec = match map.entry(pump.id) {
            Entry::Occupied(mut o) => {
                if !o.get().is_alive() {
                    warn!(pump = pump.id, "pump executor died, restarting it");
                    o.insert(self.spawn_executor(pump));
                }
                o.into_mut()
            }
            Entry::Vacant(v) => v.insert(self.spawn_executor(pump)),
        };
        exec.submit(job, &settings)
    }

    /// Cancel a pump's executor. Returns the status observed just
    /// before the cancel, or `None` if the pump never ran anything.
    pub async fn cancel(&self, pump_id: i64) -> Option<PumpStatus> {
        let map = self.inner.lock().await;
        map.get(&pump_id).map(|exec| {
            let status = exec.status();
            exec.cancel();
            status
        })
    }

    pub async fn status_of(&self, pump_id: i64) -> Option<PumpStatus> {
        let map = self.inner.lock().await;
        map.get(&pump_id).map(|exec| exec.status())
    }

    /// Wait for every executor to wind down, bounded by `grace`.
    /// Workers still running after the grace period are abandoned.
    pub async fn shutdown_all(&self, grace: Duration) {
        let execs: Vec<PumpExecutor> = {
            let mut map = self.inner.lock().await;
            map.drain().map(|(_, exec)| exec).collect()
        };
        if execs.is_empty() {
            return;
        }

        let count = execs.len();
        let drain = async {
            for exec in execs {
                exec.join().await;
            }
        };
        match tokio::time::timeout(grace, drain).await {
            Ok(()) => info!(executors = count, "all pump executors stopped"),
            Err(_) => warn!(
                grace_secs = grace.as_secs(),
                "pump executors did not quiesce within the grace period"
            ),
        }
    }

    fn spawn_executor(&self, pump: &Pump) -> PumpExecutor {
        PumpExecutor::spawn(
            pump.clone(),
            self.host.clone(),
            self.clock.clone(),
            self.shutdown.clone(),
        )
    }
}

// ===========================================================================
// Tests
// ===========================================================================
