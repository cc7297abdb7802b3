//! Manual control path: ad-hoc zone runs and per-pump emergency stop.
//! Manual jobs go through the same pump FIFOs as scheduled ones, with
//! no priority; the `enabled` flags on zone and pump are deliberately
//! ignored so an operator can always exercise hardware.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::clock::Clock;
use crate::executor::{ExecutorPool, Job, JobOrigin, PumpState};
use crate::host::HostApi;
use crate::store::ConfigStore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManualError {
    #[error("zone {0} not found")]
    ZoneNotFound(i64),
    #[error("pump {0} not found")]
    PumpNotFound(i64),
    #[error("duration must be greater than zero, got {0}")]
    DurationInvalid(i64),
    #[error("executors are unavailable (shutting down)")]
    ExecutorUnavailable,
}

/// Receipt for a queued manual run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManualRun {
    pub job_id: u64,
    pub zone_id: i64,
    pub zone_name: String,
    pub pump_id: i64,
    pub pump_name: String,
    pub duration_seconds: i64,
    pub queue_position: usize,
}

/// Receipt for an emergency stop.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManualStop {
    pub pump_id: i64,
    pub pump_name: String,
    /// Zone whose run was truncated, if one was running.
    pub interrupted_zone: Option<String>,
    /// Pending jobs dropped from the queue.
    pub cleared_jobs: usize,
}

#[derive(Clone)]
pub struct ManualController<H: HostApi, C: Clock> {
    store: ConfigStore,
    pool: Arc<ExecutorPool<H, C>>,
    clock: C,
    shutdown: watch::Receiver<bool>,
    next_job_id: Arc<AtomicU64>,
}

impl<H: HostApi, C: Clock> ManualController<H, C> {
    pub fn new(
        store: ConfigStore,
        pool: Arc<ExecutorPool<H, C>>,
        clock: C,
        shutdown: watch::Receiver<bool>,
        next_job_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            store,
            pool,
            clock,
            shutdown,
            next_job_id,
        }
    }

    /// Queue an ad-hoc run for a zone. Returns as soon as the job is
    /// queued; it executes whenever the pump frees up.
    pub async fn run_zone(
        &self,
        zone_id: i64,
        duration_seconds: i64,
    ) -> Result<ManualRun, ManualError> {
        if *self.shutdown.borrow() {
            return Err(ManualError::ExecutorUnavailable);
        }
        if duration_seconds <= 0 {
            return Err(ManualError::DurationInvalid(duration_seconds));
        }

        let snap = self
            .store
            .snapshot()
            .await
            .map_err(|_| ManualError::ExecutorUnavailable)?;
        let zone = snap.zone(zone_id).ok_or(ManualError::ZoneNotFound(zone_id))?;
        let pump = snap
            .pump(zone.pump_id)
            .ok_or(ManualError::PumpNotFound(zone.pump_id))?;

        let now = self.clock.now();
        let job = Job {
            job_id: self.next_job_id.fetch_add(1, Ordering::SeqCst),
            pump_id: pump.id,
            zone_id: zone.id,
            zone_name: zone.name.clone(),
            switch_entity: zone.switch_entity.clone(),
            run_seconds: duration_seconds,
            origin: JobOrigin::Manual,
            submitted_at: now,
            scheduled_for: now,
        };
        let job_id = job.job_id;

        let queue_position = self
            .pool
            .submit(pump, job)
            .await
            .map_err(|_| ManualError::ExecutorUnavailable)?;

        info!(
            zone = zone.id,
            zone_name = %zone.name,
            pump = pump.id,
            job = job_id,
            duration_seconds,
            queue_position,
            "manual run queued"
        );

        Ok(ManualRun {
            job_id,
            zone_id: zone.id,
            zone_name: zone.name.clone(),
            pump_id: pump.id,
            pump_name: pump.name.clone(),
            duration_seconds,
            queue_position,
        })
    }

    /// Emergency stop: truncate the pump's current job through the
    /// safety shutdown path and drop everything still queued. The
    /// cancel is issued before anything else so it lands immediately.
    pub async fn stop_pump(&self, pump_id: i64) -> Result<ManualStop, ManualError> {
        let before = self.pool.cancel(pump_id).await;

        let snap = self
            .store
            .snapshot()
            .await
            .map_err(|_| ManualError::ExecutorUnavailable)?;
        let pump = snap.pump(pump_id).ok_or(ManualError::PumpNotFound(pump_id))?;
        let (interrupted_zone, cleared_jobs) = match before {
            Some(status) => (
                if status.state == PumpState::Running {
                    status.active_zone
                } else {
                    None
                },
                status.queued,
            ),
            // The pump never ran anything; nothing to stop.
            None => (None, 0),
        };

        info!(
            pump = pump.id,
            name = %pump.name,
            interrupted = ?interrupted_zone,
            cleared_jobs,
            "emergency stop"
        );

        Ok(ManualStop {
            pump_id: pump.id,
            pump_name: pump.name.clone(),
            interrupted_zone,
            cleared_jobs,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
