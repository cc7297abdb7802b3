//! Supervisor: owns the lifetime tree. It creates the executor pool,
//! the scheduler, and the manual controller, holds the single
//! cancellation root, and winds everything down within a bounded grace
//! period on shutdown.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::Clock;
use crate::executor::{ExecutorPool, PumpState, PumpStatus};
use crate::host::HostApi;
use crate::manual::ManualController;
use crate::scheduler::Scheduler;
use crate::store::ConfigStore;

/// Status projection for the whole controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub uptime_secs: u64,
    pub pumps: Vec<PumpStatusEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PumpStatusEntry {
    pub pump_id: i64,
    pub name: String,
    pub state: PumpState,
    pub active_zone: Option<String>,
    pub queued: usize,
    pub last_error: Option<String>,
}

pub struct Supervisor<H: HostApi, C: Clock> {
    store: ConfigStore,
    shutdown_tx: watch::Sender<bool>,
    pool: Arc<ExecutorPool<H, C>>,
    manual: ManualController<H, C>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    started: std::time::Instant,
}

impl<H: HostApi, C: Clock> Supervisor<H, C> {
    /// Wire up and start the core: executor pool, scheduler worker,
    /// manual controller. Returns once everything is running.
    pub fn start(store: ConfigStore, host: H, clock: C) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let next_job_id = Arc::new(AtomicU64::new(1));

        let pool = Arc::new(ExecutorPool::new(
            host.clone(),
            clock.clone(),
            store.clone(),
            shutdown_rx.clone(),
        ));

        let scheduler = Scheduler::new(
            store.clone(),
            host,
            clock.clone(),
            Arc::clone(&pool),
            shutdown_rx.clone(),
            Arc::clone(&next_job_id),
        );
        let scheduler_task = tokio::spawn(scheduler.run());

        let manual = ManualController::new(
            store.clone(),
            Arc::clone(&pool),
            clock,
            shutdown_rx,
            next_job_id,
        );

        info!("supervisor started");
        Self {
            store,
            shutdown_tx,
            pool,
            manual,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            started: std::time::Instant::now(),
        }
    }

    /// Handle for the manual control surface.
    pub fn manual(&self) -> ManualController<H, C> {
        self.manual.clone()
    }

    /// Per-pump status projection for every configured pump. Pumps
    /// that never ran a job report idle.
    pub async fn status(&self) -> Result<ControllerStatus> {
        let snap = self.store.snapshot().await?;
        let mut pumps = Vec::with_capacity(snap.pumps.len());
        for pump in &snap.pumps {
            let status = self
                .pool
                .status_of(pump.id)
                .await
                .unwrap_or_else(|| PumpStatus::idle(pump.id));
            pumps.push(PumpStatusEntry {
                pump_id: pump.id,
                name: pump.name.clone(),
                state: status.state,
                active_zone: status.active_zone,
                queued: status.queued,
                last_error: status.last_error,
            });
        }
        Ok(ControllerStatus {
            uptime_secs: self.started.elapsed().as_secs(),
            pumps,
        })
    }

    /// Trigger global cancellation and wait for quiescence, bounded by
    /// twice the stuck-lock timeout. In-flight jobs run their safety
    /// shutdown path; anything still wedged after the grace period is
    /// abandoned.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");

        let stuck_timeout = match self.store.snapshot().await {
            Ok(snap) => snap.settings.stuck_lock_timeout_sec.max(1) as u64,
            Err(_) => crate::db::Settings::default().stuck_lock_timeout_sec as u64,
        };
        let grace = Duration::from_secs(2 * stuck_timeout);

        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.scheduler_task.lock().await.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("scheduler panicked during shutdown");
                }
            }
        }

        self.pool.shutdown_all(grace).await;
        info!("supervisor shutdown complete");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::TestClock;
    use crate::db::{Db, EventKind, Pump, Room, WaterEvent, Zone};
    use crate::host::testing::MockHost;

    const LOCK: &str = "input_boolean.pump_main_lock";
    const SWITCH_1: &str = "switch.zone_bench_1";

    async fn seeded_store() -> ConfigStore {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_room(&Room {
            id: 1,
            name: "Veg A".into(),
            enabled: true,
            lights_on_entity: None,
            lights_off_entity: None,
        })
        .await
        .unwrap();
        db.upsert_pump(&Pump {
            id: 1,
            room_id: 1,
            name: "Main pump".into(),
            lock_entity: LOCK.into(),
            enabled: true,
        })
        .await
        .unwrap();
        db.upsert_zone(&Zone {
            id: 1,
            pump_id: 1,
            name: "Bench 1".into(),
            switch_entity: SWITCH_1.into(),
            enabled: true,
        })
        .await
        .unwrap();
        db.upsert_event(&WaterEvent {
            id: 1,
            room_id: 1,
            kind: EventKind::P2,
            name: "Afternoon".into(),
            run_seconds: 10,
            enabled: true,
            delay_minutes: None,
            time_of_day: Some("14:00".into()),
            zone_ids: vec![1],
        })
        .await
        .unwrap();
        ConfigStore::new(db)
    }

    #[tokio::test]
    async fn scheduled_event_runs_end_to_end() {
        let store = seeded_store().await;
        tokio::time::pause();
        let host = MockHost::new();
        host.set_state(LOCK, "off");
        let clock = TestClock::starting_at("2024-06-01 13:59:58");

        let supervisor = Supervisor::start(store, host.clone(), clock);

        // Tick boundary at 14:00:00 submits the job; the run itself is
        // 5 + 10 + 2 = 17s.
        for _ in 0..600 {
            if host.writes().len() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let writes = host.writes();
        let seq: Vec<(&str, bool)> = writes.iter().map(|w| (w.entity.as_str(), w.on)).collect();
        assert_eq!(
            seq,
            vec![(LOCK, true), (SWITCH_1, true), (SWITCH_1, false), (LOCK, false)]
        );
        let first = writes[0].at;
        assert_eq!((writes[3].at - first).as_secs(), 17);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_lists_every_configured_pump() {
        let store = seeded_store().await;
        let host = MockHost::new();
        host.set_state(LOCK, "off");
        let clock = TestClock::starting_at("2024-06-01 10:00:00");

        let supervisor = Supervisor::start(store, host, clock);
        let status = supervisor.status().await.unwrap();
        assert_eq!(status.pumps.len(), 1);
        assert_eq!(status.pumps[0].name, "Main pump");
        assert_eq!(status.pumps[0].state, PumpState::Idle);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_truncates_in_flight_manual_job() {
        let store = seeded_store().await;
        tokio::time::pause();
        let host = MockHost::new();
        host.set_state(LOCK, "off");
        let clock = TestClock::starting_at("2024-06-01 10:00:00");

        let supervisor = Supervisor::start(store, host.clone(), clock);
        let manual = supervisor.manual();
        manual.run_zone(1, 600).await.unwrap();

        // Lock on at 0, zone on at 5; shut down mid-run at t=10.
        tokio::time::sleep(Duration::from_secs(10)).await;
        supervisor.shutdown().await;

        let writes = host.writes();
        let seq: Vec<(&str, bool)> = writes.iter().map(|w| (w.entity.as_str(), w.on)).collect();
        assert_eq!(
            seq,
            vec![(LOCK, true), (SWITCH_1, true), (SWITCH_1, false), (LOCK, false)]
        );

        // Further manual submissions are refused.
        assert!(manual.run_zone(1, 5).await.is_err());
    }
}
