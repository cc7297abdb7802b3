//! Event scheduler: one cooperative worker that wakes on each tick
//! boundary, evaluates every enabled water event against the current
//! configuration snapshot, and fans due firings out as jobs to the
//! pump executors.
//!
//! Firings are deduplicated per day by `(event, firing)` so a firing
//! produces jobs during exactly one tick; firings whose window has
//! already passed are skipped with a warning, never fired late.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::calculator::{self, FiringKey};
use crate::clock::Clock;
use crate::db::{EventKind, Pump, Room, Settings, WaterEvent};
use crate::executor::{ExecutorPool, Job, JobOrigin};
use crate::host::HostApi;
use crate::store::{ConfigStore, Snapshot};

pub struct Scheduler<H: HostApi, C: Clock> {
    store: ConfigStore,
    host: H,
    clock: C,
    pool: Arc<ExecutorPool<H, C>>,
    shutdown: watch::Receiver<bool>,
    changes: watch::Receiver<u64>,
    next_job_id: Arc<AtomicU64>,
    /// Firing keys already handled today (submitted or skipped).
    fired: HashSet<FiringKey>,
    fired_day: Option<NaiveDate>,
    /// Tick interval from the last snapshot; sleeps are aligned to it.
    tick_interval: i64,
}

/// A job paired with the sort/submit context it needs.
struct Submission {
    event_id: i64,
    pump: Pump,
    job: Job,
}

impl<H: HostApi, C: Clock> Scheduler<H, C> {
    pub fn new(
        store: ConfigStore,
        host: H,
        clock: C,
        pool: Arc<ExecutorPool<H, C>>,
        shutdown: watch::Receiver<bool>,
        next_job_id: Arc<AtomicU64>,
    ) -> Self {
        let changes = store.subscribe();
        Self {
            store,
            host,
            clock,
            pool,
            shutdown,
            changes,
            next_job_id,
            fired: HashSet::new(),
            fired_day: None,
            tick_interval: Settings::default().scheduler_interval_sec,
        }
    }

    /// Run until the supervisor cancels. Intended to be
    /// `tokio::spawn`-ed.
    pub async fn run(mut self) {
        info!("scheduler started");

        loop {
            // Sleep to the next boundary aligned to the tick interval.
            let interval = self.tick_interval.max(1);
            let now = self.clock.now();
            let into = now.time().num_seconds_from_midnight() as i64 % interval;
            let wait = Duration::from_secs((interval - into) as u64);

            tokio::select! {
                _ = self.clock.sleep(wait) => {}
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                _ = self.changes.changed() => {
                    debug!("configuration changed, realigning tick");
                    continue;
                }
            }

            let now = self.clock.now();
            self.tick(now).await;
        }

        info!("scheduler stopped");
    }

    /// One evaluation pass over the whole configuration.
    async fn tick(&mut self, now: NaiveDateTime) {
        let snap = match self.store.snapshot().await {
            Ok(snap) => snap,
            Err(e) => {
                error!("scheduler: snapshot failed: {e:#}");
                return;
            }
        };

        // Day rollover clears the dedup set so daily events fire again.
        if self.fired_day != Some(now.date()) {
            if self.fired_day.is_some() {
                info!(day = %now.date(), "new day, clearing firing dedup set");
            }
            self.fired.clear();
            self.fired_day = Some(now.date());
        }

        let window = snap.settings.scheduler_interval_sec.max(1);
        self.tick_interval = window;
        let mut batch: Vec<Submission> = Vec::new();

        for room in snap.rooms.iter().filter(|r| r.enabled) {
            let events: Vec<&WaterEvent> = snap.events_for_room(room.id).collect();
            if events.is_empty() {
                continue;
            }

            // One lights-on read per room per tick, and only when a P1
            // event actually needs it.
            let lights_on = if events.iter().any(|e| e.kind == EventKind::P1) {
                self.lights_on_for(room).await
            } else {
                None
            };

            for event in events {
                let firings = calculator::firings_today(event, lights_on, now);
                if firings.is_empty() {
                    match event.kind {
                        // Missing/unreadable lights-on was warned at read time.
                        EventKind::P1 if lights_on.is_none() => {}
                        EventKind::P1 => warn!(
                            event = event.id,
                            name = %event.name,
                            "p1 event has no delay configured, skipping"
                        ),
                        EventKind::P2 => warn!(
                            event = event.id,
                            name = %event.name,
                            time_of_day = ?event.time_of_day,
                            "p2 event has an invalid time of day, skipping"
                        ),
                    }
                    continue;
                }

                for firing in firings {
                    let key: FiringKey = (event.id, firing);
                    if self.fired.contains(&key) {
                        continue;
                    }
                    if calculator::is_due(firing, now, window) {
                        self.fired.insert(key);
                        self.build_jobs(&snap, event, firing, now, &mut batch);
                    } else if calculator::is_missed(firing, now, window) {
                        warn!(
                            event = event.id,
                            name = %event.name,
                            firing = %firing,
                            "missed firing window, skipping"
                        );
                        self.fired.insert(key);
                    }
                }
            }
        }

        if batch.is_empty() {
            return;
        }

        // Deterministic submission order within a tick.
        batch.sort_by(|a, b| {
            (a.job.scheduled_for, a.event_id, a.job.zone_id)
                .cmp(&(b.job.scheduled_for, b.event_id, b.job.zone_id))
        });

        info!(jobs = batch.len(), "submitting scheduled jobs");
        for Submission { pump, job, .. } in batch {
            if let Err(e) = self.pool.submit(&pump, job).await {
                // A full queue means the executor is wedged or the
                // fan-out is misconfigured; drop rather than block.
                warn!(pump = pump.id, "dropping scheduled job: {e}");
            }
        }
    }

    /// Resolve a room's lights-on time, warning on any failure.
    async fn lights_on_for(&self, room: &Room) -> Option<NaiveTime> {
        let entity = match room.lights_on_entity.as_deref() {
            Some(e) => e,
            None => {
                warn!(room = room.id, name = %room.name, "room has no lights-on entity, p1 events skipped");
                return None;
            }
        };
        match self.host.read_time_of_day(entity).await {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(room = room.id, entity, "failed to read lights-on time: {e}");
                None
            }
        }
    }

    /// Build one job per assigned, enabled zone of a due event.
    fn build_jobs(
        &self,
        snap: &Snapshot,
        event: &WaterEvent,
        firing: NaiveDateTime,
        now: NaiveDateTime,
        batch: &mut Vec<Submission>,
    ) {
        if event.zone_ids.is_empty() {
            warn!(event = event.id, name = %event.name, "due event has no zones assigned");
            return;
        }

        for &zone_id in &event.zone_ids {
            let (zone, pump) = match snap.zone_with_pump(zone_id) {
                Ok(v) => v,
                Err(e) => {
                    warn!(event = event.id, "skipping zone with dangling reference: {e}");
                    continue;
                }
            };
            if !zone.enabled {
                debug!(zone = zone.id, "zone disabled, skipping");
                continue;
            }
            if !pump.enabled {
                debug!(zone = zone.id, pump = pump.id, "pump disabled, skipping");
                continue;
            }

            batch.push(Submission {
                event_id: event.id,
                pump: pump.clone(),
                job: Job {
                    job_id: self.next_job_id.fetch_add(1, Ordering::SeqCst),
                    pump_id: pump.id,
                    zone_id: zone.id,
                    zone_name: zone.name.clone(),
                    switch_entity: zone.switch_entity.clone(),
                    run_seconds: event.run_seconds,
                    origin: JobOrigin::Scheduled,
                    submitted_at: now,
                    scheduled_for: firing,
                },
            });
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
