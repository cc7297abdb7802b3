//! Read-mostly configuration view. The core reads whole snapshots;
//! writers (seed file, external CRUD layer) go through `Db` and bump
//! the change generation so the scheduler refreshes its working set.

use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::watch;

use crate::db::{Db, Pump, Room, Settings, WaterEvent, Zone};

/// A dangling reference discovered while resolving a snapshot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("zone {0} does not exist")]
    UnknownZone(i64),
    #[error("zone {zone_id} references missing pump {pump_id}")]
    MissingPump { zone_id: i64, pump_id: i64 },
}

/// Immutable, internally consistent view of the full configuration.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub rooms: Vec<Room>,
    pub pumps: Vec<Pump>,
    pub zones: Vec<Zone>,
    pub events: Vec<WaterEvent>,
    pub settings: Settings,
}

impl Snapshot {
    pub fn pump(&self, id: i64) -> Option<&Pump> {
        self.pumps.iter().find(|p| p.id == id)
    }

    pub fn zone(&self, id: i64) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    /// Resolve a zone and the pump that feeds it.
    pub fn zone_with_pump(&self, zone_id: i64) -> Result<(&Zone, &Pump), ConfigError> {
        let zone = self.zone(zone_id).ok_or(ConfigError::UnknownZone(zone_id))?;
        let pump = self.pump(zone.pump_id).ok_or(ConfigError::MissingPump {
            zone_id,
            pump_id: zone.pump_id,
        })?;
        Ok((zone, pump))
    }

    /// Enabled events belonging to a room, ascending by id.
    pub fn events_for_room(&self, room_id: i64) -> impl Iterator<Item = &WaterEvent> {
        self.events
            .iter()
            .filter(move |e| e.room_id == room_id && e.enabled)
    }
}

/// Handle to the configuration store: snapshot reads plus a change
/// signal for the scheduler.
#[derive(Clone)]
pub struct ConfigStore {
    db: Db,
    changed: Arc<watch::Sender<u64>>,
}

impl ConfigStore {
    pub fn new(db: Db) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            db,
            changed: Arc::new(changed),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Assemble one coherent snapshot. SQLite foreign keys guarantee
    /// referential integrity of what comes back; resolve-time checks
    /// (`zone_with_pump`) cover the window between loads.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        let rooms = self.db.load_rooms().await?;
        let pumps = self.db.load_pumps().await?;
        let zones = self.db.load_zones().await?;
        let events = self.db.load_events().await?;
        let settings = self.db.load_settings().await?;

        Ok(Arc::new(Snapshot {
            rooms,
            pumps,
            zones,
            events,
            settings,
        }))
    }

    /// Subscribe to configuration-change notifications. The value is a
    /// generation counter; consumers only care that it moved.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Signal that the configuration was written. Called after the
    /// seed-file apply and by the external CRUD layer.
    pub fn mark_changed(&self) {
        self.changed.send_modify(|gen| *gen += 1);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
