//! SQLite persistence (via sqlx) for the configuration entities:
//! rooms, pumps, zones, water events, event-zone assignments, and the
//! settings singleton. The runtime never writes here; writes come from
//! the seed file and the external CRUD layer.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Configuration entities
// ---------------------------------------------------------------------------

/// A grow room. Owns pumps and water events; its lights-on entity
/// anchors P1 event times.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Room {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub lights_on_entity: Option<String>,
    pub lights_off_entity: Option<String>,
}

/// A pump. `lock_entity` is both the physical actuator and the
/// mutual-exclusion signal for every zone on this pump.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Pump {
    pub id: i64,
    pub room_id: i64,
    pub name: String,
    pub lock_entity: String,
    pub enabled: bool,
}

/// A watering zone, actuated through `switch_entity`. Belongs to
/// exactly one pump.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Zone {
    pub id: i64,
    pub pump_id: i64,
    pub name: String,
    pub switch_entity: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Fires at lights-on + `delay_minutes`.
    P1,
    /// Fires at a fixed local `time_of_day`.
    P2,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::P1 => "p1",
            EventKind::P2 => "p2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "p1" => Some(EventKind::P1),
            "p2" => Some(EventKind::P2),
            _ => None,
        }
    }
}

/// A scheduled watering event for a room, fanned out to its assigned
/// zones when due.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterEvent {
    pub id: i64,
    pub room_id: i64,
    pub kind: EventKind,
    pub name: String,
    pub run_seconds: i64,
    pub enabled: bool,
    /// P1 only: minutes after lights-on.
    pub delay_minutes: Option<i64>,
    /// P2 only: "HH:MM" or "HH:MM:SS" local time.
    pub time_of_day: Option<String>,
    /// Zones this event waters, ascending by id.
    pub zone_ids: Vec<i64>,
}

/// System-wide timing settings (singleton row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Settings {
    pub pump_startup_delay_sec: i64,
    pub zone_switch_delay_sec: i64,
    pub scheduler_interval_sec: i64,
    pub stuck_lock_timeout_sec: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pump_startup_delay_sec: 5,
            zone_switch_delay_sec: 2,
            scheduler_interval_sec: 60,
            stuck_lock_timeout_sec: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rooms (
      id INTEGER PRIMARY KEY,
      name TEXT NOT NULL,
      enabled INTEGER NOT NULL DEFAULT 1,
      lights_on_entity TEXT,
      lights_off_entity TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pumps (
      id INTEGER PRIMARY KEY,
      room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
      name TEXT NOT NULL,
      lock_entity TEXT NOT NULL,
      enabled INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS zones (
      id INTEGER PRIMARY KEY,
      pump_id INTEGER NOT NULL REFERENCES pumps(id) ON DELETE CASCADE,
      name TEXT NOT NULL,
      switch_entity TEXT NOT NULL,
      enabled INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS water_events (
      id INTEGER PRIMARY KEY,
      room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
      kind TEXT NOT NULL CHECK (kind IN ('p1', 'p2')),
      name TEXT NOT NULL,
      run_seconds INTEGER NOT NULL,
      enabled INTEGER NOT NULL DEFAULT 1,
      delay_minutes INTEGER,
      time_of_day TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS water_event_zones (
      event_id INTEGER NOT NULL REFERENCES water_events(id) ON DELETE CASCADE,
      zone_id INTEGER NOT NULL REFERENCES zones(id) ON DELETE CASCADE,
      PRIMARY KEY (event_id, zone_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
      id INTEGER PRIMARY KEY CHECK (id = 1),
      pump_startup_delay_sec INTEGER NOT NULL DEFAULT 5,
      zone_switch_delay_sec INTEGER NOT NULL DEFAULT 2,
      scheduler_interval_sec INTEGER NOT NULL DEFAULT 60,
      stuck_lock_timeout_sec INTEGER NOT NULL DEFAULT 300
    )
    "#,
];

// ---------------------------------------------------------------------------
// Db
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: i64,
    room_id: i64,
    kind: String,
    name: String,
    run_seconds: i64,
    enabled: bool,
    delay_minutes: Option<i64>,
    time_of_day: Option<String>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/data/irrigation.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // One connection: the store is read-mostly and tiny, and a
        // single connection keeps ":memory:" databases coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(3600))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Create all tables if they don't exist yet.
    pub async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("schema migration failed")?;
        }
        Ok(())
    }

    // ----------------------------
    // Rooms
    // ----------------------------

    pub async fn upsert_room(&self, r: &Room) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rooms (id, name, enabled, lights_on_entity, lights_off_entity)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              enabled=excluded.enabled,
              lights_on_entity=excluded.lights_on_entity,
              lights_off_entity=excluded.lights_off_entity
            "#,
        )
        .bind(r.id)
        .bind(&r.name)
        .bind(r.enabled)
        .bind(&r.lights_on_entity)
        .bind(&r.lights_off_entity)
        .execute(&self.pool)
        .await
        .context("upsert_room failed")?;
        Ok(())
    }

    pub async fn load_rooms(&self) -> Result<Vec<Room>> {
        sqlx::query_as::<_, Room>(
            "SELECT id, name, enabled, lights_on_entity, lights_off_entity FROM rooms ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_rooms failed")
    }

    // ----------------------------
    // Pumps
    // ----------------------------

    pub async fn upsert_pump(&self, p: &Pump) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pumps (id, room_id, name, lock_entity, enabled)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              room_id=excluded.room_id,
              name=excluded.name,
              lock_entity=excluded.lock_entity,
              enabled=excluded.enabled
            "#,
        )
        .bind(p.id)
        .bind(p.room_id)
        .bind(&p.name)
        .bind(&p.lock_entity)
        .bind(p.enabled)
        .execute(&self.pool)
        .await
        .context("upsert_pump failed")?;
        Ok(())
    }

    pub async fn load_pumps(&self) -> Result<Vec<Pump>> {
        sqlx::query_as::<_, Pump>(
            "SELECT id, room_id, name, lock_entity, enabled FROM pumps ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_pumps failed")
    }

    // ----------------------------
    // Zones
    // ----------------------------

    pub async fn upsert_zone(&self, z: &Zone) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zones (id, pump_id, name, switch_entity, enabled)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              pump_id=excluded.pump_id,
              name=excluded.name,
              switch_entity=excluded.switch_entity,
              enabled=excluded.enabled
            "#,
        )
        .bind(z.id)
        .bind(z.pump_id)
        .bind(&z.name)
        .bind(&z.switch_entity)
        .bind(z.enabled)
        .execute(&self.pool)
        .await
        .context("upsert_zone failed")?;
        Ok(())
    }

    pub async fn load_zones(&self) -> Result<Vec<Zone>> {
        sqlx::query_as::<_, Zone>(
            "SELECT id, pump_id, name, switch_entity, enabled FROM zones ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_zones failed")
    }

    // ----------------------------
    // Water events
    // ----------------------------

    /// Upsert an event and replace its zone assignments atomically.
    pub async fn upsert_event(&self, e: &WaterEvent) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin failed")?;

        sqlx::query(
            r#"
            INSERT INTO water_events
              (id, room_id, kind, name, run_seconds, enabled, delay_minutes, time_of_day)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              room_id=excluded.room_id,
              kind=excluded.kind,
              name=excluded.name,
              run_seconds=excluded.run_seconds,
              enabled=excluded.enabled,
              delay_minutes=excluded.delay_minutes,
              time_of_day=excluded.time_of_day
            "#,
        )
        .bind(e.id)
        .bind(e.room_id)
        .bind(e.kind.as_str())
        .bind(&e.name)
        .bind(e.run_seconds)
        .bind(e.enabled)
        .bind(e.delay_minutes)
        .bind(&e.time_of_day)
        .execute(&mut *tx)
        .await
        .context("upsert_event failed")?;

        sqlx::query("DELETE FROM water_event_zones WHERE event_id = ?")
            .bind(e.id)
            .execute(&mut *tx)
            .await
            .context("clear event zones failed")?;

        for zone_id in &e.zone_ids {
            sqlx::query("INSERT INTO water_event_zones (event_id, zone_id) VALUES (?, ?)")
                .bind(e.id)
                .bind(zone_id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("assign zone {zone_id} to event {} failed", e.id))?;
        }

        tx.commit().await.context("commit failed")?;
        Ok(())
    }

    pub async fn load_events(&self) -> Result<Vec<WaterEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, room_id, kind, name, run_seconds, enabled, delay_minutes, time_of_day
            FROM water_events
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_events failed")?;

        let assignments = sqlx::query_as::<_, (i64, i64)>(
            "SELECT event_id, zone_id FROM water_event_zones ORDER BY event_id, zone_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load event zones failed")?;

        let mut events: Vec<WaterEvent> = Vec::with_capacity(rows.len());
        for r in rows {
            let kind = EventKind::parse(&r.kind)
                .with_context(|| format!("event {} has unknown kind '{}'", r.id, r.kind))?;
            events.push(WaterEvent {
                id: r.id,
                room_id: r.room_id,
                kind,
                name: r.name,
                run_seconds: r.run_seconds,
                enabled: r.enabled,
                delay_minutes: r.delay_minutes,
                time_of_day: r.time_of_day,
                zone_ids: Vec::new(),
            });
        }

        for (event_id, zone_id) in assignments {
            if let Some(ev) = events.iter_mut().find(|e| e.id == event_id) {
                ev.zone_ids.push(zone_id);
            }
        }

        Ok(events)
    }

    // ----------------------------
    // Settings singleton
    // ----------------------------

    pub async fn upsert_settings(&self, s: &Settings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings
              (id, pump_startup_delay_sec, zone_switch_delay_sec,
               scheduler_interval_sec, stuck_lock_timeout_sec)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              pump_startup_delay_sec=excluded.pump_startup_delay_sec,
              zone_switch_delay_sec=excluded.zone_switch_delay_sec,
              scheduler_interval_sec=excluded.scheduler_interval_sec,
              stuck_lock_timeout_sec=excluded.stuck_lock_timeout_sec
            "#,
        )
        .bind(s.pump_startup_delay_sec)
        .bind(s.zone_switch_delay_sec)
        .bind(s.scheduler_interval_sec)
        .bind(s.stuck_lock_timeout_sec)
        .execute(&self.pool)
        .await
        .context("upsert_settings failed")?;
        Ok(())
    }

    /// Returns the singleton settings row, or the defaults if it has
    /// never been written.
    pub async fn load_settings(&self) -> Result<Settings> {
        let row = sqlx::query_as::<_, Settings>(
            r#"
            SELECT pump_startup_delay_sec, zone_switch_delay_sec,
                   scheduler_interval_sec, stuck_lock_timeout_sec
            FROM settings
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("load_settings failed")?;

        Ok(row.unwrap_or_default())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
