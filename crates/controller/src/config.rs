//! TOML seed file loading and database seeding for rooms, pumps,
//! zones, water events, and the settings singleton.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::db::{EventKind, Pump, Room, Settings, WaterEvent, Zone};
use crate::store::ConfigStore;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Option<SettingsEntry>,
    #[serde(default)]
    pub rooms: Vec<RoomEntry>,
    #[serde(default)]
    pub pumps: Vec<PumpEntry>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub events: Vec<EventEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SettingsEntry {
    #[serde(default = "default_pump_startup_delay")]
    pub pump_startup_delay_sec: i64,
    #[serde(default = "default_zone_switch_delay")]
    pub zone_switch_delay_sec: i64,
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_sec: i64,
    #[serde(default = "default_stuck_lock_timeout")]
    pub stuck_lock_timeout_sec: i64,
}

#[derive(Debug, Deserialize)]
pub struct RoomEntry {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub lights_on_entity: Option<String>,
    pub lights_off_entity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PumpEntry {
    pub id: i64,
    pub room_id: i64,
    pub name: String,
    pub lock_entity: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub id: i64,
    pub pump_id: i64,
    pub name: String,
    pub switch_entity: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct EventEntry {
    pub id: i64,
    pub room_id: i64,
    pub kind: EventKind,
    pub name: String,
    pub run_seconds: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub delay_minutes: Option<i64>,
    pub time_of_day: Option<String>,
    #[serde(default)]
    pub zones: Vec<i64>,
}

fn default_true() -> bool {
    true
}

fn default_pump_startup_delay() -> i64 {
    Settings::default().pump_startup_delay_sec
}

fn default_zone_switch_delay() -> i64 {
    Settings::default().zone_switch_delay_sec
}

fn default_scheduler_interval() -> i64 {
    Settings::default().scheduler_interval_sec
}

fn default_stuck_lock_timeout() -> i64 {
    Settings::default().stuck_lock_timeout_sec
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read and parse a TOML seed file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// Upsert everything from the seed file into the store. Parent
/// entities go first so foreign keys hold.
pub async fn apply(config: &Config, store: &ConfigStore) -> Result<()> {
    let db = store.db();

    for r in &config.rooms {
        db.upsert_room(&Room {
            id: r.id,
            name: r.name.clone(),
            enabled: r.enabled,
            lights_on_entity: r.lights_on_entity.clone(),
            lights_off_entity: r.lights_off_entity.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert room '{}'", r.name))?;
    }

    for p in &config.pumps {
        db.upsert_pump(&Pump {
            id: p.id,
            room_id: p.room_id,
            name: p.name.clone(),
            lock_entity: p.lock_entity.clone(),
            enabled: p.enabled,
        })
        .await
        .with_context(|| format!("failed to upsert pump '{}'", p.name))?;
    }

    for z in &config.zones {
        db.upsert_zone(&Zone {
            id: z.id,
            pump_id: z.pump_id,
            name: z.name.clone(),
            switch_entity: z.switch_entity.clone(),
            enabled: z.enabled,
        })
        .await
        .with_context(|| format!("failed to upsert zone '{}'", z.name))?;
    }

    for e in &config.events {
        db.upsert_event(&WaterEvent {
            id: e.id,
            room_id: e.room_id,
            kind: e.kind,
            name: e.name.clone(),
            run_seconds: e.run_seconds,
            enabled: e.enabled,
            delay_minutes: e.delay_minutes,
            time_of_day: e.time_of_day.clone(),
            zone_ids: e.zones.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert event '{}'", e.name))?;
    }

    if let Some(s) = &config.settings {
        db.upsert_settings(&Settings {
            pump_startup_delay_sec: s.pump_startup_delay_sec,
            zone_switch_delay_sec: s.zone_switch_delay_sec,
            scheduler_interval_sec: s.scheduler_interval_sec,
            stuck_lock_timeout_sec: s.stuck_lock_timeout_sec,
        })
        .await
        .context("failed to upsert settings")?;
    }

    store.mark_changed();

    info!(
        rooms = config.rooms.len(),
        pumps = config.pumps.len(),
        zones = config.zones.len(),
        events = config.events.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    const SAMPLE: &str = r#"
[settings]
pump_startup_delay_sec = 5
zone_switch_delay_sec = 2
scheduler_interval_sec = 60
stuck_lock_timeout_sec = 300

[[rooms]]
id = 1
name = "Veg A"
lights_on_entity = "input_datetime.veg_lights_on"
lights_off_entity = "input_datetime.veg_lights_off"

[[pumps]]
id = 1
room_id = 1
name = "Main pump"
lock_entity = "input_boolean.pump_main_lock"

[[zones]]
id = 1
pump_id = 1
name = "Bench 1"
switch_entity = "switch.zone_bench_1"

[[zones]]
id = 2
pump_id = 1
name = "Bench 2"
switch_entity = "switch.zone_bench_2"

[[events]]
id = 1
room_id = 1
kind = "p1"
name = "Morning"
run_seconds = 45
delay_minutes = 30
zones = [1, 2]

[[events]]
id = 2
room_id = 1
kind = "p2"
name = "Midday"
run_seconds = 60
time_of_day = "12:30"
zones = [2]
"#;

    async fn mem_store() -> ConfigStore {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        ConfigStore::new(db)
    }

    #[test]
    fn parse_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.rooms.len(), 1);
        assert_eq!(config.pumps.len(), 1);
        assert_eq!(config.zones.len(), 2);
        assert_eq!(config.events.len(), 2);
        assert_eq!(config.events[0].kind, EventKind::P1);
        assert_eq!(config.events[0].delay_minutes, Some(30));
        assert_eq!(config.events[1].time_of_day.as_deref(), Some("12:30"));
        // enabled defaults to true everywhere.
        assert!(config.rooms[0].enabled);
        assert!(config.zones.iter().all(|z| z.enabled));
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.rooms.is_empty());
        assert!(config.settings.is_none());
    }

    #[test]
    fn parse_rejects_unknown_event_kind() {
        let bad = r#"
[[events]]
id = 1
room_id = 1
kind = "p3"
name = "Nope"
run_seconds = 10
"#;
        assert!(toml::from_str::<Config>(bad).is_err());
    }

    #[tokio::test]
    async fn apply_seeds_store_and_signals_change() {
        let store = mem_store().await;
        let mut changes = store.subscribe();
        let config: Config = toml::from_str(SAMPLE).unwrap();

        apply(&config, &store).await.unwrap();

        let snap = store.snapshot().await.unwrap();
        assert_eq!(snap.rooms.len(), 1);
        assert_eq!(snap.zones.len(), 2);
        assert_eq!(snap.events.len(), 2);
        assert_eq!(snap.events[0].zone_ids, vec![1, 2]);
        assert_eq!(snap.settings.scheduler_interval_sec, 60);
        assert!(changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn apply_rejects_dangling_references() {
        let store = mem_store().await;
        let config: Config = toml::from_str(
            r#"
[[pumps]]
id = 1
room_id = 99
name = "Orphan pump"
lock_entity = "input_boolean.orphan"
"#,
        )
        .unwrap();

        assert!(apply(&config, &store).await.is_err());
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let store = mem_store().await;
        let config: Config = toml::from_str(SAMPLE).unwrap();

        apply(&config, &store).await.unwrap();
        apply(&config, &store).await.unwrap();

        let snap = store.snapshot().await.unwrap();
        assert_eq!(snap.rooms.len(), 1);
        assert_eq!(snap.zones.len(), 2);
    }
}
