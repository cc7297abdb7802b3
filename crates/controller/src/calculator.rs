//! Pure schedule math: when an event fires today, and whether a firing
//! falls inside the current tick window. No I/O, no logging; the
//! scheduler resolves entity reads and reports problems.

use chrono::{Duration, NaiveDateTime, NaiveTime};

use crate::db::{EventKind, WaterEvent};

/// Intra-day deduplication key: one job fan-out per (event, firing).
pub type FiringKey = (i64, NaiveDateTime);

/// Parse a time-of-day state value, "HH:MM:SS" or "HH:MM".
/// "24:00" and other out-of-range values yield `None`.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// Wall-clock instants at which `event` fires during the local day
/// containing `now`.
///
/// `lights_on` is the room's resolved lights-on time; P1 events yield
/// nothing without it. Missing or malformed event fields also yield an
/// empty set — never an error.
pub fn firings_today(
    event: &WaterEvent,
    lights_on: Option<NaiveTime>,
    now: NaiveDateTime,
) -> Vec<NaiveDateTime> {
    match event.kind {
        EventKind::P1 => {
            let (Some(lights_on), Some(delay)) = (lights_on, event.delay_minutes) else {
                return Vec::new();
            };
            // Anchored to today's lights-on; a delay that spills past
            // midnight keeps today's computed instant.
            vec![now.date().and_time(lights_on) + Duration::minutes(delay)]
        }
        EventKind::P2 => {
            let Some(t) = event.time_of_day.as_deref().and_then(parse_time_of_day) else {
                return Vec::new();
            };
            vec![now.date().and_time(t)]
        }
    }
}

/// A firing is due during exactly one tick: `firing <= now < firing + window`.
pub fn is_due(firing: NaiveDateTime, now: NaiveDateTime, window_sec: i64) -> bool {
    firing <= now && now < firing + Duration::seconds(window_sec)
}

/// A firing whose window has fully passed is skipped, not fired late.
pub fn is_missed(firing: NaiveDateTime, now: NaiveDateTime, window_sec: i64) -> bool {
    now >= firing + Duration::seconds(window_sec)
}

// ===========================================================================
// Tests
// ===========================================================================
