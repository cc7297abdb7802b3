//! Host entity API client. Every actuation and entity read the
//! controller performs goes through the `HostApi` capability trait;
//! `HostClient` is the production implementation speaking authenticated
//! HTTP/JSON to the home-automation host's supervisor endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use crate::calculator::parse_time_of_day;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded retries on transient failures.
const MAX_TRIES: u32 = 3;

/// Backoff doubles from the base up to this cap.
const RETRY_CAP: Duration = Duration::from_secs(4);

/// Reads may be served from cache for at most this long.
const READ_CACHE_TTL: Duration = Duration::from_secs(1);

/// Errors from the host API, split by whether retrying can help.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// Host unreachable, request timed out, or 5xx. Retried inside the
    /// client; surfaces only after retry exhaustion.
    #[error("host unreachable: {0}")]
    Transient(String),
    /// Missing entity, 4xx, or malformed response. Never retried.
    #[error("{0}")]
    Permanent(String),
}

/// The four capabilities the controller needs from the host.
#[async_trait]
pub trait HostApi: Clone + Send + Sync + 'static {
    /// Read an entity whose state is a local time of day.
    async fn read_time_of_day(&self, entity: &str) -> Result<NaiveTime, HostError>;

    /// Read an entity whose state is numeric.
    async fn read_number(&self, entity: &str) -> Result<f64, HostError>;

    /// Read an entity whose state is boolean (pump locks).
    async fn read_bool(&self, entity: &str) -> Result<bool, HostError>;

    /// Drive a switch-like entity on or off.
    async fn set_bool(&self, entity: &str, on: bool) -> Result<(), HostError>;
}

/// Interpret a host boolean state string.
pub(crate) fn parse_bool_state(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "locked" => Some(true),
        "off" | "false" | "unlocked" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HostClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    retry_base: Duration,
    cache: Arc<Mutex<HashMap<String, CachedRead>>>,
}

#[derive(Clone)]
struct CachedRead {
    state: String,
    fetched: Instant,
}

impl HostClient {
    pub fn new(base_url: &str, token: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            retry_base: Duration::from_secs(1),
            cache: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Override the initial retry backoff (tests use milliseconds).
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Read an entity's raw state string, via the 1-second read cache.
    async fn state_of(&self, entity: &str) -> Result<String, HostError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(entity) {
                if hit.fetched.elapsed() < READ_CACHE_TTL {
                    return Ok(hit.state.clone());
                }
            }
        }

        let state = self
            .with_retries(entity, || self.request_state(entity))
            .await?;

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            entity.to_string(),
            CachedRead {
                state: state.clone(),
                fetched: Instant::now(),
            },
        );
        Ok(state)
    }

    async fn request_state(&self, entity: &str) -> Result<String, HostError> {
        let url = format!("{}/states/{entity}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| HostError::Transient(format!("GET {url}: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(HostError::Transient(format!("GET {url}: http {status}")));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(HostError::Permanent(format!("entity '{entity}' not found")));
        }
        if !status.is_success() {
            return Err(HostError::Permanent(format!("GET {url}: http {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| HostError::Permanent(format!("bad state body for '{entity}': {e}")))?;
        match body.get("state").and_then(|v| v.as_str()) {
            Some(s) => Ok(s.to_string()),
            None => Err(HostError::Permanent(format!(
                "state body for '{entity}' has no 'state' field"
            ))),
        }
    }

    async fn request_set(&self, entity: &str, on: bool) -> Result<(), HostError> {
        // The service domain is the entity id's prefix ("switch.zone_1"
        // -> "switch"); bare ids fall back to the switch domain.
        let domain = entity.split_once('.').map(|(d, _)| d).unwrap_or("switch");
        let service = if on { "turn_on" } else { "turn_off" };
        let url = format!("{}/services/{domain}/{service}", self.base_url);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "entity_id": entity }))
            .send()
            .await
            .map_err(|e| HostError::Transient(format!("POST {url}: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(HostError::Transient(format!("POST {url}: http {status}")));
        }
        if !status.is_success() {
            return Err(HostError::Permanent(format!("POST {url}: http {status}")));
        }
        Ok(())
    }

    /// Run `op` up to `MAX_TRIES` times, sleeping with doubling backoff
    /// between transient failures. Permanent errors return immediately.
    async fn with_retries<T, Fut>(
        &self,
        entity: &str,
        mut op: impl FnMut() -> Fut,
    ) -> Result<T, HostError>
    where
        Fut: std::future::Future<Output = Result<T, HostError>>,
    {
        let mut delay = self.retry_base;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(HostError::Transient(msg)) if attempt < MAX_TRIES => {
                    warn!(
                        entity = %entity,
                        attempt,
                        max = MAX_TRIES,
                        retry_in_ms = delay.as_millis() as u64,
                        "host request failed transiently: {msg}"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_CAP);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl HostApi for HostClient {
    async fn read_time_of_day(&self, entity: &str) -> Result<NaiveTime, HostError> {
        let state = self.state_of(entity).await?;
        parse_time_of_day(&state).ok_or_else(|| {
            HostError::Permanent(format!("entity '{entity}' state '{state}' is not a time of day"))
        })
    }

    async fn read_number(&self, entity: &str) -> Result<f64, HostError> {
        let state = self.state_of(entity).await?;
        state.trim().parse::<f64>().map_err(|_| {
            HostError::Permanent(format!("entity '{entity}' state '{state}' is not numeric"))
        })
    }

    async fn read_bool(&self, entity: &str) -> Result<bool, HostError> {
        let state = self.state_of(entity).await?;
        parse_bool_state(&state).ok_or_else(|| {
            HostError::Permanent(format!("entity '{entity}' state '{state}' is not boolean"))
        })
    }

    async fn set_bool(&self, entity: &str, on: bool) -> Result<(), HostError> {
        self.with_retries(entity, || self.request_set(entity, on))
            .await?;
        // The write changed the entity; drop any cached read of it.
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(entity);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted in-memory host for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod testing {
    //! In-memory `HostApi` standing in for the retrying HTTP client.
    //! Records every write with its (virtual) timestamp; failures can
    //! be injected per entity and are consumed one write at a time.

    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone, Default)]
    pub struct MockHost {
        inner: Arc<Mutex<MockInner>>,
    }

    #[derive(Default)]
    struct MockInner {
        states: HashMap<String, String>,
        writes: Vec<WriteRecord>,
        fail_writes: HashMap<String, VecDeque<HostError>>,
        fail_reads: HashMap<String, VecDeque<HostError>>,
    }

    #[derive(Debug, Clone)]
    pub struct WriteRecord {
        pub entity: String,
        pub on: bool,
        pub at: Instant,
    }

    impl MockHost {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_state(&self, entity: &str, state: &str) {
            let mut inner = self.inner.lock().unwrap();
            inner.states.insert(entity.to_string(), state.to_string());
        }

        pub fn state(&self, entity: &str) -> Option<String> {
            self.inner.lock().unwrap().states.get(entity).cloned()
        }

        /// All successful writes, in order.
        pub fn writes(&self) -> Vec<WriteRecord> {
            self.inner.lock().unwrap().writes.clone()
        }

        pub fn writes_for(&self, entity: &str) -> Vec<WriteRecord> {
            self.inner
                .lock()
                .unwrap()
                .writes
                .iter()
                .filter(|w| w.entity == entity)
                .cloned()
                .collect()
        }

        /// Make the next write to `entity` fail with `err`.
        pub fn fail_next_write(&self, entity: &str, err: HostError) {
            let mut inner = self.inner.lock().unwrap();
            inner
                .fail_writes
                .entry(entity.to_string())
                .or_default()
                .push_back(err);
        }

        /// Make the next read of `entity` fail with `err`.
        pub fn fail_next_read(&self, entity: &str, err: HostError) {
            let mut inner = self.inner.lock().unwrap();
            inner
                .fail_reads
                .entry(entity.to_string())
                .or_default()
                .push_back(err);
        }

        fn raw_state(&self, entity: &str) -> Result<String, HostError> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(errs) = inner.fail_reads.get_mut(entity) {
                if let Some(err) = errs.pop_front() {
                    return Err(err);
                }
            }
            inner
                .states
                .get(entity)
                .cloned()
                .ok_or_else(|| HostError::Permanent(format!("entity '{entity}' not found")))
        }
    }

    #[async_trait]
    impl HostApi for MockHost {
        async fn read_time_of_day(&self, entity: &str) -> Result<NaiveTime, HostError> {
            let state = self.raw_state(entity)?;
            parse_time_of_day(&state).ok_or_else(|| {
                HostError::Permanent(format!("'{state}' is not a time of day"))
            })
        }

        async fn read_number(&self, entity: &str) -> Result<f64, HostError> {
            let state = self.raw_state(entity)?;
            state
                .parse::<f64>()
                .map_err(|_| HostError::Permanent(format!("'{state}' is not numeric")))
        }

        async fn read_bool(&self, entity: &str) -> Result<bool, HostError> {
            let state = self.raw_state(entity)?;
            parse_bool_state(&state)
                .ok_or_else(|| HostError::Permanent(format!("'{state}' is not boolean")))
        }

        async fn set_bool(&self, entity: &str, on: bool) -> Result<(), HostError> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(errs) = inner.fail_writes.get_mut(entity) {
                if let Some(err) = errs.pop_front() {
                    return Err(err);
                }
            }
            inner.writes.push(WriteRecord {
                entity: entity.to_string(),
                on,
                at: Instant::now(),
            });
            inner
                .states
                .insert(entity.to_string(), if on { "on" } else { "off" }.to_string());
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
