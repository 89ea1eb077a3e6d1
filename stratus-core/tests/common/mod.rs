//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use stratus_core::config::RetryConfig;
use stratus_core::error::{FetchError, StorageError};
use stratus_core::storage::{MemoryObjectStore, ObjectStore, PartitionFormat, StorageLayer};
use stratus_core::{
    Entity, EntityFetcher, FixedClock, PipelineRun, RawPayload, RetryPolicy, TargetDate,
    Transformer, UpstreamClient,
};

pub const PARTITION: &str = "year={year}/month={month}/day={day}";

pub fn target() -> TargetDate {
    TargetDate::from_ymd(2024, 1, 15).unwrap()
}

pub fn ingested_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 16, 1, 0, 0).unwrap()
}

pub fn five_cities() -> Vec<Entity> {
    vec![
        Entity::new("accra", 5.6037, -0.187, "Africa/Accra"),
        Entity::new("london", 51.5074, -0.1278, "Europe/London"),
        Entity::new("tokyo", 35.6762, 139.6503, "Asia/Tokyo"),
        Entity::new("lagos", 6.5244, 3.3792, "Africa/Lagos"),
        Entity::new("sydney", -33.8688, 151.2093, "Australia/Sydney"),
    ]
}

/// An hourly upstream body with `hours` slices starting at midnight of `date`.
pub fn hourly_payload(date: TargetDate, hours: usize, seed: f64) -> RawPayload {
    let times: Vec<String> = (0..hours).map(|h| format!("{}T{:02}:00", date, h)).collect();
    let temps: Vec<f64> = (0..hours).map(|h| seed + h as f64 * 0.5).collect();
    let humidity: Vec<u32> = (0..hours).map(|h| 60 + h as u32).collect();
    let body = serde_json::json!({
        "latitude": seed,
        "longitude": 0.0,
        "timezone": "UTC",
        "hourly_units": {
            "time": "iso8601",
            "temperature_2m": "°C",
            "relative_humidity_2m": "%"
        },
        "hourly": {
            "time": times,
            "temperature_2m": temps,
            "relative_humidity_2m": humidity
        }
    });
    RawPayload::new(serde_json::to_vec_pretty(&body).unwrap())
}

/// One scripted upstream response.
pub enum Step {
    Payload(RawPayload),
    Fail(FetchError),
    Panic(&'static str),
}

/// Upstream that plays per-entity scripts, then falls back to a full day of data.
#[derive(Default)]
pub struct ScriptedUpstream {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, entity: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(entity.to_string(), steps.into());
        self
    }

    pub fn calls(&self, entity: &str) -> u32 {
        self.calls.lock().unwrap().get(entity).copied().unwrap_or(0)
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn request(&self, entity: &Entity, date: TargetDate) -> Result<RawPayload, FetchError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(entity.name.clone())
            .or_default() += 1;
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&entity.name)
            .and_then(VecDeque::pop_front);
        match step {
            Some(Step::Payload(p)) => Ok(p),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Panic(msg)) => panic!("{}", msg),
            None => Ok(hourly_payload(date, 24, entity.latitude)),
        }
    }
}

/// Memory store that rejects writes to keys containing any of the given fragments.
pub struct FlakyStore {
    pub inner: Arc<MemoryObjectStore>,
    fail_puts: Vec<String>,
}

impl FlakyStore {
    pub fn failing_puts(fragments: &[&str]) -> Self {
        Self {
            inner: Arc::new(MemoryObjectStore::new()),
            fail_puts: fragments.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError> {
        if self.fail_puts.iter().any(|f| key.contains(f.as_str())) {
            return Err(StorageError::WriteFailed {
                key: key.to_string(),
                message: "injected write failure".to_string(),
            });
        }
        self.inner.put(key, body, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    fn location(&self) -> String {
        "flaky://".to_string()
    }
}

/// Retry policy with millisecond delays so tests stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(&RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 5,
        jitter: false,
    })
}

pub fn storage(store: Arc<dyn ObjectStore>) -> StorageLayer {
    StorageLayer::new(
        store,
        PartitionFormat::parse(PARTITION).unwrap(),
        "raw",
        "processed",
    )
}

pub fn pipeline(
    upstream: Arc<dyn UpstreamClient>,
    store: Arc<dyn ObjectStore>,
    entities: Vec<Entity>,
) -> PipelineRun {
    PipelineRun::new(
        EntityFetcher::new(upstream, fast_retry()),
        storage(store),
        Transformer::new(Arc::new(FixedClock(ingested_at()))),
        entities,
        24,
    )
}
