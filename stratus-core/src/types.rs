//! Core domain types for the stratus pipeline.

use bytes::Bytes;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ErrorKind, FetchError};

/// One independently-ingested unit of collection: a monitored location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique name; also the file stem of every artifact for this entity.
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// IANA timezone the upstream should align hourly slices to.
    pub timezone: String,
}

impl Entity {
    pub fn new(
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
        timezone: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
            timezone: timezone.into(),
        }
    }
}

/// The calendar date whose full data period is ingested by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetDate(NaiveDate);

impl TargetDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    /// The most recently completed full day relative to `now` (UTC).
    pub fn yesterday_of(now: DateTime<Utc>) -> Self {
        Self(now.date_naive() - Duration::days(1))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn day(&self) -> u32 {
        self.0.day()
    }

    pub fn succ(&self) -> Option<Self> {
        self.0.succ_opt().map(Self)
    }
}

impl fmt::Display for TargetDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for TargetDate {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map(Self)
    }
}

impl From<NaiveDate> for TargetDate {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

/// The unmodified upstream response body for one entity and date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(Bytes);

impl RawPayload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single measurement cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Null,
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Null => Ok(()),
        }
    }
}

/// One time-sliced observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub entity: String,
    pub date: TargetDate,
    /// `None` when the upstream time label could not be parsed.
    pub timestamp: Option<NaiveDateTime>,
    pub ingested_at: DateTime<Utc>,
    /// Measurement values, aligned with [`NormalizedTable::columns`].
    pub values: Vec<FieldValue>,
}

/// The full normalized dataset for one entity at one target date.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedTable {
    /// Unit-suffixed measurement column names, sorted by source variable name.
    pub columns: Vec<String>,
    pub rows: Vec<NormalizedRow>,
}

impl NormalizedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Columns that precede the measurements in every processed artifact.
    pub const LEADING_COLUMNS: [&'static str; 4] = ["entity", "date", "timestamp", "ingested_at"];

    /// Header row of the processed artifact.
    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = Self::LEADING_COLUMNS
            .iter()
            .map(|s| s.to_string())
            .collect();
        header.extend(self.columns.iter().cloned());
        header
    }
}

/// Terminal result of one fetcher invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success {
        payload: RawPayload,
        attempts: u32,
    },
    Failure {
        error: FetchError,
        attempts_used: u32,
    },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            FetchOutcome::Success { attempts, .. } => *attempts,
            FetchOutcome::Failure { attempts_used, .. } => *attempts_used,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            FetchOutcome::Success { .. } => None,
            FetchOutcome::Failure { error, .. } => Some(error.kind()),
        }
    }
}

/// Per-entity state machine position inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Pending,
    Fetching,
    Fetched,
    FetchFailed,
    StoringRaw,
    RawStored,
    Transforming,
    Transformed,
    TransformFailed,
    StoringProcessed,
    StoreFailed,
    Done,
}

impl EntityState {
    /// The state reached when the current step succeeds.
    pub fn on_success(self) -> Option<EntityState> {
        use EntityState::*;
        match self {
            Pending => Some(Fetching),
            Fetching => Some(Fetched),
            Fetched => Some(StoringRaw),
            StoringRaw => Some(RawStored),
            RawStored => Some(Transforming),
            Transforming => Some(Transformed),
            Transformed => Some(StoringProcessed),
            StoringProcessed => Some(Done),
            FetchFailed | TransformFailed | StoreFailed | Done => None,
        }
    }

    /// The terminal state reached when the current step fails.
    pub fn on_failure(self) -> Option<EntityState> {
        use EntityState::*;
        match self {
            Fetching => Some(FetchFailed),
            StoringRaw | StoringProcessed => Some(StoreFailed),
            Transforming => Some(TransformFailed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntityState::Done
                | EntityState::FetchFailed
                | EntityState::TransformFailed
                | EntityState::StoreFailed
        )
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityState::Pending => "pending",
            EntityState::Fetching => "fetching",
            EntityState::Fetched => "fetched",
            EntityState::FetchFailed => "fetch_failed",
            EntityState::StoringRaw => "storing_raw",
            EntityState::RawStored => "raw_stored",
            EntityState::Transforming => "transforming",
            EntityState::Transformed => "transformed",
            EntityState::TransformFailed => "transform_failed",
            EntityState::StoringProcessed => "storing_processed",
            EntityState::StoreFailed => "store_failed",
            EntityState::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// Opaque identifier correlating all activity of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How one entity ended up in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityStatus {
    Done {
        rows: usize,
        raw_key: String,
        processed_key: String,
    },
    Failed {
        /// The terminal state the entity reached.
        state: EntityState,
        /// The step that was in progress when it failed.
        stage: EntityState,
        kind: ErrorKind,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity: String,
    /// Upstream attempts spent; zero if fetching never started.
    pub attempts: u32,
    #[serde(flatten)]
    pub status: EntityStatus,
}

impl EntityOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self.status, EntityStatus::Done { .. })
    }

    pub fn rows(&self) -> usize {
        match self.status {
            EntityStatus::Done { rows, .. } => rows,
            EntityStatus::Failed { .. } => 0,
        }
    }
}

/// Aggregate over one pipeline run; immutable once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub target_date: TargetDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcomes: Vec<EntityOutcome>,
    pub successes: usize,
    pub failures: usize,
    pub total_rows: usize,
    pub expected_rows_per_entity: usize,
}

impl RunSummary {
    /// Tallies outcomes; row counts only come from entities that reached `Done`.
    pub fn finalize(
        run_id: RunId,
        target_date: TargetDate,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
        outcomes: Vec<EntityOutcome>,
        expected_rows_per_entity: usize,
    ) -> Self {
        let successes = outcomes.iter().filter(|o| o.is_done()).count();
        let failures = outcomes.len() - successes;
        let total_rows = outcomes.iter().map(EntityOutcome::rows).sum();
        Self {
            run_id,
            target_date,
            started_at,
            finished_at,
            duration_ms,
            outcomes,
            successes,
            failures,
            total_rows,
            expected_rows_per_entity,
        }
    }

    pub fn expected_total_rows(&self) -> usize {
        self.successes * self.expected_rows_per_entity
    }

    /// `total_rows == successes × expected_rows_per_entity`. Anything else is an anomaly.
    pub fn row_count_consistent(&self) -> bool {
        self.total_rows == self.expected_total_rows()
    }

    pub fn failed_entities(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.is_done())
            .map(|o| o.entity.as_str())
            .collect()
    }
}
