//! Pipeline run orchestration.
//!
//! A run walks every configured entity, in configuration order, through
//! `Pending → Fetching → Fetched → StoringRaw → RawStored → Transforming → Transformed →
//! StoringProcessed → Done`. A failure (or panic) at any step is caught at the entity
//! boundary and recorded; the loop always moves on to the next entity and always
//! produces exactly one [`RunSummary`].

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::PipelineConfig;
use crate::error::{ConfigError, ErrorKind};
use crate::fetch::{EntityFetcher, UpstreamClient};
use crate::persistence;
use crate::retry::RetryPolicy;
use crate::storage::{ArtifactKind, ObjectStore, StorageLayer};
use crate::transform::{Clock, Transformer};
use crate::types::{
    Entity, EntityOutcome, EntityState, EntityStatus, FetchOutcome, RunId, RunSummary, TargetDate,
};

/// Something that can execute a full run for a target date.
///
/// The schedule controller depends on this rather than on [`PipelineRun`] directly.
#[async_trait]
pub trait RunTrigger: Send + Sync {
    async fn run(&self, date: TargetDate) -> RunSummary;
}

struct StageFailure {
    kind: ErrorKind,
    error: String,
}

struct Completed {
    rows: usize,
    raw_key: String,
    processed_key: String,
}

pub struct PipelineRun {
    fetcher: EntityFetcher,
    storage: StorageLayer,
    transformer: Transformer,
    entities: Vec<Entity>,
    expected_rows_per_entity: usize,
    summary_dir: Option<PathBuf>,
}

impl PipelineRun {
    pub fn new(
        fetcher: EntityFetcher,
        storage: StorageLayer,
        transformer: Transformer,
        entities: Vec<Entity>,
        expected_rows_per_entity: usize,
    ) -> Self {
        Self {
            fetcher,
            storage,
            transformer,
            entities,
            expected_rows_per_entity,
            summary_dir: None,
        }
    }

    /// Wire a run from validated configuration and the external collaborators.
    pub fn from_config(
        config: &PipelineConfig,
        upstream: Arc<dyn UpstreamClient>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let storage = StorageLayer::from_config(store, &config.storage)?;
        let fetcher = EntityFetcher::new(upstream, RetryPolicy::new(&config.retry));
        let mut run = Self::new(
            fetcher,
            storage,
            Transformer::new(clock),
            config.entities.clone(),
            config.pipeline.expected_rows_per_entity,
        );
        run.summary_dir = config.pipeline.summary_dir.clone();
        Ok(run)
    }

    pub fn with_summary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.summary_dir = Some(dir.into());
        self
    }

    /// Execute one run. Never fails: every entity's fate is in the summary.
    pub async fn execute(&self, date: TargetDate) -> RunSummary {
        let run_id = RunId::new();
        let span = info_span!("pipeline_run", run_id = %run_id, target_date = %date);
        self.execute_with_id(run_id, date).instrument(span).await
    }

    async fn execute_with_id(&self, run_id: RunId, date: TargetDate) -> RunSummary {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            entities = self.entities.len(),
            partition = %self.storage.partition_key(date),
            "Pipeline starting"
        );

        let mut outcomes = Vec::with_capacity(self.entities.len());
        for entity in &self.entities {
            let span = info_span!("entity", entity = %entity.name);
            let outcome = self.isolate(entity, date).instrument(span).await;
            outcomes.push(outcome);
        }

        let summary = RunSummary::finalize(
            run_id,
            date,
            started_at,
            Utc::now(),
            clock.elapsed().as_millis() as u64,
            outcomes,
            self.expected_rows_per_entity,
        );
        self.report(&summary);
        summary
    }

    /// Run one entity's state machine, converting errors and panics into an outcome.
    async fn isolate(&self, entity: &Entity, date: TargetDate) -> EntityOutcome {
        let mut state = EntityState::Pending;
        let mut attempts = 0;

        let result = AssertUnwindSafe(self.process(entity, date, &mut state, &mut attempts))
            .catch_unwind()
            .await;

        let status = match result {
            Ok(Ok(done)) => EntityStatus::Done {
                rows: done.rows,
                raw_key: done.raw_key,
                processed_key: done.processed_key,
            },
            Ok(Err(failure)) => self.failed(entity, state, failure),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let kind = match terminal_state_for(state) {
                    EntityState::FetchFailed => ErrorKind::Request,
                    EntityState::TransformFailed => ErrorKind::Transform,
                    _ => ErrorKind::Storage,
                };
                self.failed(
                    entity,
                    state,
                    StageFailure {
                        kind,
                        error: format!("panic: {}", message),
                    },
                )
            }
        };

        EntityOutcome {
            entity: entity.name.clone(),
            attempts,
            status,
        }
    }

    fn failed(&self, entity: &Entity, stage: EntityState, failure: StageFailure) -> EntityStatus {
        let terminal = terminal_state_for(stage);
        error!(
            entity = %entity.name,
            stage = %stage,
            state = %terminal,
            kind = %failure.kind,
            error = %failure.error,
            "Entity failed"
        );
        EntityStatus::Failed {
            state: terminal,
            stage,
            kind: failure.kind,
            error: failure.error,
        }
    }

    async fn process(
        &self,
        entity: &Entity,
        date: TargetDate,
        state: &mut EntityState,
        attempts: &mut u32,
    ) -> Result<Completed, StageFailure> {
        advance(state); // Fetching
        let outcome = self.fetcher.fetch(entity, date).await;
        *attempts = outcome.attempts();
        let payload = match outcome {
            FetchOutcome::Success { payload, .. } => payload,
            FetchOutcome::Failure { error, .. } => {
                return Err(StageFailure {
                    kind: error.kind(),
                    error: error.to_string(),
                });
            }
        };
        advance(state); // Fetched

        advance(state); // StoringRaw
        let raw_key = self
            .storage
            .write_raw(&entity.name, date, &payload)
            .await
            .map_err(storage_failure)?;
        // Transform what was durably stored, not the in-memory copy.
        let stored = self
            .storage
            .read_raw(&entity.name, date)
            .await
            .map_err(storage_failure)?;
        advance(state); // RawStored

        advance(state); // Transforming
        let table = self
            .transformer
            .normalize(&entity.name, date, &stored)
            .map_err(|e| StageFailure {
                kind: ErrorKind::Transform,
                error: e.to_string(),
            })?;
        advance(state); // Transformed

        advance(state); // StoringProcessed
        let processed_key = self
            .storage
            .write_processed(&entity.name, date, &table)
            .await
            .map_err(storage_failure)?;
        advance(state); // Done

        info!(entity = %entity.name, rows = table.len(), "Entity done");
        Ok(Completed {
            rows: table.len(),
            raw_key,
            processed_key,
        })
    }

    fn report(&self, summary: &RunSummary) {
        let failed = summary.failed_entities();
        info!(
            successes = summary.successes,
            failures = summary.failures,
            total_rows = summary.total_rows,
            expected_rows = summary.expected_total_rows(),
            duration_ms = summary.duration_ms,
            failed_entities = ?failed,
            dataset = %format!(
                "{}/{}",
                self.storage.location(),
                self.storage.partition_prefix(ArtifactKind::Processed, summary.target_date)
            ),
            summary = %serde_json::to_string(summary).unwrap_or_default(),
            "Pipeline complete: {}/{} entities succeeded",
            summary.successes,
            summary.outcomes.len()
        );

        if !summary.row_count_consistent() {
            warn!(
                total_rows = summary.total_rows,
                expected_rows = summary.expected_total_rows(),
                "Row count does not match successful entities x expected rows per entity"
            );
        }
        if summary.successes == 0 && !summary.outcomes.is_empty() {
            error!("All entities failed");
        }

        if let Some(dir) = &self.summary_dir {
            let path = dir.join(format!("{}.json", summary.run_id));
            match persistence::atomic_write_json(&path, summary) {
                Ok(()) => debug!(path = %path.display(), "Run summary persisted"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to persist run summary"),
            }
        }
    }
}

#[async_trait]
impl RunTrigger for PipelineRun {
    async fn run(&self, date: TargetDate) -> RunSummary {
        self.execute(date).await
    }
}

fn advance(state: &mut EntityState) {
    if let Some(next) = state.on_success() {
        debug!(from = %state, to = %next, "Entity transition");
        *state = next;
    }
}

fn storage_failure(err: crate::error::StorageError) -> StageFailure {
    StageFailure {
        kind: ErrorKind::Storage,
        error: err.to_string(),
    }
}

/// The terminal failure state for a fault observed while in `stage`.
///
/// Faults between steps are attributed to the step about to start.
pub(crate) fn terminal_state_for(stage: EntityState) -> EntityState {
    stage
        .on_failure()
        .or_else(|| stage.on_success().and_then(EntityState::on_failure))
        .unwrap_or(EntityState::FetchFailed)
}
