//! # Stratus Core
//!
//! Execution engine for the Stratus ingestion pipeline.
//! Provides the per-entity fetch state machine with classified retry, the
//! fault-isolating run loop, partition-addressed raw/processed storage,
//! normalization, scheduling with missed-run handling, and configuration.

pub mod config;
pub mod error;
pub mod fetch;
pub mod lock;
pub mod persistence;
pub mod pipeline;
pub mod retry;
pub mod schedule;
pub mod storage;
pub mod transform;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{PipelineConfig, load_config};
pub use error::{ErrorKind, Result, StratusError};
pub use fetch::{EntityFetcher, HttpUpstream, UpstreamClient};
pub use pipeline::{PipelineRun, RunTrigger};
pub use retry::RetryPolicy;
pub use schedule::ScheduleController;
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStore, StorageLayer};
pub use transform::{Clock, FixedClock, SystemClock, Transformer};
pub use types::{
    Entity, EntityOutcome, EntityState, EntityStatus, FetchOutcome, RawPayload, RunId, RunSummary,
    TargetDate,
};
