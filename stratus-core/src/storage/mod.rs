//! Partition-addressed storage of raw and processed artifacts.
//!
//! Every artifact lives at `{prefix}/{partition}/{entity}.{ext}`. Addresses are a pure
//! function of (kind, target date, entity), and writes replace whatever the address held,
//! so re-running a date never creates new addresses.

pub mod backend;
pub mod csv;
pub mod partition;

pub use backend::{LocalObjectStore, MemoryObjectStore, ObjectStore};
pub use partition::{PartitionFormat, PartitionKey};

use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

use crate::config::StorageConfig;
use crate::error::{ConfigError, StorageError};
use crate::types::{NormalizedTable, RawPayload, TargetDate};

/// Which layer an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Raw,
    Processed,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Raw => "json",
            ArtifactKind::Processed => "csv",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArtifactKind::Raw => "application/json",
            ArtifactKind::Processed => "text/csv",
        }
    }
}

/// Reads and writes artifacts at deterministic partition-derived addresses.
///
/// Storage failures are returned, never retried here and never swallowed.
#[derive(Clone)]
pub struct StorageLayer {
    store: Arc<dyn ObjectStore>,
    format: PartitionFormat,
    raw_prefix: String,
    processed_prefix: String,
}

impl StorageLayer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        format: PartitionFormat,
        raw_prefix: impl Into<String>,
        processed_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            format,
            raw_prefix: raw_prefix.into(),
            processed_prefix: processed_prefix.into(),
        }
    }

    pub fn from_config(
        store: Arc<dyn ObjectStore>,
        config: &StorageConfig,
    ) -> Result<Self, ConfigError> {
        let format = PartitionFormat::parse(&config.partition_format)
            .map_err(|problem| ConfigError::Invalid {
                problems: vec![problem],
            })?;
        Ok(Self::new(
            store,
            format,
            config.raw_prefix.trim_matches('/'),
            config.processed_prefix.trim_matches('/'),
        ))
    }

    pub fn partition_key(&self, date: TargetDate) -> PartitionKey {
        self.format.render(date)
    }

    fn prefix(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Raw => &self.raw_prefix,
            ArtifactKind::Processed => &self.processed_prefix,
        }
    }

    /// `{prefix}/{partition}/` for one kind and date.
    pub fn partition_prefix(&self, kind: ArtifactKind, date: TargetDate) -> String {
        format!("{}/{}/", self.prefix(kind), self.partition_key(date))
    }

    pub fn address(&self, kind: ArtifactKind, entity: &str, date: TargetDate) -> String {
        format!(
            "{}{}.{}",
            self.partition_prefix(kind, date),
            entity,
            kind.extension()
        )
    }

    /// Store the payload verbatim. Returns the key written.
    pub async fn write_raw(
        &self,
        entity: &str,
        date: TargetDate,
        payload: &RawPayload,
    ) -> Result<String, StorageError> {
        let key = self.address(ArtifactKind::Raw, entity, date);
        self.store
            .put(
                &key,
                Bytes::copy_from_slice(payload.as_bytes()),
                ArtifactKind::Raw.content_type(),
            )
            .await?;
        info!(
            entity,
            key = %key,
            bytes = payload.len(),
            "Raw artifact written -> {}/{}",
            self.store.location(),
            key
        );
        Ok(key)
    }

    pub async fn read_raw(&self, entity: &str, date: TargetDate) -> Result<RawPayload, StorageError> {
        let key = self.address(ArtifactKind::Raw, entity, date);
        match self.store.get(&key).await? {
            Some(body) => Ok(RawPayload::new(body)),
            None => Err(StorageError::NotFound { key }),
        }
    }

    /// Encode the table as CSV and store it. Returns the key written.
    pub async fn write_processed(
        &self,
        entity: &str,
        date: TargetDate,
        table: &NormalizedTable,
    ) -> Result<String, StorageError> {
        let key = self.address(ArtifactKind::Processed, entity, date);
        let body = csv::encode_table(table);
        let bytes = body.len();
        self.store
            .put(&key, Bytes::from(body), ArtifactKind::Processed.content_type())
            .await?;
        info!(
            entity,
            key = %key,
            rows = table.len(),
            bytes,
            "Processed artifact written -> {}/{}",
            self.store.location(),
            key
        );
        Ok(key)
    }

    pub async fn read_processed(&self, entity: &str, date: TargetDate) -> Result<Bytes, StorageError> {
        let key = self.address(ArtifactKind::Processed, entity, date);
        self.store
            .get(&key)
            .await?
            .ok_or(StorageError::NotFound { key })
    }

    /// Keys stored under one partition of one layer.
    pub async fn list_partition(
        &self,
        kind: ArtifactKind,
        date: TargetDate,
    ) -> Result<Vec<String>, StorageError> {
        self.store.list(&self.partition_prefix(kind, date)).await
    }

    pub fn location(&self) -> String {
        self.store.location()
    }
}
