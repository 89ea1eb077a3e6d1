//! Normalization of raw hourly payloads into one row per time slice.
//!
//! The upstream returns parallel arrays under `hourly` (one of them `time`) and the
//! unit of each array under `hourly_units`. Arrays are aligned by position; each
//! measurement column is renamed to carry an ASCII-safe unit suffix, and columns are
//! ordered by source variable name.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::error::TransformError;
use crate::types::{FieldValue, NormalizedRow, NormalizedTable, RawPayload, TargetDate};

/// Source of the transformation timestamp stamped on every row.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant. Makes reruns byte-identical.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Column-name suffix for a unit label.
pub fn unit_suffix(unit: &str) -> String {
    let known = match unit {
        "°C" => Some("_c"),
        "°F" => Some("_f"),
        "%" => Some("_pct"),
        "km/h" => Some("_kmh"),
        "m/s" => Some("_ms"),
        "m" => Some("_m"),
        "mm" => Some("_mm"),
        "°" => Some("_deg"),
        "hPa" => Some("_hpa"),
        "iso8601" | "unixtime" | "" => Some(""),
        _ => None,
    };
    if let Some(suffix) = known {
        return suffix.to_string();
    }

    let slug = slug_unit(unit);
    if slug.is_empty() {
        String::new()
    } else {
        format!("_{}", slug)
    }
}

// Fixed ASCII encoding for unit labels outside the known table.
fn slug_unit(unit: &str) -> String {
    let mut out = String::new();
    for c in unit.chars() {
        let mapped = match c {
            '°' => "deg".to_string(),
            '%' => "pct".to_string(),
            '²' => "2".to_string(),
            '³' => "3".to_string(),
            'µ' | 'μ' => "u".to_string(),
            '/' => String::new(),
            c if c.is_ascii_alphanumeric() => c.to_ascii_lowercase().to_string(),
            _ => "_".to_string(),
        };
        out.push_str(&mapped);
    }
    let mut collapsed = String::with_capacity(out.len());
    for c in out.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }
    collapsed.trim_matches('_').to_string()
}

fn parse_timestamp(label: &Value) -> Option<NaiveDateTime> {
    let s = label.as_str()?;
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

fn field_value(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Number(n) => n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Null),
        Value::String(s) => FieldValue::Text(s.clone()),
        Value::Bool(b) => FieldValue::Text(b.to_string()),
        other => FieldValue::Text(other.to_string()),
    }
}

// Two sources can render to the same header, e.g. `a` in metres next to a unitless `a_m`.
fn check_unique_columns(columns: &[String]) -> Result<(), TransformError> {
    let mut seen: HashSet<&str> = NormalizedTable::LEADING_COLUMNS.into_iter().collect();
    for column in columns {
        if !seen.insert(column.as_str()) {
            return Err(TransformError::UnexpectedShape {
                field: format!("hourly.{}", column),
                message: format!("column name '{}' is produced more than once", column),
            });
        }
    }
    Ok(())
}

/// Converts raw payloads into normalized tables.
#[derive(Clone)]
pub struct Transformer {
    clock: Arc<dyn Clock>,
}

impl Transformer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Normalize one entity's payload. Rows are emitted for exactly the slices received.
    pub fn normalize(
        &self,
        entity: &str,
        date: TargetDate,
        payload: &RawPayload,
    ) -> Result<NormalizedTable, TransformError> {
        let json: Value =
            serde_json::from_slice(payload.as_bytes()).map_err(|e| TransformError::InvalidJson {
                message: e.to_string(),
            })?;

        let hourly = json
            .get("hourly")
            .ok_or_else(|| TransformError::MissingField {
                field: "hourly".to_string(),
            })?
            .as_object()
            .ok_or_else(|| TransformError::UnexpectedShape {
                field: "hourly".to_string(),
                message: "expected an object of parallel arrays".to_string(),
            })?;
        let units = json.get("hourly_units").and_then(Value::as_object);

        let times = hourly
            .get("time")
            .ok_or_else(|| TransformError::MissingField {
                field: "hourly.time".to_string(),
            })?
            .as_array()
            .ok_or_else(|| TransformError::UnexpectedShape {
                field: "hourly.time".to_string(),
                message: "expected an array".to_string(),
            })?;

        // Sorted by source name so column order never depends on the JSON map implementation.
        let mut measurements: Vec<(&String, &Value)> =
            hourly.iter().filter(|(name, _)| *name != "time").collect();
        measurements.sort_by(|a, b| a.0.cmp(b.0));

        let mut columns = Vec::new();
        let mut arrays = Vec::new();
        for (name, values) in measurements {
            let values = values
                .as_array()
                .ok_or_else(|| TransformError::UnexpectedShape {
                    field: format!("hourly.{}", name),
                    message: "expected an array".to_string(),
                })?;
            if values.len() != times.len() {
                return Err(TransformError::LengthMismatch {
                    column: name.clone(),
                    expected: times.len(),
                    actual: values.len(),
                });
            }
            let unit = units
                .and_then(|u| u.get(name))
                .and_then(Value::as_str)
                .unwrap_or("");
            columns.push(format!("{}{}", name, unit_suffix(unit)));
            arrays.push(values);
        }
        check_unique_columns(&columns)?;

        let ingested_at = self.clock.now();
        let rows = times
            .iter()
            .enumerate()
            .map(|(i, time)| NormalizedRow {
                entity: entity.to_string(),
                date,
                timestamp: parse_timestamp(time),
                ingested_at,
                values: arrays.iter().map(|a| field_value(&a[i])).collect(),
            })
            .collect::<Vec<_>>();

        info!(
            entity,
            rows = rows.len(),
            columns = ?columns,
            "Transform complete"
        );

        Ok(NormalizedTable { columns, rows })
    }
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}
