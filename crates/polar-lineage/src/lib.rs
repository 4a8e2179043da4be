//! Append-only lineage storage and audit sinks for governed actions.

use async_trait::async_trait;
use polar_core::current_rfc3339_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

mod audit;

pub use audit::*;

pub const LINEAGE_QUERY_DEFAULT_LIMIT: usize = 100;
pub const LINEAGE_QUERY_MAX_LIMIT: usize = 1_000;

pub type LineageResult<T> = Result<T, LineageStoreError>;

#[derive(Debug, Error)]
pub enum LineageStoreError {
    #[error("invalid lineage query: {0}")]
    InvalidQuery(String),
    #[error("lineage store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Record submitted for appending; the store assigns sequence and timestamp.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageEntry {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl LineageEntry {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            ..Self::default()
        }
    }
}

/// Immutable appended record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageRecord {
    pub sequence: u64,
    pub recorded_at: String,
    #[serde(flatten)]
    pub entry: LineageEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageQuery {
    #[serde(default)]
    pub from_sequence: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub action_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

impl LineageQuery {
    pub fn from_sequence(sequence: u64) -> Self {
        Self {
            from_sequence: Some(sequence),
            ..Self::default()
        }
    }

    fn matches(&self, record: &LineageRecord) -> bool {
        fn field_matches(filter: &Option<String>, value: &Option<String>) -> bool {
            match filter {
                Some(expected) => value.as_deref() == Some(expected.as_str()),
                None => true,
            }
        }

        let event_type_matches = match self.event_type.as_deref() {
            Some(expected) => record.entry.event_type == expected,
            None => true,
        };
        event_type_matches
            && field_matches(&self.trace_id, &record.entry.trace_id)
            && field_matches(&self.action_id, &record.entry.action_id)
            && field_matches(&self.workflow_id, &record.entry.workflow_id)
            && field_matches(&self.run_id, &record.entry.run_id)
    }
}

/// One page of lineage query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineagePage {
    pub status: String,
    pub from_sequence: u64,
    pub returned_count: usize,
    pub total_count: usize,
    pub items: Vec<LineageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_from_sequence: Option<u64>,
}

/// Append-only lineage store. Sequence numbers are 1-based, strictly increasing, gap-free.
#[async_trait]
pub trait LineageStore: Send + Sync {
    async fn append(&self, entry: LineageEntry) -> LineageResult<LineageRecord>;
    async fn query(&self, query: LineageQuery) -> LineageResult<LineagePage>;
}

/// In-memory store; every append holds one mutex so sequences are issued in FIFO order.
#[derive(Debug, Default)]
pub struct InMemoryLineageStore {
    records: Mutex<Vec<LineageRecord>>,
}

impl InMemoryLineageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl LineageStore for InMemoryLineageStore {
    async fn append(&self, entry: LineageEntry) -> LineageResult<LineageRecord> {
        if entry.event_type.trim().is_empty() {
            return Err(LineageStoreError::InvalidQuery(
                "event_type cannot be empty".to_string(),
            ));
        }
        let mut records = self.records.lock().await;
        let sequence = u64::try_from(records.len())
            .map_err(|_| LineageStoreError::Unavailable("sequence overflow".to_string()))?
            + 1;
        let record = LineageRecord {
            sequence,
            recorded_at: current_rfc3339_timestamp(),
            entry,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn query(&self, query: LineageQuery) -> LineageResult<LineagePage> {
        let from_sequence = query.from_sequence.unwrap_or(1);
        if from_sequence == 0 {
            return Err(LineageStoreError::InvalidQuery(
                "from_sequence is 1-based".to_string(),
            ));
        }
        let limit = query.limit.unwrap_or(LINEAGE_QUERY_DEFAULT_LIMIT);
        if limit == 0 {
            return Err(LineageStoreError::InvalidQuery(
                "limit must be greater than zero".to_string(),
            ));
        }
        let limit = limit.min(LINEAGE_QUERY_MAX_LIMIT);

        let records = self.records.lock().await;
        let start = usize::try_from(from_sequence - 1).unwrap_or(usize::MAX);
        let matching = records
            .iter()
            .skip(start)
            .filter(|record| query.matches(record))
            .collect::<Vec<_>>();
        let total_count = matching.len();
        let items = matching
            .into_iter()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>();
        let next_from_sequence = if total_count > items.len() {
            items.last().map(|record| record.sequence + 1)
        } else {
            None
        };

        Ok(LineagePage {
            status: "ok".to_string(),
            from_sequence,
            returned_count: items.len(),
            total_count,
            items,
            next_from_sequence,
        })
    }
}
