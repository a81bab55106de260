use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionKind {
    Event,
    Meter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterKind {
    Snapshot,
    Delta,
}

/// A single event or meter reading submitted by a boundary (§3 `IngestionRecord`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub kind: IngestionKind,
    pub source_record_id: String,
    pub equipment_id: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    /// Meter-only fields.
    pub meter_kind: Option<MeterKind>,
    pub value_minor: Option<i64>,
    pub delta_minor: Option<i64>,
    pub meter_label: Option<String>,
    pub monetary_unit: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferEntryStatus {
    Queued,
    Processing,
    Acknowledged,
    DeadLetter,
}

/// An entry in a boundary's bounded ingestion buffer (§3, §4.G).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferEntry {
    pub entry_id: String,
    pub boundary_id: String,
    pub record: IngestionRecord,
    pub status: BufferEntryStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Sticky saturation state for one boundary (§4.G, §5 shared-resource policy).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BoundaryState {
    pub disabled: bool,
    pub queued_count: u64,
}
