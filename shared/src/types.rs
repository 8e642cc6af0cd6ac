use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored endpoint. Name is unique across all destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub id: i64,

    pub name: String,

    /// Hostname or IP handed to the prober
    pub address: String,

    /// Optional organizational group; cleared when the group is deleted
    pub group_id: Option<i64>,

    pub created_at: DateTime<Utc>,
}

/// A named collection of destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One hop of an accepted capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    /// 1-based, matches probe order
    pub index: u32,

    /// Canonical address, `None` when the hop timed out
    pub address: Option<String>,

    /// First latency sample seen for this hop. Not part of the fingerprint.
    pub latency_ms: Option<f64>,
}

/// A distinct path state persisted for a destination.
/// Entries are write-once and ordered by `captured_at`, then `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub destination_id: i64,
    pub captured_at: DateTime<Utc>,
    pub hops: Vec<Hop>,

    /// Hex SHA-256 of the canonical hop sequence
    pub fingerprint: String,

    /// Probe output as received, kept for display and audit
    pub raw: String,
}

/// One hop line as printed by the probe, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHop {
    pub index: u32,

    /// Everything after the hop number: names, addresses, timings, `*` markers
    pub observation: String,
}

/// A single traceroute execution result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCapture {
    pub hops: Vec<RawHop>,

    /// Verbatim probe output, if the caller has it
    #[serde(default)]
    pub raw: Option<String>,

    /// When the probe ran; the ingestion time is used when absent
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

impl RawCapture {
    /// Payload retained alongside an accepted entry
    pub fn payload(&self) -> String {
        match &self.raw {
            Some(raw) => raw.clone(),
            None => self
                .hops
                .iter()
                .map(|hop| format!("{} {}", hop.index, hop.observation))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Outcome of an ingestion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// The path differed from the latest entry and was appended
    Stored,
    /// The path matched the latest entry; nothing was written
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingestion {
    pub entry: HistoryEntry,
    pub decision: Decision,
}
