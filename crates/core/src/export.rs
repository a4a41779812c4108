//! Evidence export records.
//!
//! One record per export action, immutable, and itself appended to the
//! ledger it summarizes. The summary never reflects the export's own
//! ledger entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::{ChainStatus, HASH_ALGORITHM};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    Json,
    Csv,
    Bundle,
    All,
}

impl ExportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Bundle => "bundle",
            Self::All => "all",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "bundle" => Some(Self::Bundle),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// A policy-triggered reason and how often it fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCount {
    pub reason: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSummary {
    pub integrity_event_count: u64,
    pub monitor_alert_count: u64,
    pub timeline_event_count: u64,
    pub policy_reason_events: u64,
    pub policy_reason_unique: u64,
    pub policy_top_reasons: Vec<ReasonCount>,
    pub chain_status: ChainStatus,
    pub chain_linked_events: u64,
    pub chain_checked_events: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_latest_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceExportRecord {
    pub id: String,
    pub mode: ExportMode,
    pub files: Vec<String>,
    /// Chain hash algorithm in force when the export was taken.
    pub hash_algorithm: String,
    pub exported_at: DateTime<Utc>,
    pub summary: ExportSummary,
}

impl EvidenceExportRecord {
    pub fn new(mode: ExportMode, files: Vec<String>, summary: ExportSummary) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mode,
            files,
            hash_algorithm: HASH_ALGORITHM.to_string(),
            exported_at: Utc::now(),
            summary,
        }
    }
}
