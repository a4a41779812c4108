//! Monitor alerts raised by the decision engine or an operator.
//!
//! Alerts are immutable once created. Deduplication is a per-(type,severity)
//! cooldown window owned by the engine; the per-type window lengths live
//! here next to the type definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    CandidateOffline,
    ScreenShareMissing,
    ScreenSurfaceInvalid,
    HeartbeatDelayed,
    ManualIntervention,
    AutoTerminate,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CandidateOffline => "candidate_offline",
            Self::ScreenShareMissing => "screen_share_missing",
            Self::ScreenSurfaceInvalid => "screen_surface_invalid",
            Self::HeartbeatDelayed => "heartbeat_delayed",
            Self::ManualIntervention => "manual_intervention",
            Self::AutoTerminate => "auto_terminate",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "candidate_offline" => Some(Self::CandidateOffline),
            "screen_share_missing" => Some(Self::ScreenShareMissing),
            "screen_surface_invalid" => Some(Self::ScreenSurfaceInvalid),
            "heartbeat_delayed" => Some(Self::HeartbeatDelayed),
            "manual_intervention" => Some(Self::ManualIntervention),
            "auto_terminate" => Some(Self::AutoTerminate),
            _ => None,
        }
    }

    /// Dedup cooldown for identical (type, severity) pairs, in millis.
    /// Connectivity alerts repeat faster than surface nags; terminal and
    /// operator alerts are never suppressed.
    pub fn cooldown_ms(&self) -> i64 {
        match self {
            Self::CandidateOffline => 10_000,
            Self::ScreenShareMissing => 8_000,
            Self::ScreenSurfaceInvalid => 12_000,
            Self::HeartbeatDelayed => 15_000,
            Self::ManualIntervention => 0,
            Self::AutoTerminate => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorAlert {
    pub id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl MonitorAlert {
    pub fn new(alert_type: AlertType, severity: Severity, message: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_type,
            severity,
            message: message.to_string(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
