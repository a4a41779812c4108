//! Ephemeral per-session room state.
//!
//! Mutated only by signal ingestion; never persisted beyond the session.
//! Monitors rehydrate on reconnect from an explicit snapshot of this
//! struct, not from the append-only log.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenSurface {
    Monitor,
    Window,
    Tab,
    #[default]
    Unknown,
}

impl ScreenSurface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Window => "window",
            Self::Tab => "tab",
            Self::Unknown => "unknown",
        }
    }

    /// Only a full-monitor share satisfies entire-screen enforcement.
    pub fn is_entire_screen(&self) -> bool {
        matches!(self, Self::Monitor)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomState {
    pub candidate_online: bool,
    pub screen_share_active: bool,
    pub screen_surface: ScreenSurface,
    pub monitor_count: u32,
    /// Unix millis of the last screen-share heartbeat
    pub last_screen_share_at: Option<i64>,
}

impl RoomState {
    /// Heartbeat age relative to `now_ms`, or None if no heartbeat yet.
    pub fn heartbeat_age_ms(&self, now_ms: i64) -> Option<i64> {
        self.last_screen_share_at.map(|t| now_ms - t)
    }
}

/// Inbound `screen_share_status` realtime message from the candidate client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenShareSignal {
    pub active: bool,
    #[serde(default)]
    pub surface: ScreenSurface,
    #[serde(default)]
    pub muted: bool,
    /// Client timestamp, unix millis
    pub timestamp: i64,
    #[serde(default = "default_online")]
    pub candidate_online: bool,
    #[serde(default)]
    pub monitor_count: Option<u32>,
}

fn default_online() -> bool {
    true
}
