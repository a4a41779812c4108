//! Realtime fan-out registry.
//!
//! The transport itself is an external collaborator; the core only needs
//! a process-scoped registry with explicit lifecycle, injected by
//! reference so the engine is testable without a live connection.
//! Delivery is best-effort, at-most-once: a failed send prunes the dead
//! monitor and never rolls back the state mutation that preceded it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use proctor_core::{
    EvidenceChainPolicy, EvidenceExportRecord, MonitorAlert, MonitorPolicy, RoomState,
};

/// Server → monitor realtime messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    RoomState {
        session_id: String,
        state: RoomState,
    },
    MonitorAlert {
        session_id: String,
        alert: MonitorAlert,
    },
    /// Re-share request pushed toward the candidate and mirrored to monitors
    ReshareRequested {
        session_id: String,
        attempt: u32,
    },
    MonitorPolicyUpdated {
        session_id: String,
        policy: MonitorPolicy,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        updated_by: String,
    },
    CompanyMonitorPolicyTemplateUpdated {
        policy: MonitorPolicy,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        updated_by: String,
    },
    CompanyEvidenceChainPolicyUpdated {
        policy: EvidenceChainPolicy,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        updated_by: String,
    },
    SessionTerminated {
        session_id: String,
        reason: String,
    },
    EvidenceExportLogged {
        session_id: String,
        record: EvidenceExportRecord,
    },
}

/// Fan-out interface the engine and stores depend on.
pub trait MonitorRegistry: Send + Sync {
    fn register(&self, session_id: &str, monitor_id: &str, sender: UnboundedSender<RealtimeEvent>);

    fn unregister(&self, session_id: &str, monitor_id: &str);

    /// Deliver to every monitor of one session; returns delivery count.
    fn broadcast(&self, session_id: &str, event: &RealtimeEvent) -> usize;

    /// Deliver to every connected monitor across sessions (company-scope
    /// policy template changes).
    fn broadcast_company(&self, event: &RealtimeEvent) -> usize;
}

/// In-process registry over unbounded channels.
#[derive(Default)]
pub struct InProcessRegistry {
    rooms: RwLock<HashMap<String, HashMap<String, UnboundedSender<RealtimeEvent>>>>,
}

impl InProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn monitor_count(&self, session_id: &str) -> usize {
        self.rooms
            .read()
            .expect("registry lock poisoned")
            .get(session_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn send_to_room(
        room: &mut HashMap<String, UnboundedSender<RealtimeEvent>>,
        event: &RealtimeEvent,
    ) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (monitor_id, sender) in room.iter() {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(monitor_id.clone());
            }
        }
        for monitor_id in dead {
            tracing::debug!(monitor_id = %monitor_id, "pruning disconnected monitor");
            room.remove(&monitor_id);
        }
        delivered
    }
}

impl MonitorRegistry for InProcessRegistry {
    fn register(&self, session_id: &str, monitor_id: &str, sender: UnboundedSender<RealtimeEvent>) {
        let mut rooms = self.rooms.write().expect("registry lock poisoned");
        rooms
            .entry(session_id.to_string())
            .or_default()
            .insert(monitor_id.to_string(), sender);
    }

    fn unregister(&self, session_id: &str, monitor_id: &str) {
        let mut rooms = self.rooms.write().expect("registry lock poisoned");
        if let Some(room) = rooms.get_mut(session_id) {
            room.remove(monitor_id);
            if room.is_empty() {
                rooms.remove(session_id);
            }
        }
    }

    fn broadcast(&self, session_id: &str, event: &RealtimeEvent) -> usize {
        let mut rooms = self.rooms.write().expect("registry lock poisoned");
        match rooms.get_mut(session_id) {
            Some(room) => Self::send_to_room(room, event),
            None => 0,
        }
    }

    fn broadcast_company(&self, event: &RealtimeEvent) -> usize {
        let mut rooms = self.rooms.write().expect("registry lock poisoned");
        rooms
            .values_mut()
            .map(|room| Self::send_to_room(room, event))
            .sum()
    }
}
