//! Guardrail Decision Engine.
//!
//! Recomputes "what alert applies now" from the latest signal snapshot on
//! every inbound message, rather than walking a strict state ladder.
//! Priority order: terminated > candidate offline > share missing >
//! invalid surface > heartbeat delayed > healthy. Only the
//! highest-priority condition surfaces as the active alert; lower
//! conditions stay counted internally (the invalid-surface counter keeps
//! incrementing under an offline overlay and resets the moment the
//! surface is valid again).
//!
//! All windows (20s re-share cooldown, 8-15s alert dedup) are recomputed
//! from wall-clock timestamps on each signal, never scheduled callbacks.
//! Ledger appends are fire-and-forget on the signal path: durability
//! failures are logged and never delay alert emission to monitors.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use proctor_core::{
    AlertType, GuardrailError, MonitorAlert, MonitorPolicy, PolicyScope, RoomState,
    ScreenShareSignal, Severity,
};

use crate::clock::Clock;
use crate::event_log::actions;
use crate::ledger::Ledger;
use crate::policy_store::PolicyStore;
use crate::registry::{MonitorRegistry, RealtimeEvent};

/// Heartbeat is healthy strictly under this age.
pub const HEARTBEAT_HEALTHY_MS: i64 = 10_000;
/// Heartbeat age that triggers an auto re-share request.
pub const RESHARE_HEARTBEAT_MS: i64 = 15_000;
/// Minimum spacing between re-share requests.
pub const RESHARE_COOLDOWN_MS: i64 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedKind {
    CandidateOffline,
    ShareMissing,
    SurfaceInvalid,
    HeartbeatDelayed,
}

/// Overlay state recomputed per signal; `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionGuardState {
    Healthy,
    Degraded(DegradedKind),
    AutoReshareRequested,
    Terminating,
    Terminated,
}

/// What one signal evaluation produced.
#[derive(Debug, Clone)]
pub struct SignalOutcome {
    pub alerts: Vec<MonitorAlert>,
    pub state: SessionGuardState,
    pub reshare_requested: bool,
}

pub struct GuardrailEngine {
    session_id: String,
    room: RoomState,
    state: SessionGuardState,
    auto_reshare_count: u32,
    invalid_surface_count: u32,
    last_reshare_at_ms: Option<i64>,
    /// Last emission time per (type, severity) for cooldown dedup
    last_alert_at: HashMap<(AlertType, Severity), i64>,
    /// Sticky once a termination starts; makes concurrent triggers no-ops
    terminate_lock: bool,
    terminated: bool,
    policies: Arc<PolicyStore<MonitorPolicy>>,
    ledger: Arc<Ledger>,
    registry: Arc<dyn MonitorRegistry>,
    clock: Arc<dyn Clock>,
}

impl GuardrailEngine {
    pub fn new(
        session_id: &str,
        policies: Arc<PolicyStore<MonitorPolicy>>,
        ledger: Arc<Ledger>,
        registry: Arc<dyn MonitorRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            room: RoomState::default(),
            state: SessionGuardState::Healthy,
            auto_reshare_count: 0,
            invalid_surface_count: 0,
            last_reshare_at_ms: None,
            last_alert_at: HashMap::new(),
            terminate_lock: false,
            terminated: false,
            policies,
            ledger,
            registry,
            clock,
        }
    }

    pub fn room_state(&self) -> &RoomState {
        &self.room
    }

    pub fn state(&self) -> SessionGuardState {
        self.state
    }

    pub fn auto_reshare_count(&self) -> u32 {
        self.auto_reshare_count
    }

    pub fn invalid_surface_count(&self) -> u32 {
        self.invalid_surface_count
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Ingest one `screen_share_status` signal and recompute the overlay.
    pub fn handle_signal(
        &mut self,
        signal: &ScreenShareSignal,
    ) -> Result<SignalOutcome, GuardrailError> {
        if self.terminated {
            return Ok(SignalOutcome {
                alerts: Vec::new(),
                state: SessionGuardState::Terminated,
                reshare_requested: false,
            });
        }

        let policy = self
            .policies
            .current(&PolicyScope::Session(self.session_id.clone()))?
            .policy;
        let now = self.clock.now_ms();

        // Snapshot update; only an active share advances the heartbeat.
        self.room.candidate_online = signal.candidate_online;
        self.room.screen_share_active = signal.active;
        self.room.screen_surface = signal.surface;
        if let Some(count) = signal.monitor_count {
            self.room.monitor_count = count;
        }
        if signal.active {
            self.room.last_screen_share_at = Some(signal.timestamp);
        }

        let surface_invalid = policy.enforce_entire_screen_share
            && self.room.screen_share_active
            && !self.room.screen_surface.is_entire_screen();
        if surface_invalid {
            self.invalid_surface_count += 1;
        } else if self.room.screen_share_active {
            self.invalid_surface_count = 0;
        }

        let offline = !self.room.candidate_online;
        let share_missing = !offline && !self.room.screen_share_active;
        let heartbeat_age = self.room.heartbeat_age_ms(now);
        let heartbeat_delayed = !offline
            && !share_missing
            && !surface_invalid
            && heartbeat_age.is_some_and(|age| age >= HEARTBEAT_HEALTHY_MS);

        let mut alerts = Vec::new();
        let mut reshare_requested = false;

        // Auto re-share: share gone, enforced-surface mismatch, or stale
        // heartbeat, while the candidate is still reachable.
        let reshare_trigger = if share_missing {
            Some((AlertType::ScreenShareMissing, "screen share lost"))
        } else if surface_invalid {
            Some((AlertType::ScreenSurfaceInvalid, "shared surface is not the entire screen"))
        } else if heartbeat_age.is_some_and(|age| age >= RESHARE_HEARTBEAT_MS) {
            Some((AlertType::HeartbeatDelayed, "screen share heartbeat stalled"))
        } else {
            None
        };

        if let Some((alert_type, detail)) = reshare_trigger {
            if !offline && !self.terminate_lock && self.reshare_window_open(now) {
                self.auto_reshare_count += 1;
                self.last_reshare_at_ms = Some(now);
                reshare_requested = true;
                self.registry.broadcast(
                    &self.session_id,
                    &RealtimeEvent::ReshareRequested {
                        session_id: self.session_id.clone(),
                        attempt: self.auto_reshare_count,
                    },
                );
                if let Some(alert) = self.emit_alert(
                    alert_type,
                    Severity::High,
                    &format!("auto re-share requested: {}", detail),
                    serde_json::json!({
                        "reason": alert_type.as_str(),
                        "auto_reshare_count": self.auto_reshare_count,
                    }),
                ) {
                    alerts.push(alert);
                }

                // Threshold crossing only counts while the trigger holds.
                if policy.auto_terminate_enabled
                    && self.auto_reshare_count >= policy.max_auto_reshare_attempts
                {
                    if let Some(alert) = self.terminate(
                        &format!("re-share attempts exhausted ({})", detail),
                        "auto",
                    )? {
                        alerts.push(alert);
                    }
                    return Ok(self.outcome(alerts, reshare_requested));
                }
            }
        }

        // Independent surface trigger, regardless of re-share count.
        if policy.auto_terminate_enabled
            && policy.enforce_entire_screen_share
            && self.invalid_surface_count >= policy.invalid_surface_terminate_threshold
        {
            if let Some(alert) =
                self.terminate("invalid surface threshold reached", "auto")?
            {
                alerts.push(alert);
            }
            return Ok(self.outcome(alerts, reshare_requested));
        }

        // Display alert for the highest-priority live condition, unless
        // the re-share path already alerted this round.
        if !reshare_requested {
            let display = if offline {
                Some((AlertType::CandidateOffline, Severity::High, "candidate disconnected".to_string()))
            } else if share_missing {
                Some((AlertType::ScreenShareMissing, Severity::High, "screen share inactive".to_string()))
            } else if surface_invalid {
                Some((
                    AlertType::ScreenSurfaceInvalid,
                    Severity::Medium,
                    format!("shared surface is '{}'", self.room.screen_surface.as_str()),
                ))
            } else if heartbeat_delayed {
                let age = heartbeat_age.unwrap_or(0);
                let severity =
                    if age >= i64::from(policy.heartbeat_terminate_threshold_sec) * 1000 {
                        Severity::High
                    } else {
                        Severity::Medium
                    };
                Some((
                    AlertType::HeartbeatDelayed,
                    severity,
                    format!("screen share heartbeat {}ms old", age),
                ))
            } else {
                None
            };

            if let Some((alert_type, severity, message)) = display {
                if let Some(alert) = self.emit_alert(
                    alert_type,
                    severity,
                    &message,
                    serde_json::json!({ "reason": alert_type.as_str() }),
                ) {
                    alerts.push(alert);
                }
            }
        }

        // Fully healthy snapshot closes the re-share episode.
        if !offline && !share_missing && !surface_invalid && !heartbeat_delayed {
            self.auto_reshare_count = 0;
        }

        self.state = self.recompute_state(offline, share_missing, surface_invalid, heartbeat_delayed, reshare_requested);
        Ok(self.outcome(alerts, reshare_requested))
    }

    /// Operator-created alert through the same ledger-then-broadcast sink.
    pub fn operator_alert(
        &mut self,
        alert_type: AlertType,
        severity: Severity,
        message: &str,
        metadata: serde_json::Value,
    ) -> Option<MonitorAlert> {
        self.emit_alert(alert_type, severity, message, metadata)
    }

    /// Manual termination: always reports an alert before terminating.
    pub fn manual_terminate(
        &mut self,
        reason: &str,
        actor: &str,
    ) -> Result<Option<MonitorAlert>, GuardrailError> {
        if self.terminate_lock {
            return Ok(None);
        }
        self.emit_alert(
            AlertType::ManualIntervention,
            Severity::High,
            &format!("manual termination requested: {}", reason),
            serde_json::json!({ "actor": actor, "reason": reason }),
        );
        self.terminate(reason, "manual")
    }

    /// Broadcast the current room snapshot (monitor rehydration).
    pub fn broadcast_room_state(&self) {
        self.registry.broadcast(
            &self.session_id,
            &RealtimeEvent::RoomState {
                session_id: self.session_id.clone(),
                state: self.room.clone(),
            },
        );
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn reshare_window_open(&self, now: i64) -> bool {
        match self.last_reshare_at_ms {
            Some(last) => now - last >= RESHARE_COOLDOWN_MS,
            None => true,
        }
    }

    /// Idempotent termination sink. Returns the terminate alert on the
    /// first call, None when the lock is already held.
    fn terminate(
        &mut self,
        reason: &str,
        mode: &str,
    ) -> Result<Option<MonitorAlert>, GuardrailError> {
        if self.terminate_lock {
            return Ok(None);
        }
        self.terminate_lock = true;
        self.state = SessionGuardState::Terminating;

        let alert = self.emit_alert(
            AlertType::AutoTerminate,
            Severity::High,
            &format!("session terminated: {}", reason),
            serde_json::json!({ "reason": reason, "mode": mode }),
        );

        if let Err(e) = self.ledger.record(
            &self.session_id,
            actions::SESSION_TERMINATED,
            serde_json::json!({
                "kind": "session_terminated",
                "reason": reason,
                "mode": mode,
            }),
        ) {
            tracing::error!(session_id = %self.session_id, error = %e, "termination ledger append failed");
        }

        self.registry.broadcast(
            &self.session_id,
            &RealtimeEvent::SessionTerminated {
                session_id: self.session_id.clone(),
                reason: reason.to_string(),
            },
        );

        // Drop the live share and any cached chain/timeline answers.
        self.room.screen_share_active = false;
        self.ledger.invalidate(&self.session_id);
        self.terminated = true;
        self.state = SessionGuardState::Terminated;
        tracing::info!(session_id = %self.session_id, mode, reason, "session terminated");
        Ok(alert)
    }

    /// Ledger-first alert emission with per-(type, severity) cooldown.
    /// A suppressed pair never blocks a different pair in the window.
    fn emit_alert(
        &mut self,
        alert_type: AlertType,
        severity: Severity,
        message: &str,
        metadata: serde_json::Value,
    ) -> Option<MonitorAlert> {
        let now = self.clock.now_ms();
        let cooldown = alert_type.cooldown_ms();
        if cooldown > 0 {
            if let Some(last) = self.last_alert_at.get(&(alert_type, severity)) {
                if now - last < cooldown {
                    tracing::debug!(
                        session_id = %self.session_id,
                        alert_type = alert_type.as_str(),
                        "alert suppressed by cooldown"
                    );
                    return None;
                }
            }
        }

        let mut alert = MonitorAlert::new(alert_type, severity, message).with_metadata(metadata);
        alert.created_at = self.clock.now();
        self.last_alert_at.insert((alert_type, severity), now);

        // Chain link before broadcast; emission is not gated on durability.
        if let Err(e) = self.ledger.record(
            &self.session_id,
            actions::MONITOR_ALERT,
            serde_json::json!({
                "kind": "monitor_alert",
                "alert": alert,
            }),
        ) {
            tracing::error!(session_id = %self.session_id, error = %e, "alert ledger append failed");
        }

        self.registry.broadcast(
            &self.session_id,
            &RealtimeEvent::MonitorAlert {
                session_id: self.session_id.clone(),
                alert: alert.clone(),
            },
        );
        Some(alert)
    }

    fn recompute_state(
        &self,
        offline: bool,
        share_missing: bool,
        surface_invalid: bool,
        heartbeat_delayed: bool,
        reshare_requested: bool,
    ) -> SessionGuardState {
        if self.terminated {
            return SessionGuardState::Terminated;
        }
        if self.terminate_lock {
            return SessionGuardState::Terminating;
        }
        if reshare_requested || (self.auto_reshare_count > 0 && (share_missing || surface_invalid)) {
            return SessionGuardState::AutoReshareRequested;
        }
        if offline {
            return SessionGuardState::Degraded(DegradedKind::CandidateOffline);
        }
        if share_missing {
            return SessionGuardState::Degraded(DegradedKind::ShareMissing);
        }
        if surface_invalid {
            return SessionGuardState::Degraded(DegradedKind::SurfaceInvalid);
        }
        if heartbeat_delayed {
            return SessionGuardState::Degraded(DegradedKind::HeartbeatDelayed);
        }
        SessionGuardState::Healthy
    }

    fn outcome(&self, alerts: Vec<MonitorAlert>, reshare_requested: bool) -> SignalOutcome {
        SignalOutcome {
            alerts,
            state: self.state,
            reshare_requested,
        }
    }
}
