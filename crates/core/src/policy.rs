//! Monitor and evidence-chain policy value objects.
//!
//! Policies are plain serde values; the versioning wrapper lives in
//! `version.rs`. Range validation happens here, before any append, so a
//! rejected policy never leaves partial state behind.

use serde::{Deserialize, Serialize};

// ============================================================================
// MonitorPolicy
// ============================================================================

/// Per-session (or company-default) anti-cheat enforcement policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorPolicy {
    /// Whether the engine may terminate a session on its own
    pub auto_terminate_enabled: bool,

    /// Re-share requests sent before auto-terminate is considered (1..=10)
    pub max_auto_reshare_attempts: u32,

    /// Heartbeat age that escalates a delayed heartbeat to High (10..=240)
    pub heartbeat_terminate_threshold_sec: u32,

    /// Invalid-surface occurrences before independent terminate (1..=10)
    pub invalid_surface_terminate_threshold: u32,

    pub enforce_fullscreen: bool,
    pub enforce_entire_screen_share: bool,
    pub strict_clipboard_protection: bool,

    /// Candidate editor sync interval (200..=4000)
    pub code_sync_interval_ms: u32,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            auto_terminate_enabled: false,
            max_auto_reshare_attempts: 3,
            heartbeat_terminate_threshold_sec: 60,
            invalid_surface_terminate_threshold: 3,
            enforce_fullscreen: false,
            enforce_entire_screen_share: true,
            strict_clipboard_protection: true,
            code_sync_interval_ms: 1000,
        }
    }
}

impl MonitorPolicy {
    /// Validate all field ranges. Returns every violation, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();

        check_range(
            &mut violations,
            "max_auto_reshare_attempts",
            self.max_auto_reshare_attempts,
            1,
            10,
        );
        check_range(
            &mut violations,
            "heartbeat_terminate_threshold_sec",
            self.heartbeat_terminate_threshold_sec,
            10,
            240,
        );
        check_range(
            &mut violations,
            "invalid_surface_terminate_threshold",
            self.invalid_surface_terminate_threshold,
            1,
            10,
        );
        check_range(
            &mut violations,
            "code_sync_interval_ms",
            self.code_sync_interval_ms,
            200,
            4000,
        );

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

fn check_range(violations: &mut Vec<String>, field: &str, value: u32, min: u32, max: u32) {
    if value < min || value > max {
        violations.push(format!(
            "{} must be between {} and {}, got {}",
            field, min, max, value
        ));
    }
}

// ============================================================================
// EvidenceChainPolicy
// ============================================================================

/// Export gate policy: which chain verification outcomes block an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceChainPolicy {
    pub block_on_broken_chain: bool,
    pub block_on_partial_chain: bool,
}

impl Default for EvidenceChainPolicy {
    fn default() -> Self {
        Self {
            block_on_broken_chain: true,
            block_on_partial_chain: false,
        }
    }
}

impl EvidenceChainPolicy {
    /// No out-of-range states exist; kept for symmetry with MonitorPolicy
    /// so the policy store can validate any payload uniformly.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        Ok(())
    }
}

// ============================================================================
// Field-level diff
// ============================================================================

/// One changed field between two consecutive policy versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// Field-level diff between two policy payloads. Unchanged fields are
/// omitted entirely; identical payloads diff to an empty change set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDiff {
    pub changes: Vec<FieldChange>,
}

impl PolicyDiff {
    /// Diff two serializable policy payloads field by field.
    pub fn between<P: Serialize>(before: &P, after: &P) -> Self {
        let before = serde_json::to_value(before).unwrap_or(serde_json::Value::Null);
        let after = serde_json::to_value(after).unwrap_or(serde_json::Value::Null);

        let mut changes = Vec::new();
        if let (serde_json::Value::Object(b), serde_json::Value::Object(a)) = (&before, &after) {
            for (field, after_value) in a {
                let before_value = b.get(field).cloned().unwrap_or(serde_json::Value::Null);
                if &before_value != after_value {
                    changes.push(FieldChange {
                        field: field.clone(),
                        before: before_value,
                        after: after_value.clone(),
                    });
                }
            }
        }
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        assert!(MonitorPolicy::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_fields_all_reported() {
        let policy = MonitorPolicy {
            max_auto_reshare_attempts: 0,
            heartbeat_terminate_threshold_sec: 500,
            code_sync_interval_ms: 50,
            ..MonitorPolicy::default()
        };
        let violations = policy.validate().unwrap_err();
        assert_eq!(violations.len(), 3);
        assert!(violations[0].contains("max_auto_reshare_attempts"));
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let before = MonitorPolicy::default();
        let after = MonitorPolicy {
            auto_terminate_enabled: true,
            max_auto_reshare_attempts: 5,
            ..before.clone()
        };

        let diff = PolicyDiff::between(&before, &after);
        assert_eq!(diff.changes.len(), 2);
        let fields: Vec<_> = diff.changes.iter().map(|c| c.field.as_str()).collect();
        assert!(fields.contains(&"auto_terminate_enabled"));
        assert!(fields.contains(&"max_auto_reshare_attempts"));
    }

    #[test]
    fn diff_of_identical_payloads_is_empty() {
        let policy = MonitorPolicy::default();
        assert!(PolicyDiff::between(&policy, &policy).is_empty());
    }
}
