//! Versioned policy store with idempotent writes and rollback-as-new-version.
//!
//! Both the company-default template and per-session overrides are
//! append-only version sequences in the event log; "current" is the
//! newest entry. A session override masks the company default from the
//! first explicit save onward, even if later reset to default values.
//!
//! Idempotency: a client-supplied key is reserved atomically in the
//! expiring store (token primary key, 24h validity window); the loser of
//! a racing insert re-reads the winner's version and returns it as a
//! replay instead of appending a second version.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

use proctor_core::{
    CurrentPolicy, EvidenceChainPolicy, GuardrailError, MonitorPolicy, PolicyDiff, PolicyScope,
    PolicySource, PolicyVersion, VersionSource,
};

use crate::clock::Clock;
use crate::event_log::{actions, EventLog, EventRecord};
use crate::expiring::{ExpiringStore, DEFAULT_TTL_MS};
use crate::ledger::Ledger;
use crate::registry::{MonitorRegistry, RealtimeEvent};

// ============================================================================
// Payload abstraction
// ============================================================================

/// A policy payload the store can version: monitor policy or
/// evidence-chain policy, each with its own append-only sequence.
pub trait PolicyPayload:
    Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static
{
    const ACTION: &'static str;

    fn validate(&self) -> Result<(), Vec<String>>;

    /// The realtime message broadcast after a successful mutation.
    fn updated_event(
        scope: &PolicyScope,
        policy: &Self,
        reason: Option<&str>,
        updated_by: &str,
    ) -> RealtimeEvent;
}

impl PolicyPayload for MonitorPolicy {
    const ACTION: &'static str = actions::MONITOR_POLICY;

    fn validate(&self) -> Result<(), Vec<String>> {
        MonitorPolicy::validate(self)
    }

    fn updated_event(
        scope: &PolicyScope,
        policy: &Self,
        reason: Option<&str>,
        updated_by: &str,
    ) -> RealtimeEvent {
        match scope {
            PolicyScope::Session(id) => RealtimeEvent::MonitorPolicyUpdated {
                session_id: id.clone(),
                policy: policy.clone(),
                reason: reason.map(str::to_string),
                updated_by: updated_by.to_string(),
            },
            PolicyScope::CompanyDefault => RealtimeEvent::CompanyMonitorPolicyTemplateUpdated {
                policy: policy.clone(),
                reason: reason.map(str::to_string),
                updated_by: updated_by.to_string(),
            },
        }
    }
}

impl PolicyPayload for EvidenceChainPolicy {
    const ACTION: &'static str = actions::EVIDENCE_CHAIN_POLICY;

    fn validate(&self) -> Result<(), Vec<String>> {
        EvidenceChainPolicy::validate(self)
    }

    fn updated_event(
        _scope: &PolicyScope,
        policy: &Self,
        reason: Option<&str>,
        updated_by: &str,
    ) -> RealtimeEvent {
        RealtimeEvent::CompanyEvidenceChainPolicyUpdated {
            policy: *policy,
            reason: reason.map(str::to_string),
            updated_by: updated_by.to_string(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveOutcome<P> {
    pub version: PolicyVersion<P>,
    /// True when an idempotency key matched a prior mutation and the
    /// original result was returned instead of a new version
    pub idempotent_replay: bool,
}

/// History entry carrying the field-level diff against its predecessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry<P> {
    #[serde(flatten)]
    pub version: PolicyVersion<P>,
    pub diff: PolicyDiff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// Skip sessions that already have an explicit override (idempotent
    /// by construction)
    MissingOnly,
    /// Append a version to every selected session on every call
    /// (documented non-idempotent)
    Overwrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub applied: u64,
    pub skipped: u64,
    pub total_candidates: u64,
    pub affected_session_ids: Vec<String>,
}

/// Where bulk apply finds candidate sessions. The session registry
/// itself is an external collaborator; only status selection is needed.
pub trait SessionDirectory: Send + Sync {
    fn sessions_by_status(
        &self,
        statuses: &[String],
        limit: usize,
    ) -> Result<Vec<String>, GuardrailError>;
}

// ============================================================================
// Store
// ============================================================================

pub struct PolicyStore<P: PolicyPayload> {
    log: Arc<EventLog>,
    expiring: ExpiringStore,
    ledger: Arc<Ledger>,
    registry: Arc<dyn MonitorRegistry>,
    clock: Arc<dyn Clock>,
    _payload: PhantomData<P>,
}

impl<P: PolicyPayload> PolicyStore<P> {
    pub fn new(
        log: Arc<EventLog>,
        ledger: Arc<Ledger>,
        registry: Arc<dyn MonitorRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            expiring: ExpiringStore::new(log.clone()),
            log,
            ledger,
            registry,
            clock,
            _payload: PhantomData,
        }
    }

    /// Save a new policy version. A repeated idempotency key within its
    /// validity window returns the original version unchanged.
    pub fn save(
        &self,
        scope: &PolicyScope,
        policy: P,
        reason: Option<String>,
        idempotency_key: Option<String>,
        actor: &str,
    ) -> Result<SaveOutcome<P>, GuardrailError> {
        policy.validate().map_err(GuardrailError::Validation)?;

        let mut version = PolicyVersion::new(policy, VersionSource::Manual, actor);
        version.reason = reason;
        version.idempotency_key = idempotency_key;
        version.created_at = self.clock.now();
        self.append_version(scope, version)
    }

    /// Append a new version carrying a prior version's payload.
    /// `NotFound` unless `version_id` belongs to this scope's sequence.
    pub fn rollback(
        &self,
        scope: &PolicyScope,
        version_id: &str,
        reason: Option<String>,
        idempotency_key: Option<String>,
        actor: &str,
    ) -> Result<SaveOutcome<P>, GuardrailError> {
        let target = self
            .log
            .find_target(&scope.storage_key(), P::ACTION, version_id)?
            .ok_or_else(|| {
                GuardrailError::NotFound(format!(
                    "policy version {} not in scope {}",
                    version_id,
                    scope.storage_key()
                ))
            })?;
        let target: PolicyVersion<P> = parse_version(&target)?;

        let mut version = PolicyVersion::new(target.policy, VersionSource::Rollback, actor);
        version.reason = reason;
        version.rollback_from = Some(version_id.to_string());
        version.idempotency_key = idempotency_key;
        version.created_at = self.clock.now();
        self.append_version(scope, version)
    }

    /// Resolve the current policy. A session scope with no saved version
    /// inherits the company template (reported as `default` for the
    /// session, since no override exists yet); with no versions anywhere
    /// the frozen crate default applies.
    pub fn current(&self, scope: &PolicyScope) -> Result<CurrentPolicy<P>, GuardrailError> {
        if let Some(record) = self.log.latest(&scope.storage_key(), P::ACTION)? {
            let version: PolicyVersion<P> = parse_version(&record)?;
            return Ok(CurrentPolicy {
                policy: version.policy,
                source: PolicySource::Saved,
                updated_at: Some(version.created_at),
                updated_by: Some(version.created_by),
            });
        }

        if matches!(scope, PolicyScope::Session(_)) {
            let company = self.current(&PolicyScope::CompanyDefault)?;
            return Ok(CurrentPolicy {
                policy: company.policy,
                source: PolicySource::Default,
                updated_at: None,
                updated_by: None,
            });
        }

        Ok(CurrentPolicy {
            policy: P::default(),
            source: PolicySource::Default,
            updated_at: None,
            updated_by: None,
        })
    }

    /// Versions newest-first, each with its diff against the immediately
    /// preceding version (the first version diffs against the default).
    pub fn history(
        &self,
        scope: &PolicyScope,
        limit: usize,
    ) -> Result<Vec<HistoryEntry<P>>, GuardrailError> {
        // One extra row so the oldest returned entry still has a predecessor.
        let rows = self
            .log
            .list(&scope.storage_key(), P::ACTION, limit.saturating_add(1))?;
        let versions: Vec<PolicyVersion<P>> = rows
            .iter()
            .map(parse_version)
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(versions.len().min(limit));
        for (i, version) in versions.iter().take(limit).enumerate() {
            let default = P::default();
            let predecessor = versions.get(i + 1).map(|v| &v.policy).unwrap_or(&default);
            entries.push(HistoryEntry {
                version: version.clone(),
                diff: PolicyDiff::between(predecessor, &version.policy),
            });
        }
        Ok(entries)
    }

    /// Apply a policy to sessions selected by status. `MissingOnly` skips
    /// sessions that already have an explicit override; `dry_run`
    /// computes the same counts without appending or broadcasting.
    pub fn apply_to_sessions(
        &self,
        directory: &dyn SessionDirectory,
        policy: P,
        statuses: &[String],
        mode: ApplyMode,
        limit: usize,
        dry_run: bool,
        actor: &str,
    ) -> Result<ApplyReport, GuardrailError> {
        policy.validate().map_err(GuardrailError::Validation)?;

        let candidates = directory.sessions_by_status(statuses, limit)?;
        let mut report = ApplyReport {
            applied: 0,
            skipped: 0,
            total_candidates: candidates.len() as u64,
            affected_session_ids: Vec::new(),
        };

        let source = match mode {
            ApplyMode::MissingOnly => VersionSource::CompanyApplyBulk,
            ApplyMode::Overwrite => VersionSource::CompanyApplyOverwrite,
        };

        for session_id in candidates {
            let scope = PolicyScope::Session(session_id.clone());
            let has_override = self.log.latest(&scope.storage_key(), P::ACTION)?.is_some();
            if mode == ApplyMode::MissingOnly && has_override {
                report.skipped += 1;
                continue;
            }

            if !dry_run {
                let mut version = PolicyVersion::new(policy.clone(), source, actor);
                version.reason = Some(format!("company apply ({})", mode_label(mode)));
                version.created_at = self.clock.now();
                self.append_version(&scope, version)?;
            }
            report.applied += 1;
            report.affected_session_ids.push(session_id);
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn append_version(
        &self,
        scope: &PolicyScope,
        version: PolicyVersion<P>,
    ) -> Result<SaveOutcome<P>, GuardrailError> {
        if let Some(key) = version.idempotency_key.clone() {
            let token = idempotency_token(scope, P::ACTION, version.source, &key);
            let now = self.clock.now_ms();
            if let Some(existing_id) =
                self.expiring.reserve(&token, &version.id, now, DEFAULT_TTL_MS)?
            {
                match self.log.find_target(&scope.storage_key(), P::ACTION, &existing_id)? {
                    Some(record) => {
                        return Ok(SaveOutcome {
                            version: parse_version(&record)?,
                            idempotent_replay: true,
                        });
                    }
                    None => {
                        // Dangling reservation from a failed append; free
                        // the token and claim it for this attempt.
                        self.expiring.release(&token)?;
                        if self
                            .expiring
                            .reserve(&token, &version.id, now, DEFAULT_TTL_MS)?
                            .is_some()
                        {
                            return Err(GuardrailError::RaceConflict(format!(
                                "idempotency key {} reserved concurrently",
                                key
                            )));
                        }
                    }
                }
            }

            let outcome = self.persist_version(scope, version);
            if outcome.is_err() {
                let _ = self.expiring.release(&token);
            }
            return outcome;
        }

        self.persist_version(scope, version)
    }

    fn persist_version(
        &self,
        scope: &PolicyScope,
        version: PolicyVersion<P>,
    ) -> Result<SaveOutcome<P>, GuardrailError> {
        let payload = serde_json::to_value(&version)
            .map_err(|e| GuardrailError::Storage(e.to_string()))?;
        self.log.append(&EventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            scope: scope.storage_key(),
            action: P::ACTION.to_string(),
            target_id: Some(version.id.clone()),
            payload,
            idempotency_key: version.idempotency_key.clone(),
            chain_seq: None,
            created_at: version.created_at.timestamp_millis(),
        })?;

        // Session-scope mutations are integrity-relevant: chain them.
        // The version append is authoritative; a ledger failure leaves a
        // detectable partial chain rather than rolling back.
        if let Some(session_id) = scope.session_id() {
            let chain_payload = serde_json::json!({
                "kind": "policy_change",
                "policy_action": P::ACTION,
                "version_id": version.id,
                "source": version.source,
                "reason": version.reason,
                "updated_by": version.created_by,
            });
            if let Err(e) = self
                .ledger
                .record(session_id, actions::POLICY_CHANGE, chain_payload)
            {
                tracing::error!(session_id, error = %e, "policy change ledger append failed");
            }
        }

        let event = P::updated_event(
            scope,
            &version.policy,
            version.reason.as_deref(),
            &version.created_by,
        );
        let delivered = match scope {
            PolicyScope::Session(id) => self.registry.broadcast(id, &event),
            PolicyScope::CompanyDefault => self.registry.broadcast_company(&event),
        };
        tracing::debug!(
            scope = %scope.storage_key(),
            version_id = %version.id,
            delivered,
            "policy version appended"
        );

        Ok(SaveOutcome {
            version,
            idempotent_replay: false,
        })
    }
}

fn mode_label(mode: ApplyMode) -> &'static str {
    match mode {
        ApplyMode::MissingOnly => "missing_only",
        ApplyMode::Overwrite => "overwrite",
    }
}

// The mutation source is part of the token so a save and a rollback
// reusing one client key reserve independently instead of replaying
// each other.
fn idempotency_token(scope: &PolicyScope, action: &str, source: VersionSource, key: &str) -> String {
    format!(
        "idem|{}|{}|{}|{}",
        scope.storage_key(),
        action,
        source.as_str(),
        key
    )
}

fn parse_version<P: PolicyPayload>(
    record: &EventRecord,
) -> Result<PolicyVersion<P>, GuardrailError> {
    serde_json::from_value(record.payload.clone())
        .map_err(|e| GuardrailError::Storage(format!("corrupt policy version: {}", e)))
}
