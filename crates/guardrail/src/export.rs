//! Evidence Export Service.
//!
//! Exports are gated by the evidence-chain policy against the latest
//! verification status. A permitted export assembles its summary from
//! events already in the ledger, then appends its own record as a new
//! ledger event; the record never reflects itself in its counts.

use std::collections::HashMap;
use std::sync::Arc;

use proctor_core::{
    ChainStatus, EvidenceChainPolicy, EvidenceExportRecord, ExportMode, ExportSummary,
    GuardrailError, PolicyScope,
};
use proctor_core::export::ReasonCount;

use crate::clock::Clock;
use crate::event_log::{actions, EventLog};
use crate::ledger::Ledger;
use crate::policy_store::PolicyStore;
use crate::registry::{MonitorRegistry, RealtimeEvent};

const TOP_REASON_LIMIT: usize = 5;
const REASON_SCAN_LIMIT: usize = 2_000;

pub struct ExportService {
    log: Arc<EventLog>,
    ledger: Arc<Ledger>,
    chain_policies: Arc<PolicyStore<EvidenceChainPolicy>>,
    registry: Arc<dyn MonitorRegistry>,
    clock: Arc<dyn Clock>,
}

impl ExportService {
    pub fn new(
        log: Arc<EventLog>,
        ledger: Arc<Ledger>,
        chain_policies: Arc<PolicyStore<EvidenceChainPolicy>>,
        registry: Arc<dyn MonitorRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            log,
            ledger,
            chain_policies,
            registry,
            clock,
        }
    }

    /// Why an export is currently blocked, or None when permitted.
    pub fn export_blocked_reason(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, GuardrailError> {
        let verification = self.ledger.verify(session_id, None)?;
        let policy = self
            .chain_policies
            .current(&PolicyScope::CompanyDefault)?
            .policy;

        let reason = match verification.status {
            ChainStatus::Broken if policy.block_on_broken_chain => Some(
                "evidence chain is broken: a stored link fails recomputation".to_string(),
            ),
            ChainStatus::Partial if policy.block_on_partial_chain => Some(
                "evidence chain is partial: events are missing from the chain".to_string(),
            ),
            _ => None,
        };
        Ok(reason)
    }

    /// Assemble and record a point-in-time export. Fails with
    /// `ChainIntegrity` (and appends nothing) when the gate is closed.
    pub fn build_export(
        &self,
        session_id: &str,
        mode: ExportMode,
        files: Vec<String>,
        actor: &str,
    ) -> Result<EvidenceExportRecord, GuardrailError> {
        let verification = self.ledger.verify(session_id, None)?;
        if let Some(reason) = self.export_blocked_reason(session_id)? {
            return Err(GuardrailError::ChainIntegrity {
                status: verification.status,
                reason,
            });
        }

        // Summary comes strictly from events appended before this export.
        let scope = format!("session:{}", session_id);
        let integrity_event_count = self.log.count_chainable(&scope)?;
        let monitor_alert_count = self.log.count(&scope, actions::MONITOR_ALERT)?;
        let timeline_event_count =
            monitor_alert_count + self.log.count(&scope, actions::SESSION_TERMINATED)?;
        let (policy_reason_events, top_reasons) = self.tally_policy_reasons(&scope)?;

        let summary = ExportSummary {
            integrity_event_count,
            monitor_alert_count,
            timeline_event_count,
            policy_reason_events,
            policy_reason_unique: top_reasons.len() as u64,
            policy_top_reasons: top_reasons.into_iter().take(TOP_REASON_LIMIT).collect(),
            chain_status: verification.status,
            chain_linked_events: verification.linked_events,
            chain_checked_events: verification.checked_events,
            chain_latest_hash: verification.latest_hash,
        };

        let mut record = EvidenceExportRecord::new(mode, files, summary);
        record.exported_at = self.clock.now();

        self.ledger.record(
            session_id,
            actions::EVIDENCE_EXPORT,
            serde_json::json!({
                "kind": "evidence_export",
                "record": record,
                "exported_by": actor,
            }),
        )?;

        self.registry.broadcast(
            session_id,
            &RealtimeEvent::EvidenceExportLogged {
                session_id: session_id.to_string(),
                record: record.clone(),
            },
        );
        tracing::info!(
            session_id,
            export_id = %record.id,
            mode = record.mode.as_str(),
            "evidence export logged"
        );
        Ok(record)
    }

    /// Count policy-triggered alert reasons, most frequent first
    /// (ties broken alphabetically for stable output).
    fn tally_policy_reasons(
        &self,
        scope: &str,
    ) -> Result<(u64, Vec<ReasonCount>), GuardrailError> {
        let rows = self.log.list(scope, actions::MONITOR_ALERT, REASON_SCAN_LIMIT)?;
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut total = 0;
        for row in rows {
            let reason = row
                .payload
                .get("alert")
                .and_then(|a| a.get("metadata"))
                .and_then(|m| m.get("reason"))
                .and_then(|r| r.as_str());
            if let Some(reason) = reason {
                *counts.entry(reason.to_string()).or_insert(0) += 1;
                total += 1;
            }
        }

        let mut reasons: Vec<ReasonCount> = counts
            .into_iter()
            .map(|(reason, count)| ReasonCount { reason, count })
            .collect();
        reasons.sort_by(|a, b| b.count.cmp(&a.count).then(a.reason.cmp(&b.reason)));
        Ok((total, reasons))
    }
}
