//! Evidence Chain Ledger.
//!
//! Every integrity-relevant event (alert, policy change, termination,
//! export) is appended as its own log row plus a hash-chain link row.
//! Appends are serialized per session: a per-session mutex covers the
//! head read, and the unique `(scope, chain_seq)` index backstops a lost
//! race with one optimistic retry on a fresh head read.
//!
//! Verification recomputes every checked link's hash from its stored
//! inputs, checks `prev_hash` continuity, and re-digests each linked
//! event row, then compares the link count against the independently
//! stored chainable-event count: events with no link verify as
//! `partial`, an edited or deleted event as `broken`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use proctor_core::chain::{event_digest, genesis_hash};
use proctor_core::{ChainStatus, EvidenceChainLink, GuardrailError};

use crate::clock::Clock;
use crate::event_log::{actions, EventLog, EventLogError, EventRecord};

const DEFAULT_VERIFY_LIMIT: usize = 500;

/// Result of verifying a session's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub status: ChainStatus,
    /// Total links stored for the session
    pub linked_events: u64,
    /// Links actually recomputed in this pass
    pub checked_events: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_hash: Option<String>,
}

/// One chained event as returned by the evidence timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub event_id: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

pub struct Ledger {
    log: Arc<EventLog>,
    clock: Arc<dyn Clock>,
    /// Single-writer-per-session serialization for appends
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Verification results keyed by (session, limit); invalidated on
    /// every append and on session termination
    verify_cache: RwLock<HashMap<(String, usize), ChainVerification>>,
}

impl Ledger {
    pub fn new(log: Arc<EventLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            log,
            clock,
            session_locks: Mutex::new(HashMap::new()),
            verify_cache: RwLock::new(HashMap::new()),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().expect("session lock map poisoned");
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn scope(session_id: &str) -> String {
        format!("session:{}", session_id)
    }

    /// Append an integrity event and its chain link. Returns the link.
    pub fn record(
        &self,
        session_id: &str,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<EvidenceChainLink, GuardrailError> {
        debug_assert!(actions::CHAINABLE.contains(&action));

        let scope = Self::scope(session_id);
        let event_id = uuid::Uuid::new_v4().to_string();
        let digest = event_digest(&payload);
        let now = self.clock.now_ms();

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().expect("session lock poisoned");

        self.log
            .append(&EventRecord {
                id: event_id.clone(),
                scope: scope.clone(),
                action: action.to_string(),
                target_id: None,
                payload,
                idempotency_key: None,
                chain_seq: None,
                created_at: now,
            })
            .map_err(GuardrailError::from)?;

        // Two attempts: the unique (scope, chain_seq) index catches a head
        // race that slipped past the session lock (e.g. another process).
        let mut last_err = None;
        for _ in 0..2 {
            let prev = self.load_head(&scope)?;
            let link = EvidenceChainLink::next(prev.as_ref(), &event_id, &digest);
            let record = EventRecord {
                id: uuid::Uuid::new_v4().to_string(),
                scope: scope.clone(),
                action: actions::CHAIN_LINK.to_string(),
                target_id: Some(event_id.clone()),
                payload: serde_json::to_value(&link)
                    .map_err(|e| GuardrailError::Storage(e.to_string()))?,
                idempotency_key: None,
                chain_seq: Some(link.sequence),
                created_at: self.clock.now_ms(),
            };
            match self.log.append(&record) {
                Ok(()) => {
                    self.invalidate(session_id);
                    return Ok(link);
                }
                Err(EventLogError::Conflict(msg)) => {
                    tracing::warn!(session_id, %msg, "chain head race, retrying with fresh head");
                    last_err = Some(GuardrailError::RaceConflict(msg));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| GuardrailError::RaceConflict("chain append".to_string())))
    }

    fn load_head(&self, scope: &str) -> Result<Option<EvidenceChainLink>, GuardrailError> {
        let head = self.log.chain_head(scope).map_err(GuardrailError::from)?;
        match head {
            Some(record) => {
                let link: EvidenceChainLink = serde_json::from_value(record.payload)
                    .map_err(|e| GuardrailError::Storage(format!("corrupt chain link: {}", e)))?;
                Ok(Some(link))
            }
            None => Ok(None),
        }
    }

    /// Verify the session's chain. Deterministic between appends.
    pub fn verify(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<ChainVerification, GuardrailError> {
        let limit = limit.unwrap_or(DEFAULT_VERIFY_LIMIT);
        let cache_key = (session_id.to_string(), limit);
        {
            let cache = self.verify_cache.read().expect("verify cache poisoned");
            if let Some(result) = cache.get(&cache_key) {
                return Ok(result.clone());
            }
        }

        let result = self.verify_uncached(session_id, limit)?;
        let mut cache = self.verify_cache.write().expect("verify cache poisoned");
        cache.insert(cache_key, result.clone());
        Ok(result)
    }

    fn verify_uncached(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<ChainVerification, GuardrailError> {
        let scope = Self::scope(session_id);
        let linked_events = self.log.count(&scope, actions::CHAIN_LINK)?;
        if linked_events == 0 {
            return Ok(ChainVerification {
                status: ChainStatus::NotInitialized,
                linked_events: 0,
                checked_events: 0,
                latest_hash: None,
            });
        }

        let rows = self.log.chain_links(&scope, limit)?;
        let mut links = Vec::with_capacity(rows.len());
        for row in rows {
            let link: EvidenceChainLink = serde_json::from_value(row.payload)
                .map_err(|e| GuardrailError::Storage(format!("corrupt chain link: {}", e)))?;
            links.push(link);
        }

        let checked_events = links.len() as u64;
        let mut broken = false;
        let mut expected_prev = genesis_hash();
        for link in &links {
            if link.prev_hash != expected_prev || !link.recomputes() {
                broken = true;
                break;
            }
            // Re-digest the linked event: an edited or deleted event row
            // no longer matches the digest sealed into its link.
            match self.log.find_by_id(&link.event_id)? {
                Some(event) if event_digest(&event.payload) == link.event_digest => {}
                _ => {
                    broken = true;
                    break;
                }
            }
            expected_prev = link.hash.clone();
        }

        let latest_hash = links.last().map(|l| l.hash.clone());
        let status = if broken {
            ChainStatus::Broken
        } else if self.log.count_chainable(&scope)? > linked_events {
            // Links verify but events exist with no link: deletion or a
            // skipped append, distinct from an edited event.
            ChainStatus::Partial
        } else {
            ChainStatus::Valid
        };

        Ok(ChainVerification {
            status,
            linked_events,
            checked_events,
            latest_hash,
        })
    }

    /// Chained events newest-first for the evidence timeline view.
    pub fn timeline(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<TimelineEntry>, GuardrailError> {
        let rows = self.log.chainable_events(&Self::scope(session_id), limit)?;
        Ok(rows
            .into_iter()
            .map(|row| TimelineEntry {
                event_id: row.id,
                action: row.action,
                payload: row.payload,
                created_at: row.created_at,
            })
            .collect())
    }

    /// Drop cached verification results for a session.
    pub fn invalidate(&self, session_id: &str) {
        let mut cache = self.verify_cache.write().expect("verify cache poisoned");
        cache.retain(|(session, _), _| session != session_id);
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }
}
