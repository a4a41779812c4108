//! Expiring key-value store.
//!
//! Replaces in-memory pending-state maps with a table in the same
//! database as the event log, so a process restart does not silently
//! drop in-flight idempotency windows. Expired rows are swept lazily on
//! access; there is no background sweeper.
//!
//! `reserve()` is the atomic "insert if token absent" arbiter behind
//! policy-store idempotency: the token is the primary key, so of two
//! racing writers exactly one wins the reservation.

use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use crate::event_log::{EventLog, EventLogError};

/// Default idempotency-key validity window.
pub const DEFAULT_TTL_MS: i64 = 24 * 60 * 60 * 1000;

pub struct ExpiringStore {
    log: Arc<EventLog>,
}

impl ExpiringStore {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    /// Insert `token -> value` if the token is absent (or expired).
    /// Returns `None` on a fresh reservation, or the existing live value.
    pub fn reserve(
        &self,
        token: &str,
        value: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<Option<String>, EventLogError> {
        let conn = self.log.conn();

        // Lazy sweep: a dead reservation frees the token for reuse.
        conn.execute(
            "DELETE FROM expiring_kv WHERE token = ?1 AND expires_at <= ?2",
            params![token, now_ms],
        )?;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO expiring_kv (token, value, expires_at) VALUES (?1, ?2, ?3)",
            params![token, value, now_ms + ttl_ms],
        )?;

        if inserted == 1 {
            return Ok(None);
        }

        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM expiring_kv WHERE token = ?1 AND expires_at > ?2",
                params![token, now_ms],
                |row| row.get(0),
            )
            .optional()?;
        Ok(existing)
    }

    /// Look up a live value, sweeping it if expired.
    pub fn get(&self, token: &str, now_ms: i64) -> Result<Option<String>, EventLogError> {
        let conn = self.log.conn();
        conn.execute(
            "DELETE FROM expiring_kv WHERE token = ?1 AND expires_at <= ?2",
            params![token, now_ms],
        )?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM expiring_kv WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Release a reservation (used when the guarded append failed).
    pub fn release(&self, token: &str) -> Result<(), EventLogError> {
        self.log
            .conn()
            .execute("DELETE FROM expiring_kv WHERE token = ?1", params![token])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ExpiringStore {
        ExpiringStore::new(Arc::new(EventLog::open_in_memory().unwrap()))
    }

    #[test]
    fn reserve_is_first_writer_wins() {
        let store = store();
        assert_eq!(store.reserve("k", "v1", 1_000, 10_000).unwrap(), None);
        assert_eq!(
            store.reserve("k", "v2", 2_000, 10_000).unwrap(),
            Some("v1".to_string())
        );
    }

    #[test]
    fn expired_token_is_reusable() {
        let store = store();
        store.reserve("k", "v1", 1_000, 5_000).unwrap();

        // Still live just before expiry
        assert_eq!(store.get("k", 5_999).unwrap(), Some("v1".to_string()));

        // Swept at expiry; a new reservation succeeds
        assert_eq!(store.get("k", 6_000).unwrap(), None);
        assert_eq!(store.reserve("k", "v2", 6_001, 5_000).unwrap(), None);
    }

    #[test]
    fn release_frees_the_token() {
        let store = store();
        store.reserve("k", "v1", 1_000, 10_000).unwrap();
        store.release("k").unwrap();
        assert_eq!(store.reserve("k", "v2", 1_001, 10_000).unwrap(), None);
    }
}
