//! Append-only integrity event log over SQLite.
//!
//! Policy versions, chain links, alerts, terminations and exports are all
//! rows in one table keyed by `(scope, action, target_id, created_at)`.
//! "Current policy" and "chain head" are derived views (max by
//! `created_at`, tie-broken by rowid) fronted by a small materialized
//! latest-entry cache that is invalidated on every successful append.
//! Rows are never updated or deleted through this type.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};
use thiserror::Error;

use proctor_core::GuardrailError;

/// Event `action` values stored in the log.
pub mod actions {
    /// Versioned monitor-policy mutation (save / rollback / bulk apply)
    pub const MONITOR_POLICY: &str = "monitor_policy";
    /// Versioned evidence-chain-policy mutation
    pub const EVIDENCE_CHAIN_POLICY: &str = "evidence_chain_policy";
    /// Hash chain link (one per chained event)
    pub const CHAIN_LINK: &str = "chain_link";
    /// Chainable events
    pub const MONITOR_ALERT: &str = "monitor_alert";
    pub const POLICY_CHANGE: &str = "policy_change";
    pub const SESSION_TERMINATED: &str = "session_terminated";
    pub const EVIDENCE_EXPORT: &str = "evidence_export";

    /// Every action that must carry a chain link.
    pub const CHAINABLE: &[&str] = &[
        MONITOR_ALERT,
        POLICY_CHANGE,
        SESSION_TERMINATED,
        EVIDENCE_EXPORT,
    ];
}

/// One immutable row in the integrity event log.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: String,
    pub scope: String,
    pub action: String,
    pub target_id: Option<String>,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    /// Chain sequence, set only for `chain_link` rows; enforced unique
    /// per scope so concurrent appends racing on the head lose cleanly.
    pub chain_seq: Option<u64>,
    /// Unix millis
    pub created_at: i64,
}

#[derive(Debug, Error)]
pub enum EventLogError {
    /// Unique-constraint violation (chain sequence already taken)
    #[error("append conflict: {0}")]
    Conflict(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<EventLogError> for GuardrailError {
    fn from(err: EventLogError) -> Self {
        match err {
            EventLogError::Conflict(msg) => GuardrailError::RaceConflict(msg),
            EventLogError::Sqlite(e) => GuardrailError::Storage(e.to_string()),
        }
    }
}

pub struct EventLog {
    conn: Mutex<Connection>,
    /// Latest row per (scope, action); replaced on append.
    latest_cache: RwLock<HashMap<String, EventRecord>>,
}

impl EventLog {
    pub fn open(path: &Path) -> Result<Self, EventLogError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory log for tests.
    pub fn open_in_memory() -> Result<Self, EventLogError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, EventLogError> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            latest_cache: RwLock::new(HashMap::new()),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS integrity_events (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                action TEXT NOT NULL,
                target_id TEXT,
                payload TEXT NOT NULL,
                idempotency_key TEXT,
                chain_seq INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_scope_action
                ON integrity_events(scope, action, created_at);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_chain_seq
                ON integrity_events(scope, chain_seq)
                WHERE chain_seq IS NOT NULL;

            CREATE TABLE IF NOT EXISTS expiring_kv (
                token TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            "#,
        )
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("event log mutex poisoned")
    }

    /// Append one row. Never updates; a unique-index hit surfaces as
    /// `Conflict` for the caller to retry with a fresh read.
    pub fn append(&self, record: &EventRecord) -> Result<(), EventLogError> {
        let result = self.conn().execute(
            r#"INSERT INTO integrity_events
               (id, scope, action, target_id, payload, idempotency_key, chain_seq, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                record.id,
                record.scope,
                record.action,
                record.target_id,
                record.payload.to_string(),
                record.idempotency_key,
                record.chain_seq.map(|s| s as i64),
                record.created_at,
            ],
        );

        match result {
            Ok(_) => {
                let mut cache = self.latest_cache.write().expect("latest cache poisoned");
                cache.insert(cache_key(&record.scope, &record.action), record.clone());
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, msg))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(EventLogError::Conflict(
                    msg.unwrap_or_else(|| "unique constraint violation".to_string()),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Latest row for (scope, action), via the materialized cache.
    pub fn latest(&self, scope: &str, action: &str) -> Result<Option<EventRecord>, EventLogError> {
        {
            let cache = self.latest_cache.read().expect("latest cache poisoned");
            if let Some(record) = cache.get(&cache_key(scope, action)) {
                return Ok(Some(record.clone()));
            }
        }

        let record = self.query_latest(scope, action)?;
        if let Some(ref r) = record {
            let mut cache = self.latest_cache.write().expect("latest cache poisoned");
            cache.insert(cache_key(scope, action), r.clone());
        }
        Ok(record)
    }

    fn query_latest(&self, scope: &str, action: &str) -> Result<Option<EventRecord>, EventLogError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                r#"SELECT id, scope, action, target_id, payload, idempotency_key, chain_seq, created_at
                   FROM integrity_events
                   WHERE scope = ?1 AND action = ?2
                   ORDER BY created_at DESC, rowid DESC
                   LIMIT 1"#,
                params![scope, action],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Rows for (scope, action), newest-first up to `limit`.
    pub fn list(
        &self,
        scope: &str,
        action: &str,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT id, scope, action, target_id, payload, idempotency_key, chain_seq, created_at
               FROM integrity_events
               WHERE scope = ?1 AND action = ?2
               ORDER BY created_at DESC, rowid DESC
               LIMIT ?3"#,
        )?;
        let rows = stmt.query_map(params![scope, action, limit as i64], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Chain links oldest-first (creation order) up to `limit`.
    pub fn chain_links(&self, scope: &str, limit: usize) -> Result<Vec<EventRecord>, EventLogError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT id, scope, action, target_id, payload, idempotency_key, chain_seq, created_at
               FROM integrity_events
               WHERE scope = ?1 AND action = ?2
               ORDER BY chain_seq ASC
               LIMIT ?3"#,
        )?;
        let rows = stmt.query_map(params![scope, actions::CHAIN_LINK, limit as i64], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Current chain head: the link with the highest sequence. Bypasses
    /// the latest cache; callers serialize appends around this read.
    pub fn chain_head(&self, scope: &str) -> Result<Option<EventRecord>, EventLogError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                r#"SELECT id, scope, action, target_id, payload, idempotency_key, chain_seq, created_at
                   FROM integrity_events
                   WHERE scope = ?1 AND action = ?2 AND chain_seq IS NOT NULL
                   ORDER BY chain_seq DESC
                   LIMIT 1"#,
                params![scope, actions::CHAIN_LINK],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Chainable event rows (alerts, policy changes, terminations,
    /// exports) newest-first up to `limit`.
    pub fn chainable_events(
        &self,
        scope: &str,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT id, scope, action, target_id, payload, idempotency_key, chain_seq, created_at
               FROM integrity_events
               WHERE scope = ?1 AND action IN (?2, ?3, ?4, ?5)
               ORDER BY created_at DESC, rowid DESC
               LIMIT ?6"#,
        )?;
        let rows = stmt.query_map(
            params![
                scope,
                actions::MONITOR_ALERT,
                actions::POLICY_CHANGE,
                actions::SESSION_TERMINATED,
                actions::EVIDENCE_EXPORT,
                limit as i64
            ],
            row_to_record,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self, scope: &str, action: &str) -> Result<u64, EventLogError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM integrity_events WHERE scope = ?1 AND action = ?2",
            params![scope, action],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Count of events that should each have a chain link.
    pub fn count_chainable(&self, scope: &str) -> Result<u64, EventLogError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            r#"SELECT COUNT(*) FROM integrity_events
               WHERE scope = ?1 AND action IN (?2, ?3, ?4, ?5)"#,
            params![
                scope,
                actions::MONITOR_ALERT,
                actions::POLICY_CHANGE,
                actions::SESSION_TERMINATED,
                actions::EVIDENCE_EXPORT
            ],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Find a specific row by (scope, action, target_id).
    pub fn find_target(
        &self,
        scope: &str,
        action: &str,
        target_id: &str,
    ) -> Result<Option<EventRecord>, EventLogError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                r#"SELECT id, scope, action, target_id, payload, idempotency_key, chain_seq, created_at
                   FROM integrity_events
                   WHERE scope = ?1 AND action = ?2 AND target_id = ?3
                   ORDER BY created_at DESC, rowid DESC
                   LIMIT 1"#,
                params![scope, action, target_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Find the row whose primary id matches.
    pub fn find_by_id(&self, id: &str) -> Result<Option<EventRecord>, EventLogError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                r#"SELECT id, scope, action, target_id, payload, idempotency_key, chain_seq, created_at
                   FROM integrity_events WHERE id = ?1"#,
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }
}

fn cache_key(scope: &str, action: &str) -> String {
    format!("{}|{}", scope, action)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<EventRecord, rusqlite::Error> {
    let payload: String = row.get(4)?;
    Ok(EventRecord {
        id: row.get(0)?,
        scope: row.get(1)?,
        action: row.get(2)?,
        target_id: row.get(3)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        idempotency_key: row.get(5)?,
        chain_seq: row.get::<_, Option<i64>>(6)?.map(|s| s as u64),
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(scope: &str, action: &str, created_at: i64) -> EventRecord {
        EventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            scope: scope.to_string(),
            action: action.to_string(),
            target_id: None,
            payload: serde_json::json!({"at": created_at}),
            idempotency_key: None,
            chain_seq: None,
            created_at,
        }
    }

    #[test]
    fn latest_tracks_appends() {
        let log = EventLog::open_in_memory().unwrap();
        log.append(&record("session:a", actions::MONITOR_ALERT, 100)).unwrap();
        log.append(&record("session:a", actions::MONITOR_ALERT, 200)).unwrap();

        let latest = log.latest("session:a", actions::MONITOR_ALERT).unwrap().unwrap();
        assert_eq!(latest.created_at, 200);
        assert_eq!(log.count("session:a", actions::MONITOR_ALERT).unwrap(), 2);
    }

    #[test]
    fn list_is_newest_first_and_limited() {
        let log = EventLog::open_in_memory().unwrap();
        for at in [100, 200, 300] {
            log.append(&record("session:a", actions::POLICY_CHANGE, at)).unwrap();
        }

        let rows = log.list("session:a", actions::POLICY_CHANGE, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].created_at, 300);
        assert_eq!(rows[1].created_at, 200);
    }

    #[test]
    fn duplicate_chain_seq_conflicts() {
        let log = EventLog::open_in_memory().unwrap();
        let mut first = record("session:a", actions::CHAIN_LINK, 100);
        first.chain_seq = Some(1);
        let mut second = record("session:a", actions::CHAIN_LINK, 101);
        second.chain_seq = Some(1);

        log.append(&first).unwrap();
        let err = log.append(&second).unwrap_err();
        assert!(matches!(err, EventLogError::Conflict(_)));
    }

    #[test]
    fn scopes_are_isolated() {
        let log = EventLog::open_in_memory().unwrap();
        log.append(&record("session:a", actions::MONITOR_ALERT, 100)).unwrap();

        assert!(log.latest("session:b", actions::MONITOR_ALERT).unwrap().is_none());
        assert_eq!(log.count_chainable("session:b").unwrap(), 0);
    }
}
