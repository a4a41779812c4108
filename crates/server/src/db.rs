//! Session registry persistence.
//!
//! Deliberately thin: full candidate/job CRUD lives outside this
//! subsystem. The guardrail core only needs enough of a registry to
//! select sessions by status for bulk policy apply.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use proctor_core::GuardrailError;
use proctor_guardrail::SessionDirectory;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: String,
    pub created_at: String,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            "#,
        )
    }

    pub fn create_session(&self, id: &str, status: &str) -> Result<SessionRecord, rusqlite::Error> {
        let record = SessionRecord {
            id: id.to_string(),
            status: status.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sessions (id, status, created_at) VALUES (?1, ?2, ?3)",
            params![record.id, record.status, record.created_at],
        )?;
        Ok(record)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, status, created_at FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(SessionRecord {
                    id: row.get(0)?,
                    status: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, status, created_at FROM sessions ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok(SessionRecord {
                id: row.get(0)?,
                status: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        rows.collect()
    }
}

impl SessionDirectory for Database {
    fn sessions_by_status(
        &self,
        statuses: &[String],
        limit: usize,
    ) -> Result<Vec<String>, GuardrailError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders: Vec<String> =
            (1..=statuses.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT id FROM sessions WHERE status IN ({}) ORDER BY created_at ASC LIMIT ?{}",
            placeholders.join(", "),
            statuses.len() + 1
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| GuardrailError::Storage(e.to_string()))?;
        let mut params: Vec<&dyn rusqlite::ToSql> =
            statuses.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let limit = limit as i64;
        params.push(&limit);

        let rows = stmt
            .query_map(params.as_slice(), |row| row.get::<_, String>(0))
            .map_err(|e| GuardrailError::Storage(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| GuardrailError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_by_status_filters_and_limits() {
        let db = Database::open_in_memory().unwrap();
        db.create_session("s1", "active").unwrap();
        db.create_session("s2", "active").unwrap();
        db.create_session("s3", "completed").unwrap();

        let ids = db
            .sessions_by_status(&["active".to_string()], 10)
            .unwrap();
        assert_eq!(ids.len(), 2);

        let limited = db.sessions_by_status(&["active".to_string()], 1).unwrap();
        assert_eq!(limited.len(), 1);

        let none = db
            .sessions_by_status(&["cancelled".to_string()], 10)
            .unwrap();
        assert!(none.is_empty());
    }
}
