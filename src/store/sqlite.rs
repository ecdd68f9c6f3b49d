//! Sqlite event backend.
//!
//! Single-file durable log for the admin CLI and any embedding that needs
//! events to survive restarts. One `events` table in append order (rowid);
//! the store front rebuilds its dedup index from this log on open.

use std::path::Path;

use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{EventBackend, EventKind, EventRecord};
use crate::error::SplitError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id         TEXT PRIMARY KEY,
    test_id    TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    variant_id TEXT NOT NULL,
    kind       TEXT NOT NULL,
    value      REAL,
    at_ms      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_test ON events(test_id);
";

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (or create) the event log at `path`.
    pub fn open(path: &Path) -> Result<Self, SplitError> {
        let conn = Connection::open(path)
            .map_err(|e| SplitError::Persistence(format!("open {}: {e}", path.display())))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database. Same code paths as the file-backed log,
    /// without touching disk — used in tests.
    pub fn open_in_memory() -> Result<Self, SplitError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SplitError::Persistence(format!("open in-memory: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, SplitError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| SplitError::Persistence(format!("create schema: {e}")))?;
        Ok(Self { conn })
    }
}

impl EventBackend for SqliteBackend {
    fn append(&mut self, event: &EventRecord) -> Result<(), SplitError> {
        let (kind, value) = match &event.kind {
            EventKind::Exposure => ("exposure", None),
            EventKind::Conversion { value } => ("conversion", *value),
        };
        self.conn
            .execute(
                "INSERT INTO events (id, test_id, subject_id, variant_id, kind, value, at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.id.to_string(),
                    event.test_id,
                    event.subject_id,
                    event.variant_id,
                    kind,
                    value,
                    event.at_ms as i64,
                ],
            )
            .map_err(|e| SplitError::Persistence(format!("append event: {e}")))?;
        Ok(())
    }

    fn load(&mut self, test_id: Option<&str>) -> Result<Vec<EventRecord>, SplitError> {
        let sql_all = "SELECT id, test_id, subject_id, variant_id, kind, value, at_ms
                       FROM events ORDER BY rowid";
        let sql_one = "SELECT id, test_id, subject_id, variant_id, kind, value, at_ms
                       FROM events WHERE test_id = ?1 ORDER BY rowid";

        let mut stmt = self
            .conn
            .prepare(if test_id.is_some() { sql_one } else { sql_all })
            .map_err(|e| SplitError::Persistence(format!("prepare load: {e}")))?;

        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<EventRecord> {
            let id: String = row.get(0)?;
            let kind: String = row.get(4)?;
            let value: Option<f64> = row.get(5)?;
            let at_ms: i64 = row.get(6)?;
            Ok(EventRecord {
                id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                test_id: row.get(1)?,
                subject_id: row.get(2)?,
                variant_id: row.get(3)?,
                kind: match kind.as_str() {
                    "conversion" => EventKind::Conversion { value },
                    _ => EventKind::Exposure,
                },
                at_ms: at_ms as u64,
            })
        };

        let rows = match test_id {
            Some(id) => stmt.query_map(params![id], map_row),
            None => stmt.query_map([], map_row),
        }
        .map_err(|e| SplitError::Persistence(format!("load events: {e}")))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|e| SplitError::Persistence(format!("read event row: {e}")))?);
        }
        Ok(events)
    }
}
