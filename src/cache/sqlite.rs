//! Durable cache backing on SQLite.
//!
//! The database lives at `~/.dealdesk/dealdesk.db`. WAL mode keeps reads
//! cheap while a background reconciliation writes. The schema is applied
//! idempotently on open; all timestamps are RFC 3339 TEXT.

use std::path::PathBuf;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{CacheBacking, CacheEntry, CacheError, SnapshotRow};
use crate::types::{Direction, EngagementKind, EngagementRecord, SuggestionRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
);

CREATE TABLE IF NOT EXISTS pipeline_snapshot (
    slot INTEGER PRIMARY KEY CHECK (slot = 0),
    data TEXT NOT NULL,
    last_fetched TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS engagements (
    id TEXT PRIMARY KEY,
    company_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    direction TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    subject TEXT,
    preview TEXT,
    participants TEXT
);

CREATE INDEX IF NOT EXISTS idx_engagements_company
    ON engagements (company_id, occurred_at);

CREATE TABLE IF NOT EXISTS suggestions (
    deal_id TEXT PRIMARY KEY,
    company_id TEXT NOT NULL,
    text TEXT NOT NULL,
    last_engagement_at_generation TEXT,
    generated_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

pub struct SqliteBacking {
    conn: Mutex<Connection>,
}

impl SqliteBacking {
    /// Open (or create) the database at `~/.dealdesk/dealdesk.db`.
    pub fn open() -> Result<Self, CacheError> {
        Self::open_at(Self::db_path()?)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(CacheError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL for concurrent read performance during background writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Resolve the default database path: `~/.dealdesk/dealdesk.db`.
    fn db_path() -> Result<PathBuf, CacheError> {
        let home = dirs::home_dir().ok_or(CacheError::HomeDirNotFound)?;
        Ok(home.join(".dealdesk").join("dealdesk.db"))
    }

    /// Execute a closure within a transaction.
    /// Commits on Ok, rolls back on Err.
    fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(val) => {
                conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}

fn row_to_engagement(row: &rusqlite::Row<'_>) -> rusqlite::Result<EngagementRecord> {
    let kind: String = row.get(2)?;
    let direction: String = row.get(3)?;
    Ok(EngagementRecord {
        id: row.get(0)?,
        company_id: row.get(1)?,
        // Unknown stored labels degrade to the least specific values rather
        // than failing the read.
        kind: EngagementKind::parse(&kind).unwrap_or(EngagementKind::Note),
        direction: Direction::parse(&direction).unwrap_or(Direction::None),
        occurred_at: row.get(4)?,
        subject: row.get(5)?,
        preview: row.get(6)?,
        participants: row.get(7)?,
    })
}

impl CacheBacking for SqliteBacking {
    fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT value, cached_at FROM cache_entries
                 WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| {
                    Ok(CacheEntry {
                        value: row.get(0)?,
                        cached_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    fn put_entry(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        cached_at: &str,
    ) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cache_entries (namespace, key, value, cached_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                cached_at = excluded.cached_at",
            params![namespace, key, value, cached_at],
        )?;
        Ok(())
    }

    fn clear_namespace(&self, namespace: &str) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM cache_entries WHERE namespace = ?1",
            params![namespace],
        )?;
        Ok(())
    }

    fn get_snapshot(&self) -> Result<Option<SnapshotRow>, CacheError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT data, last_fetched FROM pipeline_snapshot WHERE slot = 0",
                [],
                |row| {
                    Ok(SnapshotRow {
                        data: row.get(0)?,
                        last_fetched: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn replace_snapshot(&self, data: &str, last_fetched: &str) -> Result<(), CacheError> {
        // Delete-then-insert in one transaction: only the most recent
        // snapshot is ever kept, and readers never see a half-written slot.
        self.with_transaction(|conn| {
            conn.execute("DELETE FROM pipeline_snapshot", [])?;
            conn.execute(
                "INSERT INTO pipeline_snapshot (slot, data, last_fetched)
                 VALUES (0, ?1, ?2)",
                params![data, last_fetched],
            )?;
            Ok(())
        })
    }

    fn clear_snapshot(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM pipeline_snapshot", [])?;
        Ok(())
    }

    fn upsert_engagement(&self, record: &EngagementRecord) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO engagements
                (id, company_id, kind, direction, occurred_at, subject, preview, participants)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                company_id = excluded.company_id,
                kind = excluded.kind,
                direction = excluded.direction,
                occurred_at = excluded.occurred_at,
                subject = excluded.subject,
                preview = excluded.preview,
                participants = excluded.participants",
            params![
                record.id,
                record.company_id,
                record.kind.as_str(),
                record.direction.as_str(),
                record.occurred_at,
                record.subject,
                record.preview,
                record.participants,
            ],
        )?;
        Ok(())
    }

    fn latest_engagement_at(&self, company_id: &str) -> Result<Option<String>, CacheError> {
        let conn = self.conn.lock();
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(occurred_at) FROM engagements WHERE company_id = ?1",
            params![company_id],
            |row| row.get(0),
        )?;
        Ok(latest)
    }

    fn engagements_for(
        &self,
        company_id: &str,
        limit: usize,
    ) -> Result<Vec<EngagementRecord>, CacheError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, company_id, kind, direction, occurred_at, subject, preview, participants
             FROM engagements
             WHERE company_id = ?1
             ORDER BY occurred_at DESC
             LIMIT ?2",
        )?;
        let mapped = stmt.query_map(params![company_id, limit as i64], row_to_engagement)?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        Ok(rows)
    }

    fn get_suggestion(&self, deal_id: &str) -> Result<Option<SuggestionRecord>, CacheError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT deal_id, company_id, text, last_engagement_at_generation,
                        generated_at, updated_at
                 FROM suggestions WHERE deal_id = ?1",
                params![deal_id],
                |row| {
                    Ok(SuggestionRecord {
                        deal_id: row.get(0)?,
                        company_id: row.get(1)?,
                        text: row.get(2)?,
                        last_engagement_at_generation: row.get(3)?,
                        generated_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn put_suggestion(&self, record: &SuggestionRecord) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO suggestions
                (deal_id, company_id, text, last_engagement_at_generation,
                 generated_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(deal_id) DO UPDATE SET
                company_id = excluded.company_id,
                text = excluded.text,
                last_engagement_at_generation = excluded.last_engagement_at_generation,
                generated_at = excluded.generated_at,
                updated_at = excluded.updated_at",
            params![
                record.deal_id,
                record.company_id,
                record.text,
                record.last_engagement_at_generation,
                record.generated_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::sqlite_backing;
    use super::super::CacheBacking;

    #[test]
    fn test_idempotent_schema_application() {
        // Opening the same DB twice should not error (IF NOT EXISTS)
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("idempotent.db");

        let _b1 = super::SqliteBacking::open_at(path.clone()).expect("first open");
        let _b2 = super::SqliteBacking::open_at(path).expect("second open should not fail");
    }

    #[test]
    fn test_snapshot_slot_holds_exactly_one_row() {
        let backing = sqlite_backing();
        backing
            .replace_snapshot("[1]", "2026-03-01T10:00:00+00:00")
            .expect("first replace");
        backing
            .replace_snapshot("[2]", "2026-03-02T10:00:00+00:00")
            .expect("second replace");

        let count: i64 = backing
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM pipeline_snapshot", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1, "replace must supersede all prior snapshots");

        let row = backing.get_snapshot().expect("get").unwrap();
        assert_eq!(row.data, "[2]");
    }
}
