//! Durable sync queue repository

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{FieldChanges, QueuedChange, SyncPriority};
use crate::util::{version_from_sql, version_to_sql};

/// Trait for the durable copy of the sync queue
pub trait QueueRepository {
    /// Insert or replace a queued change at sequence `seq`
    fn upsert(&self, change: &QueuedChange, seq: u64) -> Result<()>;

    /// All queued changes in `(priority, seq)` order with their sequence numbers
    fn list(&self) -> Result<Vec<(QueuedChange, u64)>>;

    fn remove(&self, change_id: &str) -> Result<bool>;

    /// Record a failed transmission attempt
    fn record_failure(&self, change_id: &str, error: &str) -> Result<()>;

    /// Retarget queued changes from a temporary ID to its permanent ID
    fn rekey(&self, old_id: &str, new_id: &str) -> Result<usize>;

    /// Highest sequence number in use
    fn max_seq(&self) -> Result<u64>;

    fn count(&self) -> Result<usize>;

    fn clear(&self) -> Result<()>;
}

/// `SQLite` implementation of `QueueRepository`
pub struct SqliteQueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteQueueRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<(QueuedChange, u64)> {
        let delta: String = row.get(3)?;
        let delta: FieldChanges = serde_json::from_str(&delta).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(error))
        })?;
        let change = QueuedChange {
            change_id: row.get(0)?,
            form_id: row.get(1)?,
            form_type: row.get(2)?,
            delta,
            priority: SyncPriority::from_rank(row.get(4)?),
            enqueued_at: row.get(5)?,
            version: version_from_sql(row.get(7)?),
            retries: row.get(8)?,
            last_error: row.get(9)?,
        };
        Ok((change, version_from_sql(row.get(6)?)))
    }
}

impl QueueRepository for SqliteQueueRepository<'_> {
    fn upsert(&self, change: &QueuedChange, seq: u64) -> Result<()> {
        let delta = serde_json::to_string(&change.delta)?;
        self.conn.execute(
            "INSERT INTO sync_queue
                (change_id, form_id, form_type, delta, priority, enqueued_at, seq, version, retries, last_error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(change_id) DO UPDATE SET
                delta = excluded.delta,
                priority = excluded.priority,
                version = excluded.version,
                retries = excluded.retries,
                last_error = excluded.last_error",
            params![
                change.change_id,
                change.form_id,
                change.form_type,
                delta,
                change.priority.rank(),
                change.enqueued_at,
                version_to_sql(seq),
                version_to_sql(change.version),
                change.retries,
                change.last_error,
            ],
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<(QueuedChange, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT change_id, form_id, form_type, delta, priority, enqueued_at, seq, version, retries, last_error
             FROM sync_queue
             ORDER BY priority ASC, seq ASC",
        )?;
        let changes = stmt
            .query_map([], Self::parse_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    fn remove(&self, change_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM sync_queue WHERE change_id = ?", params![change_id])?;
        Ok(rows > 0)
    }

    fn record_failure(&self, change_id: &str, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_queue SET retries = retries + 1, last_error = ? WHERE change_id = ?",
            params![error, change_id],
        )?;
        Ok(())
    }

    fn rekey(&self, old_id: &str, new_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE sync_queue SET form_id = ? WHERE form_id = ?",
            params![new_id, old_id],
        )?;
        Ok(rows)
    }

    fn max_seq(&self) -> Result<u64> {
        let seq: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM sync_queue", [], |row| {
                row.get(0)
            })?;
        Ok(version_from_sql(seq))
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM sync_queue", [])?;
        Ok(())
    }
}
