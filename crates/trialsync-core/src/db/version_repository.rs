//! Version/checksum repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::VersionRecord;
use crate::util::{version_from_sql, version_to_sql};

/// Trait for version record storage
pub trait VersionRepository {
    fn get(&self, table: &str, id: &str) -> Result<Option<VersionRecord>>;

    /// Store `record`. A lower version never replaces a higher one.
    fn put(&self, table: &str, id: &str, record: &VersionRecord) -> Result<()>;

    fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// Move the record of `old_id` to `new_id`
    fn rekey(&self, table: &str, old_id: &str, new_id: &str) -> Result<()>;
}

/// `SQLite` implementation of `VersionRepository`
pub struct SqliteVersionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteVersionRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl VersionRepository for SqliteVersionRepository<'_> {
    fn get(&self, table: &str, id: &str) -> Result<Option<VersionRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT version, checksum, timestamp, device_id FROM _versions WHERE id = ?",
                params![VersionRecord::key(table, id)],
                |row| {
                    Ok(VersionRecord {
                        version: version_from_sql(row.get(0)?),
                        checksum: row.get(1)?,
                        timestamp: row.get(2)?,
                        device_id: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn put(&self, table: &str, id: &str, record: &VersionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO _versions (id, table_name, entity_id, version, checksum, timestamp, device_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                checksum = excluded.checksum,
                timestamp = excluded.timestamp,
                device_id = excluded.device_id
             WHERE excluded.version >= _versions.version",
            params![
                VersionRecord::key(table, id),
                table,
                id,
                version_to_sql(record.version),
                record.checksum,
                record.timestamp,
                record.device_id,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM _versions WHERE id = ?",
            params![VersionRecord::key(table, id)],
        )?;
        Ok(())
    }

    fn rekey(&self, table: &str, old_id: &str, new_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE _versions SET id = ?, entity_id = ? WHERE id = ?",
            params![VersionRecord::key(table, new_id), new_id, VersionRecord::key(table, old_id)],
        )?;
        Ok(())
    }
}
