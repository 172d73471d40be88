//! Conflict audit log repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use std::str::FromStr;

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::ConflictRecord;
use crate::util::{version_from_sql, version_to_sql};

/// Trait for conflict audit storage
pub trait ConflictRepository {
    /// Append a conflict, returning its row ID
    fn insert(&self, record: &ConflictRecord) -> Result<i64>;

    /// Most recent conflicts first
    fn list(&self, limit: usize) -> Result<Vec<ConflictRecord>>;

    /// Conflicts recorded for one entity, most recent first
    fn list_for(&self, table: &str, entity_id: &str) -> Result<Vec<ConflictRecord>>;
}

/// `SQLite` implementation of `ConflictRepository`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictRecord> {
        Ok(ConflictRecord {
            id: row.get(0)?,
            table: row.get(1)?,
            entity_id: row.get(2)?,
            kind: parse_text(3, &row.get::<_, String>(3)?)?,
            resolution: parse_text(4, &row.get::<_, String>(4)?)?,
            local_version: version_from_sql(row.get(5)?),
            server_version: version_from_sql(row.get(6)?),
            local_checksum: row.get(7)?,
            server_checksum: row.get(8)?,
            resolved_at: row.get(9)?,
        })
    }
}

fn parse_text<T>(index: usize, value: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = crate::Error>,
{
    value.parse().map_err(|error: crate::Error| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(error))
    })
}

const SELECT_COLUMNS: &str = "SELECT id, table_name, entity_id, kind, resolution, local_version, server_version,
        local_checksum, server_checksum, resolved_at
 FROM sync_conflicts";

impl ConflictRepository for SqliteConflictRepository<'_> {
    fn insert(&self, record: &ConflictRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_conflicts
                (table_name, entity_id, kind, resolution, local_version, server_version,
                 local_checksum, server_checksum, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.table,
                record.entity_id,
                record.kind.as_str(),
                record.resolution.as_str(),
                version_to_sql(record.local_version),
                version_to_sql(record.server_version),
                record.local_checksum,
                record.server_checksum,
                record.resolved_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COLUMNS} ORDER BY resolved_at DESC, id DESC LIMIT ?"
        ))?;
        let records = stmt
            .query_map(params![limit as i64], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn list_for(&self, table: &str, entity_id: &str) -> Result<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE table_name = ? AND entity_id = ? ORDER BY resolved_at DESC, id DESC"
        ))?;
        let records = stmt
            .query_map(params![table, entity_id], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
