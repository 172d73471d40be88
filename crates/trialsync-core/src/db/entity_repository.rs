//! Entity repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{EntityMetadata, EntityRecord};
use crate::util::{now_millis, version_from_sql, version_to_sql};

/// Trait for entity storage operations
pub trait EntityRepository {
    /// Get an entity by type and ID
    fn get(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>>;

    /// Insert or fully replace an entity
    fn put(&self, record: &EntityRecord) -> Result<()>;

    /// Delete an entity, returning whether it existed
    fn delete(&self, entity_type: &str, id: &str) -> Result<bool>;

    /// List entities of one type, most recently updated first
    fn list(&self, entity_type: &str) -> Result<Vec<EntityRecord>>;

    /// List entities with unsynced changes
    fn list_dirty(&self) -> Result<Vec<EntityRecord>>;

    /// Move an entity to a new ID (temporary to permanent)
    fn rekey(&self, entity_type: &str, old_id: &str, new_id: &str) -> Result<()>;

    /// Rewrite a top-level reference field from `old_value` to `new_value`
    /// across every entity, returning the number of rows changed
    fn replace_reference(&self, field: &str, old_value: &str, new_value: &str) -> Result<usize>;
}

/// `SQLite` implementation of `EntityRepository`
pub struct SqliteEntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an entity from a database row
    fn parse_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
        let data: String = row.get(2)?;
        let data = serde_json::from_str(&data).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(error))
        })?;
        Ok(EntityRecord {
            entity_type: row.get(0)?,
            id: row.get(1)?,
            data,
            metadata: EntityMetadata {
                last_synced: row.get(3)?,
                is_dirty: row.get::<_, i32>(4)? != 0,
                version: version_from_sql(row.get(5)?),
            },
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT entity_type, id, data, last_synced, is_dirty, version FROM entities";

impl EntityRepository for SqliteEntityRepository<'_> {
    fn get(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE entity_type = ? AND id = ?"),
                params![entity_type, id],
                Self::parse_entity,
            )
            .optional()?;
        Ok(record)
    }

    fn put(&self, record: &EntityRecord) -> Result<()> {
        let data = serde_json::to_string(&record.data)?;
        self.conn.execute(
            "INSERT INTO entities (entity_type, id, data, last_synced, is_dirty, version, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(entity_type, id) DO UPDATE SET
                data = excluded.data,
                last_synced = excluded.last_synced,
                is_dirty = excluded.is_dirty,
                version = excluded.version,
                updated_at = excluded.updated_at",
            params![
                record.entity_type,
                record.id,
                data,
                record.metadata.last_synced,
                i32::from(record.metadata.is_dirty),
                version_to_sql(record.metadata.version),
                now_millis(),
            ],
        )?;
        Ok(())
    }

    fn delete(&self, entity_type: &str, id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM entities WHERE entity_type = ? AND id = ?",
            params![entity_type, id],
        )?;
        Ok(rows > 0)
    }

    fn list(&self, entity_type: &str) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE entity_type = ? ORDER BY updated_at DESC, id ASC"
        ))?;
        let records = stmt
            .query_map(params![entity_type], Self::parse_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn list_dirty(&self) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE is_dirty = 1 ORDER BY updated_at ASC"
        ))?;
        let records = stmt
            .query_map([], Self::parse_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn rekey(&self, entity_type: &str, old_id: &str, new_id: &str) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE entities SET id = ?, updated_at = ? WHERE entity_type = ? AND id = ?",
            params![new_id, now_millis(), entity_type, old_id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("{entity_type}/{old_id}")));
        }
        Ok(())
    }

    fn replace_reference(&self, field: &str, old_value: &str, new_value: &str) -> Result<usize> {
        if !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::InvalidPath(field.to_string()));
        }
        let json_path = format!("$.{field}");
        let rows = self.conn.execute(
            "UPDATE entities SET data = json_set(data, ?1, ?2), updated_at = ?3
             WHERE json_extract(data, ?1) = ?4",
            params![json_path, new_value, now_millis(), old_value],
        )?;
        Ok(rows)
    }
}
