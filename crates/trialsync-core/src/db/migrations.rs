//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub(crate) const CURRENT_VERSION: i32 = 3;

const ENTITIES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS entities (
        entity_type TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        last_synced INTEGER,
        is_dirty INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (entity_type, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_entities_dirty ON entities(is_dirty)",
    "CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

const VERSIONS_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS _versions (
        id TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        device_id TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_versions_entity ON _versions(table_name, entity_id)",
];

const SYNC_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_queue (
        change_id TEXT PRIMARY KEY,
        form_id TEXT NOT NULL,
        form_type TEXT NOT NULL,
        delta TEXT NOT NULL,
        priority INTEGER NOT NULL,
        enqueued_at INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        retries INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(priority, seq)",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_form ON sync_queue(form_type, form_id)",
    "CREATE TABLE IF NOT EXISTS sync_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        resolution TEXT NOT NULL,
        local_version INTEGER NOT NULL,
        server_version INTEGER NOT NULL,
        local_checksum TEXT NOT NULL,
        server_checksum TEXT NOT NULL,
        resolved_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(table_name, entity_id)",
    "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC)",
];

/// Run all pending migrations
pub(crate) fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")?;
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, ENTITIES_SCHEMA)?;
    }
    if version < 2 {
        apply(conn, 2, VERSIONS_SCHEMA)?;
    }
    if version < 3 {
        apply(conn, 3, SYNC_SCHEMA)?;
    }

    Ok(())
}

/// Get the current schema version
pub(crate) fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for statement in statements {
        tx.execute_batch(statement)?;
    }
    tx.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Recreate auxiliary tables that are missing even though the recorded
/// schema version says they exist. Runs in one transaction and never touches
/// existing rows.
pub(crate) fn ensure_namespaces(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for statement in ENTITIES_SCHEMA
        .iter()
        .chain(VERSIONS_SCHEMA)
        .chain(SYNC_SCHEMA)
    {
        tx.execute_batch(statement)?;
    }
    tx.commit()?;

    tracing::warn!("Recreated missing storage namespaces");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
        for table in ["entities", "meta", "_versions", "sync_queue", "sync_conflicts"] {
            assert!(table_exists(&conn, table), "missing {table}");
        }
    }

    #[test]
    fn upgrade_from_v1_keeps_entities() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE schema_version (version INTEGER PRIMARY KEY)")
            .unwrap();
        apply(&conn, 1, ENTITIES_SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO entities (entity_type, id, data, updated_at) VALUES ('patient', 'p1', '{}', 0)",
            [],
        )
        .unwrap();

        run(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert!(table_exists(&conn, "_versions"));
    }

    #[test]
    fn ensure_namespaces_restores_dropped_table() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        conn.execute_batch("DROP TABLE _versions").unwrap();
        ensure_namespaces(&conn).unwrap();
        assert!(table_exists(&conn, "_versions"));
    }
}
