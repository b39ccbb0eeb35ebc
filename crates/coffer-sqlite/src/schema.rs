use coffer_core::error::{CofferError, Result};
use coffer_core::types::{StoreIdentity, StoreMetadata};
use rusqlite::{Connection, OptionalExtension};

/// Create the store tables if needed and seed metadata for a new store.
///
/// `seed` is only written when the store has no metadata row yet.
pub fn init_schema(conn: &Connection, seed: &StoreMetadata) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_meta (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            store_identity TEXT NOT NULL,
            schema_version INTEGER NOT NULL,
            next_key INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS objects (
            entity TEXT NOT NULL,
            key INTEGER NOT NULL,
            schema_version INTEGER NOT NULL,
            attributes BLOB NOT NULL,
            PRIMARY KEY (entity, key)
        );
        CREATE TABLE IF NOT EXISTS history (
            token INTEGER PRIMARY KEY AUTOINCREMENT,
            author TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS history_changes (
            token INTEGER NOT NULL,
            entity TEXT NOT NULL,
            key INTEGER NOT NULL,
            kind TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS history_changes_token ON history_changes(token);",
    )
    .map_err(|e| CofferError::Store(e.to_string()))?;

    conn.execute(
        "INSERT OR IGNORE INTO store_meta
            (id, store_identity, schema_version, next_key, created_at, updated_at)
         VALUES (0, ?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            seed.store_identity.as_str(),
            seed.schema_version as i64,
            seed.next_key as i64,
            seed.created_at,
            seed.updated_at,
        ],
    )
    .map_err(|e| CofferError::Store(e.to_string()))?;

    Ok(())
}

/// Read the metadata row. A database without one is not a coffer store.
pub fn read_meta(conn: &Connection) -> Result<StoreMetadata> {
    let row = conn
        .query_row(
            "SELECT store_identity, schema_version, next_key, created_at, updated_at
             FROM store_meta WHERE id = 0",
            [],
            |row| {
                Ok(StoreMetadata {
                    store_identity: StoreIdentity::new(row.get::<_, String>(0)?),
                    schema_version: row.get::<_, i64>(1)? as u32,
                    next_key: row.get::<_, i64>(2)? as u64,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| CofferError::UnknownSchema(format!("Unreadable store metadata: {e}")))?;

    row.ok_or_else(|| CofferError::UnknownSchema("Store has no metadata".into()))
}

/// Update the schema version in metadata
pub fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "UPDATE store_meta SET schema_version = ?1, updated_at = ?2 WHERE id = 0",
        rusqlite::params![version as i64, chrono::Utc::now().to_rfc3339()],
    )
    .map_err(|e| CofferError::Store(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_keeps_identity() {
        let conn = Connection::open_in_memory().unwrap();
        let first = StoreMetadata::new(2);
        init_schema(&conn, &first).unwrap();
        init_schema(&conn, &StoreMetadata::new(5)).unwrap();

        let meta = read_meta(&conn).unwrap();
        assert_eq!(meta.store_identity, first.store_identity);
        assert_eq!(meta.schema_version, 2);

        set_schema_version(&conn, 3).unwrap();
        assert_eq!(read_meta(&conn).unwrap().schema_version, 3);
    }

    #[test]
    fn test_foreign_database_is_unknown_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users (id INTEGER)").unwrap();
        assert!(matches!(read_meta(&conn), Err(CofferError::UnknownSchema(_))));
    }
}
