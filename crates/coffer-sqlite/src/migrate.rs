//! Physical halves of schema migration
//!
//! `copy_mapped` writes a migrated copy of a store into a fresh file, which
//! the coordinator later swaps in. `migrate_in_place` rewrites a store
//! inside one transaction for stores that opt into automatic migration.

use coffer_core::{
    codec::ValueCodec,
    error::{CofferError, Result},
    schema::MappingModel,
    types::StoreMetadata,
};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use tracing::debug;

use crate::schema;
use crate::store::{insert_object, load_all};

/// Counts from one mapped copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub objects_copied: usize,
    pub objects_dropped: usize,
    pub history_rows: usize,
}

/// Migrate the store at `source` into a new store at `destination`.
///
/// The destination keeps the source's identity, key allocator and history
/// tokens so identities and cursors stay valid across the swap. It is
/// written with a rollback journal so a finished copy is a single file.
pub fn copy_mapped(
    source: &Path,
    destination: &Path,
    mapping: &MappingModel,
    codec: &dyn ValueCodec,
) -> Result<CopyStats> {
    let step_err = |reason: String| CofferError::MigrationStep {
        from: mapping.source_version,
        to: mapping.destination_version,
        reason,
    };

    let src = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_WRITE)
        .map_err(|e| step_err(e.to_string()))?;
    let meta = schema::read_meta(&src)?;
    if meta.schema_version != mapping.source_version {
        return Err(step_err(format!(
            "store is at v{}, mapping starts at v{}",
            meta.schema_version, mapping.source_version
        )));
    }

    let mut dest = Connection::open(destination).map_err(|e| step_err(e.to_string()))?;
    dest.pragma_update(None, "journal_mode", "DELETE")
        .map_err(|e| step_err(e.to_string()))?;

    let tx = dest.transaction().map_err(|e| step_err(e.to_string()))?;
    let seed = StoreMetadata {
        schema_version: mapping.destination_version,
        updated_at: chrono::Utc::now().to_rfc3339(),
        ..meta.clone()
    };
    schema::init_schema(&tx, &seed)?;

    let mut stats = CopyStats::default();
    for object in load_all(&src, &meta.store_identity, codec)? {
        match mapping.apply(&object) {
            Some(migrated) => {
                insert_object(&tx, &migrated, codec)?;
                stats.objects_copied += 1;
            }
            None => stats.objects_dropped += 1,
        }
    }

    stats.history_rows = copy_history(&src, &tx, mapping)?;
    tx.commit().map_err(|e| step_err(e.to_string()))?;

    debug!(
        "Copied {} objects ({} dropped) from v{} to v{}",
        stats.objects_copied,
        stats.objects_dropped,
        mapping.source_version,
        mapping.destination_version
    );
    Ok(stats)
}

/// Rewrite the store at `path` into the mapping's destination version in
/// a single transaction.
pub fn migrate_in_place(path: &Path, mapping: &MappingModel, codec: &dyn ValueCodec) -> Result<CopyStats> {
    let mut conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
        .map_err(|e| CofferError::Store(e.to_string()))?;
    let meta = schema::read_meta(&conn)?;
    if meta.schema_version != mapping.source_version {
        return Err(CofferError::MigrationStep {
            from: mapping.source_version,
            to: mapping.destination_version,
            reason: format!("store is at v{}", meta.schema_version),
        });
    }

    let tx = conn
        .transaction()
        .map_err(|e| CofferError::Store(e.to_string()))?;

    let objects = load_all(&tx, &meta.store_identity, codec)?;
    tx.execute("DELETE FROM objects", [])
        .map_err(|e| CofferError::Store(e.to_string()))?;

    let mut stats = CopyStats::default();
    for object in &objects {
        match mapping.apply(object) {
            Some(migrated) => {
                insert_object(&tx, &migrated, codec)?;
                stats.objects_copied += 1;
            }
            None => stats.objects_dropped += 1,
        }
    }

    stats.history_rows = rename_history(&tx, mapping)?;
    schema::set_schema_version(&tx, mapping.destination_version)?;
    tx.commit().map_err(|e| CofferError::Store(e.to_string()))?;
    Ok(stats)
}

fn copy_history(src: &Connection, dest: &Connection, mapping: &MappingModel) -> Result<usize> {
    let store_err = |e: rusqlite::Error| CofferError::Store(e.to_string());
    let renames = mapping.entity_renames();

    let mut stmt = src
        .prepare("SELECT token, author, created_at FROM history ORDER BY token")
        .map_err(store_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(store_err)?;
    let mut copied = 0;
    for row in rows {
        let (token, author, created_at) = row.map_err(store_err)?;
        dest.execute(
            "INSERT INTO history (token, author, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![token, author, created_at],
        )
        .map_err(store_err)?;
        copied += 1;
    }

    let mut stmt = src
        .prepare("SELECT token, entity, key, kind FROM history_changes ORDER BY rowid")
        .map_err(store_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(store_err)?;
    for row in rows {
        let (token, entity, key, kind) = row.map_err(store_err)?;
        // Changes to entities that no longer exist are dropped.
        let Some(entity) = renames.get(&entity) else {
            continue;
        };
        dest.execute(
            "INSERT INTO history_changes (token, entity, key, kind) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![token, entity, key, kind],
        )
        .map_err(store_err)?;
    }

    // Keep the token sequence from going backwards when the newest
    // history rows had already been pruned.
    let seq: Option<i64> = src
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = 'history'",
            [],
            |row| row.get(0),
        )
        .ok();
    if let Some(seq) = seq {
        dest.execute("DELETE FROM sqlite_sequence WHERE name = 'history'", [])
            .map_err(store_err)?;
        dest.execute(
            "INSERT INTO sqlite_sequence (name, seq) VALUES ('history', ?1)",
            [seq],
        )
        .map_err(store_err)?;
    }

    Ok(copied)
}

fn rename_history(conn: &Connection, mapping: &MappingModel) -> Result<usize> {
    let store_err = |e: rusqlite::Error| CofferError::Store(e.to_string());
    let renames = mapping.entity_renames();

    let entities: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT DISTINCT entity FROM history_changes")
            .map_err(store_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(store_err)?;
        rows.collect::<rusqlite::Result<_>>().map_err(store_err)?
    };

    let mut touched = 0;
    for entity in entities {
        touched += match renames.get(&entity) {
            Some(dest) if dest != &entity => conn
                .execute(
                    "UPDATE history_changes SET entity = ?1 WHERE entity = ?2",
                    [dest, &entity],
                )
                .map_err(store_err)?,
            Some(_) => 0,
            None => conn
                .execute("DELETE FROM history_changes WHERE entity = ?1", [&entity])
                .map_err(store_err)?,
        };
    }
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{read_metadata, SqliteObjectStore};
    use coffer_core::attrs;
    use coffer_core::codec::JsonCodec;
    use coffer_core::config::StoreDescriptor;
    use coffer_core::schema::{AttributeKind, AttributeSchema, EntitySchema, SchemaModel};
    use coffer_core::traits::{AttributeFilter, ObjectStore};
    use coffer_core::types::{ObjectId, StoreCommit, StoreIdentity, StoredObject, Value};
    use tempfile::TempDir;

    fn v1() -> SchemaModel {
        SchemaModel::new(1).with_entity(
            "Note",
            EntitySchema::new()
                .with_attribute("title", AttributeSchema::required(AttributeKind::Text)),
        )
    }

    fn v2() -> SchemaModel {
        SchemaModel::new(2).with_entity(
            "Note",
            EntitySchema::new()
                .with_attribute("title", AttributeSchema::required(AttributeKind::Text))
                .with_attribute(
                    "archived",
                    AttributeSchema::required(AttributeKind::Bool).with_default(false),
                ),
        )
    }

    fn seed(dir: &TempDir) -> (StoreIdentity, ObjectId) {
        let desc = StoreDescriptor::on_disk(dir.path().join("notes.sqlite"), "Default");
        let store = SqliteObjectStore::open(desc, 1, 1).unwrap();
        let id = ObjectId::new(store.identity(), "Note", store.allocate_keys(1).unwrap());
        let mut commit = StoreCommit::new("test");
        commit
            .inserts
            .push(StoredObject::new(id.clone(), attrs! { "title" => "hello" }, 1));
        store.commit(commit).unwrap();
        store.close().unwrap();
        (store.identity(), id)
    }

    #[test]
    fn test_copy_mapped_preserves_identity_and_history() {
        let dir = TempDir::new().unwrap();
        let (identity, id) = seed(&dir);
        let source = dir.path().join("notes.sqlite");
        let dest = dir.path().join("notesTemp.sqlite");

        let mapping = MappingModel::infer(&v1(), &v2()).unwrap();
        let stats = copy_mapped(&source, &dest, &mapping, &JsonCodec).unwrap();
        assert_eq!(stats.objects_copied, 1);
        assert_eq!(stats.history_rows, 1);

        let meta = read_metadata(&dest).unwrap();
        assert_eq!(meta.store_identity, identity);
        assert_eq!(meta.schema_version, 2);
        // Source is untouched.
        assert_eq!(read_metadata(&source).unwrap().schema_version, 1);

        let desc = StoreDescriptor::on_disk(&dest, "Default");
        let migrated = SqliteObjectStore::open(desc, 2, 1).unwrap();
        let note = migrated.load(&id).unwrap().unwrap();
        assert_eq!(note.get("archived"), Some(&Value::Bool(false)));
        assert_eq!(note.schema_version, 2);
        assert_eq!(migrated.history_after(None).unwrap().len(), 1);
    }

    #[test]
    fn test_copy_rejects_version_mismatch() {
        let dir = TempDir::new().unwrap();
        seed(&dir);
        let v3 = SchemaModel { version: 3, ..v2() };
        let mapping = MappingModel::infer(&v2(), &v3).unwrap();
        let err = copy_mapped(
            &dir.path().join("notes.sqlite"),
            &dir.path().join("notesTemp.sqlite"),
            &mapping,
            &JsonCodec,
        )
        .unwrap_err();
        assert!(matches!(err, CofferError::MigrationStep { from: 2, to: 3, .. }));
    }

    #[test]
    fn test_in_place_migration() {
        let dir = TempDir::new().unwrap();
        let (_, id) = seed(&dir);
        let path = dir.path().join("notes.sqlite");

        let mapping = MappingModel::infer(&v1(), &v2()).unwrap();
        migrate_in_place(&path, &mapping, &JsonCodec).unwrap();
        assert_eq!(read_metadata(&path).unwrap().schema_version, 2);

        let store =
            SqliteObjectStore::open(StoreDescriptor::on_disk(&path, "Default"), 2, 1).unwrap();
        let notes = store.fetch("Note", &AttributeFilter::All).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, id);
        assert_eq!(notes[0].get("archived"), Some(&Value::Bool(false)));
    }
}
