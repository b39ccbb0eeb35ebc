//! Migration tests: version chains, explicit mappings, rollback and
//! recovery on open

use coffer::migration::{FileOps, MigrationManager, StdFileOps};
use coffer::prelude::*;
use coffer::{AttributeMapping, EntityMapping};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use tempfile::TempDir;

fn note(version: u32) -> EntitySchema {
    let mut note =
        EntitySchema::new().with_attribute("title", AttributeSchema::required(AttributeKind::Text));
    if version >= 2 {
        note = note.with_attribute(
            "archived",
            AttributeSchema::required(AttributeKind::Bool).with_default(false),
        );
    }
    if version >= 3 {
        note = note.with_attribute(
            "priority",
            AttributeSchema::required(AttributeKind::Int).with_default(3i64),
        );
    }
    note
}

fn catalog(versions: &[u32]) -> SchemaCatalog {
    versions.iter().fold(SchemaCatalog::new(), |catalog, &v| {
        catalog.with_version(SchemaModel::new(v).with_entity("Note", note(v)))
    })
}

fn descriptor(dir: &TempDir) -> StoreDescriptor {
    StoreDescriptor::local_data(dir.path(), "Default")
}

fn open(dir: &TempDir, catalog: SchemaCatalog) -> Result<Coordinator> {
    Coordinator::open(CoordinatorConfig::new(vec![descriptor(dir)]), catalog)
}

/// Create a v1 store holding one note and close it.
fn seed_v1(dir: &TempDir) -> ObjectId {
    let coordinator = open(dir, catalog(&[1])).unwrap();
    let id = coordinator
        .edit_sync(|ctx| {
            let note = ctx.insert("Note", attrs! { "title" => "before" })?;
            ctx.identity_of(note)
        })
        .unwrap();
    coordinator.shutdown();
    id
}

/// Fails every rename, delegates the rest.
struct FailingRename;

impl FileOps for FailingRename {
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        StdFileOps.copy(from, to)
    }

    fn rename(&self, _from: &Path, _to: &Path) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "disk full"))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        StdFileOps.remove(path)
    }
}

#[test]
fn test_open_runs_the_whole_chain() {
    let temp_dir = tempfile::tempdir().unwrap();
    let id = seed_v1(&temp_dir);

    let manager = MigrationManager::new(std::sync::Arc::new(catalog(&[1, 2, 3])));
    assert_eq!(manager.pending(&descriptor(&temp_dir)).unwrap(), vec![2, 3]);

    let coordinator = open(&temp_dir, catalog(&[1, 2, 3])).unwrap();
    assert_eq!(coordinator.schema_version(), 3);
    let store = coordinator.store_identities()[0].clone();
    assert_eq!(coordinator.metadata(&store).unwrap().schema_version, 3);
    assert_eq!(id.store(), &store);

    let (title, archived, priority) = coordinator
        .fetch_sync(|ctx| {
            let note = ctx.resolve(&id)?.expect("identity survives migration");
            Ok((
                ctx.attribute(note, "title")?,
                ctx.attribute(note, "archived")?,
                ctx.attribute(note, "priority")?,
            ))
        })
        .unwrap();
    assert_eq!(title, Value::from("before"));
    assert_eq!(archived, Value::Bool(false));
    assert_eq!(priority, Value::Int(3));
}

#[test]
fn test_failed_step_leaves_store_byte_identical() {
    let temp_dir = tempfile::tempdir().unwrap();
    let id = seed_v1(&temp_dir);
    let desc = descriptor(&temp_dir);
    let before = std::fs::read(&desc.location).unwrap();

    let manager = MigrationManager::new(std::sync::Arc::new(catalog(&[1, 2])))
        .with_file_ops(std::sync::Arc::new(FailingRename));
    let err = manager.migrate(&desc).unwrap_err();
    assert!(matches!(err, CofferError::MigrationStep { from: 1, to: 2, .. }));
    assert!(err.is_fatal_for_store());

    assert_eq!(std::fs::read(&desc.location).unwrap(), before);

    // Still usable at its old version
    let coordinator = open(&temp_dir, catalog(&[1])).unwrap();
    assert_eq!(coordinator.schema_version(), 1);
    assert!(coordinator
        .fetch_sync(|ctx| Ok(ctx.resolve(&id)?.is_some()))
        .unwrap());
}

#[test]
fn test_gap_in_versions_is_unknown_schema() {
    let temp_dir = tempfile::tempdir().unwrap();
    seed_v1(&temp_dir);
    let err = open(&temp_dir, catalog(&[1, 3])).err().unwrap();
    assert!(matches!(err, CofferError::UnknownSchema(_)));
}

#[test]
fn test_store_newer_than_program_is_rejected() {
    let temp_dir = tempfile::tempdir().unwrap();
    seed_v1(&temp_dir);
    open(&temp_dir, catalog(&[1, 2])).unwrap().shutdown();

    let err = open(&temp_dir, catalog(&[1])).err().unwrap();
    assert!(matches!(err, CofferError::UnknownSchema(_)));
}

#[test]
fn test_uninferable_step_fails_and_keeps_version() {
    let temp_dir = tempfile::tempdir().unwrap();
    seed_v1(&temp_dir);

    // title changes kind: cannot be inferred
    let v2 = SchemaModel::new(2).with_entity(
        "Note",
        EntitySchema::new().with_attribute("title", AttributeSchema::required(AttributeKind::Bool)),
    );
    let catalog = SchemaCatalog::new()
        .with_version(SchemaModel::new(1).with_entity("Note", note(1)))
        .with_version(v2);

    let err = open(&temp_dir, catalog).err().unwrap();
    assert!(matches!(err, CofferError::MigrationStep { from: 1, to: 2, .. }));
    assert!(open(&temp_dir, self::catalog(&[1])).is_ok());
}

#[test]
fn test_explicit_mapping_renames_entity() {
    let temp_dir = tempfile::tempdir().unwrap();
    let id = seed_v1(&temp_dir);

    let memo = EntitySchema::new()
        .with_attribute("heading", AttributeSchema::required(AttributeKind::Text))
        .with_attribute("pinned", AttributeSchema::required(AttributeKind::Bool));
    let base = SchemaCatalog::new()
        .with_version(SchemaModel::new(1).with_entity("Note", note(1)))
        .with_version(SchemaModel::new(2).with_entity("Memo", memo));

    let mapping = MappingModel {
        source_version: 1,
        destination_version: 2,
        entities: BTreeMap::from([(
            "Memo".to_string(),
            EntityMapping {
                source_entity: Some("Note".to_string()),
                attributes: BTreeMap::from([
                    (
                        "heading".to_string(),
                        AttributeMapping::Copy {
                            from: "title".to_string(),
                        },
                    ),
                    (
                        "pinned".to_string(),
                        AttributeMapping::Constant {
                            value: Value::Bool(true),
                        },
                    ),
                ]),
            },
        )]),
    };
    let coordinator = open(&temp_dir, base.with_mapping(mapping)).unwrap();

    let memo_id = id.with_entity("Memo");
    let (heading, pinned) = coordinator
        .fetch_sync(|ctx| {
            let memo = ctx.resolve(&memo_id)?.expect("renamed object keeps its key");
            Ok((ctx.attribute(memo, "heading")?, ctx.attribute(memo, "pinned")?))
        })
        .unwrap();
    assert_eq!(heading, Value::from("before"));
    assert_eq!(pinned, Value::Bool(true));
}

#[test]
fn test_automatic_policy() {
    let temp_dir = tempfile::tempdir().unwrap();
    let id = seed_v1(&temp_dir);

    let desc = descriptor(&temp_dir).with_migration_policy(MigrationPolicy::Automatic);
    let coordinator =
        Coordinator::open(CoordinatorConfig::new(vec![desc]), catalog(&[1, 2])).unwrap();
    let archived = coordinator
        .fetch_sync(|ctx| {
            let note = ctx.resolve(&id)?.expect("note survives");
            ctx.attribute(note, "archived")
        })
        .unwrap();
    assert_eq!(archived, Value::Bool(false));
}

#[test]
fn test_delete_on_open_failure_recreates_store() {
    let temp_dir = tempfile::tempdir().unwrap();
    let desc = descriptor(&temp_dir);
    std::fs::write(&desc.location, vec![0x5au8; 8192]).unwrap();

    assert!(open(&temp_dir, catalog(&[1])).is_err());

    let desc = desc.with_delete_on_open_failure(true);
    let coordinator =
        Coordinator::open(CoordinatorConfig::new(vec![desc]), catalog(&[1])).unwrap();
    let notes = coordinator
        .fetch_sync(|ctx| Ok(ctx.all("Note")?.len()))
        .unwrap();
    assert_eq!(notes, 0);
}

#[test]
fn test_read_only_store_rejects_edits() {
    let temp_dir = tempfile::tempdir().unwrap();
    let id = seed_v1(&temp_dir);

    let desc = descriptor(&temp_dir).with_read_only(true);
    let coordinator =
        Coordinator::open(CoordinatorConfig::new(vec![desc]), catalog(&[1])).unwrap();
    assert!(coordinator
        .fetch_sync(|ctx| Ok(ctx.resolve(&id)?.is_some()))
        .unwrap());

    let err = coordinator
        .edit_sync(|ctx| {
            ctx.insert("Note", attrs! { "title" => "nope" })?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, CofferError::ReadOnly(_)));
}
