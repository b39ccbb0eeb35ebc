//! Migration command implementation

use anyhow::{Context, Result};
use coffer::migration::MigrationManager;
use coffer::{MigrationPolicy, SchemaCatalog};
use std::path::PathBuf;
use std::sync::Arc;

pub fn execute(store_path: PathBuf, schemas: PathBuf, dry_run: bool, in_place: bool) -> Result<()> {
    tracing::info!("Loading schemas from: {}", schemas.display());

    if !schemas.exists() {
        anyhow::bail!("Schema directory does not exist: {}", schemas.display());
    }
    let catalog = SchemaCatalog::load_dir(&schemas).context("Failed to load schemas")?;
    let manager = MigrationManager::new(Arc::new(catalog));

    let policy = if in_place {
        MigrationPolicy::Automatic
    } else {
        MigrationPolicy::Explicit
    };
    let descriptor = super::descriptor_for(&store_path).with_migration_policy(policy);

    let pending = manager
        .pending(&descriptor)
        .context("Failed to plan migrations")?;
    if pending.is_empty() {
        println!("✓ Store is already at the latest schema version");
        return Ok(());
    }

    if dry_run {
        println!("\nDry run - steps that would be applied:");
        for version in &pending {
            println!("  -> v{}", version);
        }
        return Ok(());
    }

    let report = manager.migrate(&descriptor).context("Migration failed")?;
    println!(
        "\n✓ Migrated {} from v{} to v{} ({} step(s))",
        store_path.display(),
        report.from,
        report.to,
        report.steps.len()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer::{attrs, Coordinator, CoordinatorConfig, StoreDescriptor};

    fn write_schemas(dir: &std::path::Path) {
        std::fs::write(
            dir.join("v1.schema.json"),
            r#"{"version": 1, "entities": {"Note": {"attributes": {"title": {"kind": "text"}}}}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("v2.schema.json"),
            r#"{"version": 2, "entities": {"Note": {"attributes": {
                "title": {"kind": "text"},
                "archived": {"kind": "bool", "default": {"type": "bool", "value": false}}}}}}"#,
        )
        .unwrap();
    }

    #[test]
    fn test_dry_run_then_migrate() {
        let temp_dir = tempfile::tempdir().unwrap();
        let schemas = temp_dir.path().join("schemas");
        std::fs::create_dir(&schemas).unwrap();
        write_schemas(&schemas);

        let store = temp_dir.path().join("Default.sqlite");
        {
            let v1 = SchemaCatalog::load_dir(&schemas).unwrap().model(1).unwrap().clone();
            let catalog = SchemaCatalog::single(v1);
            let coordinator = Coordinator::open(
                CoordinatorConfig::new(vec![StoreDescriptor::on_disk(&store, "Default")]),
                catalog,
            )
            .unwrap();
            coordinator
                .edit_sync(|ctx| {
                    ctx.insert("Note", attrs! { "title" => "hello" })?;
                    Ok(())
                })
                .unwrap();
            coordinator.shutdown();
        }

        execute(store.clone(), schemas.clone(), true, false).unwrap();
        assert_eq!(coffer_sqlite::read_metadata(&store).unwrap().schema_version, 1);

        execute(store.clone(), schemas, false, false).unwrap();
        assert_eq!(coffer_sqlite::read_metadata(&store).unwrap().schema_version, 2);
    }
}
