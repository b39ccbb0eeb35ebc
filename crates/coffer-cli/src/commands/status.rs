//! Status command implementation

use anyhow::{Context, Result};
use coffer::migration::MigrationManager;
use coffer::{ObjectStore, SchemaCatalog, SqliteObjectStore};
use std::path::PathBuf;
use std::sync::Arc;

pub fn execute(store_path: PathBuf, schemas: Option<PathBuf>) -> Result<()> {
    tracing::info!("Checking store status: {}", store_path.display());

    if !store_path.exists() {
        anyhow::bail!("Store does not exist: {}", store_path.display());
    }

    let meta = coffer_sqlite::read_metadata(&store_path).context("Failed to read store metadata")?;

    println!("\nStore Status");
    println!("{}", "=".repeat(60));
    println!("Path: {}", store_path.display());
    println!("Identity: {}", meta.store_identity);
    println!("Schema Version: {}", meta.schema_version);
    println!("Next Key: {}", meta.next_key);
    println!("Created: {}", meta.created_at);
    println!("Updated: {}", meta.updated_at);

    let descriptor = super::descriptor_for(&store_path).with_read_only(true);
    let store = SqliteObjectStore::open(descriptor.clone(), meta.schema_version, 1)
        .context("Failed to open store")?;
    let history = store.history_after(None).context("Failed to read history")?;
    println!("\nHistory:");
    println!("  Transactions: {}", history.len());
    if let Some(last) = history.last() {
        println!("  Latest Token: {}", last.token);
        println!("  Latest Author: {}", last.author);
    }
    store.close()?;

    if let Some(dir) = schemas {
        let catalog = SchemaCatalog::load_dir(&dir)
            .with_context(|| format!("Failed to load schemas from {}", dir.display()))?;
        let pending = MigrationManager::new(Arc::new(catalog))
            .pending(&descriptor)
            .context("Failed to plan migrations")?;
        if pending.is_empty() {
            println!("\n✓ Store is at the latest schema version");
        } else {
            println!("\n⚠️  {} migration step(s) pending: {:?}", pending.len(), pending);
            println!("Run 'coffer migrate' to apply them");
        }
    }

    Ok(())
}
