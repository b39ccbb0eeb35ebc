//! History command implementation

use anyhow::{Context, Result};
use coffer::{HistoryToken, ObjectStore, SqliteObjectStore};
use std::path::PathBuf;

pub fn execute(store_path: PathBuf, after: Option<u64>, json: bool) -> Result<()> {
    let meta = coffer_sqlite::read_metadata(&store_path).context("Failed to read store metadata")?;
    let descriptor = super::descriptor_for(&store_path).with_read_only(true);
    let store = SqliteObjectStore::open(descriptor, meta.schema_version, 1)
        .context("Failed to open store")?;

    let transactions = store
        .history_after(after.map(HistoryToken))
        .context("Failed to read history")?;
    store.close()?;

    if json {
        for transaction in &transactions {
            println!("{}", serde_json::to_string(transaction)?);
        }
        return Ok(());
    }

    if transactions.is_empty() {
        println!("No transactions recorded");
        return Ok(());
    }

    println!("\n{:<8} {:<26} {:<20} Changes", "Token", "Timestamp", "Author");
    println!("{}", "=".repeat(80));
    for transaction in &transactions {
        println!(
            "{:<8} {:<26} {:<20} {}",
            transaction.token,
            transaction.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            transaction.author,
            transaction.changes.len()
        );
        for change in &transaction.changes {
            println!("           {:?} {}", change.kind, change.id);
        }
    }
    println!("\nTotal: {} transaction(s)", transactions.len());

    Ok(())
}
