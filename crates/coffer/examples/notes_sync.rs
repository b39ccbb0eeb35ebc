//! Example: local edits, a subscriber, and a write from another process
//! picked up through history reconciliation
//!
//! Run with: cargo run --example notes_sync

use coffer::prelude::*;
use tempfile::tempdir;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let temp_dir = tempdir()?;
    let schema = SchemaModel::new(1).with_entity(
        "Note",
        EntitySchema::new()
            .with_attribute("title", AttributeSchema::required(AttributeKind::Text))
            .with_attribute("body", AttributeSchema::optional(AttributeKind::Text)),
    );
    let config =
        CoordinatorConfig::new(vec![StoreDescriptor::local_data(temp_dir.path(), "Default")]);
    let coordinator = Coordinator::open(config, SchemaCatalog::single(schema))?;
    let mut notes = coordinator.subscribe(["Note"]);

    println!("\n=== Local edit ===");
    let id = coordinator
        .edit(|ctx| {
            let note = ctx.insert("Note", attrs! { "title" => "groceries" })?;
            ctx.identity_of(note)
        })
        .await?;
    if let Some(change) = notes.next().await {
        println!("Inserted: {:?}", change.inserted);
    }

    println!("\n=== Write from another process ===");
    let store = id.store().clone();
    let remote = coordinator.remote_writer(&store, "sync.phone")?;
    remote.update(&id, attrs! { "body" => "milk, eggs" })?;

    let outcome = coordinator.remote_change(store).await?;
    println!("Reconciled: {:?}", outcome);
    if let Some(change) = notes.next().await {
        println!("Updated: {:?}", change.updated);
    }

    let body = coordinator
        .fetch_with(id, |ctx, note| ctx.attribute(note, "body"))
        .await?;
    println!("Body is now: {:?}", body);

    coordinator.shutdown();
    Ok(())
}
