use coffer_core::{
    codec::{JsonCodec, ValueCodec},
    config::{StoreDescriptor, SynchronousMode},
    error::{CofferError, Result},
    traits::{AttributeFilter, ObjectStore},
    types::{
        ChangeKind, CommitInfo, HistoryChange, HistoryToken, HistoryTransaction, ObjectId,
        StoreCommit, StoreIdentity, StoreMetadata, StoredObject,
    },
};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::read_pool::SqliteReadPool;
use crate::schema;

/// SQLite-backed object store
///
/// One write connection guarded by a mutex plus a pool of read-only
/// connections. The database runs in WAL mode so fetches and history reads
/// never wait for a commit.
pub struct SqliteObjectStore {
    descriptor: StoreDescriptor,
    path: PathBuf,
    identity: StoreIdentity,
    conn: Mutex<Connection>,
    read_pool: SqliteReadPool,
    codec: Arc<dyn ValueCodec>,
}

impl SqliteObjectStore {
    /// Open (or create at `schema_version`) the store described by
    /// `descriptor`.
    pub fn open(descriptor: StoreDescriptor, schema_version: u32, read_pool_size: usize) -> Result<Self> {
        Self::open_with_codec(descriptor, schema_version, read_pool_size, Arc::new(JsonCodec))
    }

    pub fn open_with_codec(
        descriptor: StoreDescriptor,
        schema_version: u32,
        read_pool_size: usize,
        codec: Arc<dyn ValueCodec>,
    ) -> Result<Self> {
        let path = descriptor.location.clone();
        if descriptor.read_only && !path.exists() {
            return Err(CofferError::NotFound(format!(
                "Read-only store {} does not exist",
                path.display()
            )));
        }

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| CofferError::Store(e.to_string()))?;

        Self::configure_connection(&conn, &descriptor)?;

        if !descriptor.read_only {
            schema::init_schema(&conn, &StoreMetadata::new(schema_version))?;
        }
        let meta = schema::read_meta(&conn)?;

        let read_pool = SqliteReadPool::new(&path, read_pool_size)?;

        info!(
            "Opened store {} ({}) at schema v{}",
            descriptor.configuration_name,
            path.display(),
            meta.schema_version
        );

        Ok(Self {
            descriptor,
            path,
            identity: meta.store_identity,
            conn: Mutex::new(conn),
            read_pool,
            codec,
        })
    }

    /// Configure SQLite connection
    fn configure_connection(conn: &Connection, descriptor: &StoreDescriptor) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| CofferError::Store(e.to_string()))?;

        let sync_mode = match descriptor.synchronous() {
            SynchronousMode::Full => "FULL",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Off => "OFF",
        };
        conn.pragma_update(None, "synchronous", sync_mode)
            .map_err(|e| CofferError::Store(e.to_string()))?;

        if descriptor.read_only {
            conn.pragma_update(None, "query_only", "ON")
                .map_err(|e| CofferError::Store(e.to_string()))?;
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_pool(&self) -> &SqliteReadPool {
        &self.read_pool
    }

    fn read_only_error(&self) -> CofferError {
        CofferError::ReadOnly(self.descriptor.configuration_name.clone())
    }
}

impl ObjectStore for SqliteObjectStore {
    fn identity(&self) -> StoreIdentity {
        self.identity.clone()
    }

    fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    fn metadata(&self) -> Result<StoreMetadata> {
        let conn = self.read_pool.acquire();
        schema::read_meta(conn.connection())
    }

    fn load(&self, id: &ObjectId) -> Result<Option<StoredObject>> {
        if id.store() != &self.identity {
            return Ok(None);
        }
        let conn = self.read_pool.acquire();
        load_object(conn.connection(), id, self.codec.as_ref())
    }

    fn fetch(&self, entity: &str, filter: &AttributeFilter) -> Result<Vec<StoredObject>> {
        let conn = self.read_pool.acquire();
        let objects = load_entity(conn.connection(), &self.identity, entity, self.codec.as_ref())?;
        Ok(objects.into_iter().filter(|o| filter.matches(o)).collect())
    }

    fn allocate_keys(&self, count: u64) -> Result<u64> {
        if self.descriptor.read_only {
            return Err(self.read_only_error());
        }
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CofferError::Store(e.to_string()))?;
        let first: i64 = tx
            .query_row("SELECT next_key FROM store_meta WHERE id = 0", [], |row| {
                row.get(0)
            })
            .map_err(|e| CofferError::Store(e.to_string()))?;
        tx.execute(
            "UPDATE store_meta SET next_key = ?1 WHERE id = 0",
            [first + count as i64],
        )
        .map_err(|e| CofferError::Store(e.to_string()))?;
        tx.commit().map_err(|e| CofferError::Store(e.to_string()))?;
        Ok(first as u64)
    }

    fn commit(&self, commit: StoreCommit) -> Result<CommitInfo> {
        if self.descriptor.read_only {
            return Err(self.read_only_error());
        }
        let save_err = |e: rusqlite::Error| CofferError::Save(e.to_string());
        let codec = self.codec.as_ref();

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(save_err)?;

        let mut info = CommitInfo::default();
        let mut changes = Vec::new();

        for object in commit.inserts {
            if object.id.store() != &self.identity
                || load_object(&tx, &object.id, codec)?.is_some()
            {
                return Err(CofferError::Save(format!("{} already exists", object.id)));
            }
            insert_object(&tx, &object, codec)?;
            changes.push(HistoryChange {
                id: object.id.clone(),
                kind: ChangeKind::Insert,
            });
            info.objects.push(object);
            info.inserted += 1;
        }

        for update in commit.updates {
            let mut current = load_object(&tx, &update.id, codec)?
                .ok_or_else(|| CofferError::Save(format!("{} does not exist", update.id)))?;
            let before = current.attributes.clone();
            update.apply_to(&mut current.attributes);
            if current.attributes.len() != before.len()
                || current
                    .attributes
                    .iter()
                    .any(|(k, v)| before.get(k).map_or(true, |b| !b.same_as(v)))
            {
                info.changed.push(update.id.clone());
            }
            tx.execute(
                "UPDATE objects SET attributes = ?1 WHERE entity = ?2 AND key = ?3",
                rusqlite::params![
                    codec.encode_attributes(&current.attributes)?,
                    update.id.entity(),
                    update.id.key() as i64
                ],
            )
            .map_err(save_err)?;
            changes.push(HistoryChange {
                id: update.id,
                kind: ChangeKind::Update,
            });
            info.objects.push(current);
            info.updated += 1;
        }

        for id in commit.deletes {
            let removed = tx
                .execute(
                    "DELETE FROM objects WHERE entity = ?1 AND key = ?2",
                    rusqlite::params![id.entity(), id.key() as i64],
                )
                .map_err(save_err)?;
            if removed > 0 {
                changes.push(HistoryChange {
                    id,
                    kind: ChangeKind::Delete,
                });
                info.deleted += 1;
            }
        }

        let now = chrono::Utc::now();
        tx.execute(
            "UPDATE store_meta SET updated_at = ?1 WHERE id = 0",
            [now.to_rfc3339()],
        )
        .map_err(save_err)?;

        if self.descriptor.history_tracking() && !changes.is_empty() {
            tx.execute(
                "INSERT INTO history (author, created_at) VALUES (?1, ?2)",
                rusqlite::params![commit.author, now.to_rfc3339()],
            )
            .map_err(save_err)?;
            let token = tx.last_insert_rowid();
            for change in &changes {
                tx.execute(
                    "INSERT INTO history_changes (token, entity, key, kind) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        token,
                        change.id.entity(),
                        change.id.key() as i64,
                        change.kind.as_str()
                    ],
                )
                .map_err(save_err)?;
            }
            info.token = Some(HistoryToken(token as u64));
        }

        tx.commit().map_err(save_err)?;

        debug!(
            "Committed to {}: {} inserted, {} updated, {} deleted",
            self.descriptor.configuration_name, info.inserted, info.updated, info.deleted
        );
        Ok(info)
    }

    fn history_after(&self, after: Option<HistoryToken>) -> Result<Vec<HistoryTransaction>> {
        let conn = self.read_pool.acquire();
        read_history(conn.connection(), &self.identity, after)
    }

    fn prune_history(&self, up_to: HistoryToken) -> Result<usize> {
        if self.descriptor.read_only {
            return Err(self.read_only_error());
        }
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| CofferError::Store(e.to_string()))?;
        tx.execute(
            "DELETE FROM history_changes WHERE token <= ?1",
            [up_to.value() as i64],
        )
        .map_err(|e| CofferError::Store(e.to_string()))?;
        let removed = tx
            .execute("DELETE FROM history WHERE token <= ?1", [up_to.value() as i64])
            .map_err(|e| CofferError::Store(e.to_string()))?;
        tx.commit().map_err(|e| CofferError::Store(e.to_string()))?;
        Ok(removed)
    }

    fn close(&self) -> Result<()> {
        // Fold the WAL back into the main file; connections close on drop.
        let conn = self.conn.lock();
        if !self.descriptor.read_only {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .map_err(|e| CofferError::Store(e.to_string()))?;
        }
        Ok(())
    }
}

pub(crate) fn load_object(
    conn: &Connection,
    id: &ObjectId,
    codec: &dyn ValueCodec,
) -> Result<Option<StoredObject>> {
    let row: Option<(i64, Vec<u8>)> = conn
        .query_row(
            "SELECT schema_version, attributes FROM objects WHERE entity = ?1 AND key = ?2",
            rusqlite::params![id.entity(), id.key() as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| CofferError::Store(e.to_string()))?;

    row.map(|(version, blob)| {
        Ok(StoredObject::new(
            id.clone(),
            codec.decode_attributes(&blob)?,
            version as u32,
        ))
    })
    .transpose()
}

pub(crate) fn load_entity(
    conn: &Connection,
    store: &StoreIdentity,
    entity: &str,
    codec: &dyn ValueCodec,
) -> Result<Vec<StoredObject>> {
    let mut stmt = conn
        .prepare("SELECT key, schema_version, attributes FROM objects WHERE entity = ?1 ORDER BY key")
        .map_err(|e| CofferError::Store(e.to_string()))?;
    let rows = stmt
        .query_map([entity], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, Vec<u8>>(2)?))
        })
        .map_err(|e| CofferError::Store(e.to_string()))?;

    let mut objects = Vec::new();
    for row in rows {
        let (key, version, blob) = row.map_err(|e| CofferError::Store(e.to_string()))?;
        objects.push(StoredObject::new(
            ObjectId::new(store.clone(), entity, key as u64),
            codec.decode_attributes(&blob)?,
            version as u32,
        ));
    }
    Ok(objects)
}

pub(crate) fn load_all(
    conn: &Connection,
    store: &StoreIdentity,
    codec: &dyn ValueCodec,
) -> Result<Vec<StoredObject>> {
    let entities: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT DISTINCT entity FROM objects ORDER BY entity")
            .map_err(|e| CofferError::Store(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| CofferError::Store(e.to_string()))?;
        rows.collect::<rusqlite::Result<_>>()
            .map_err(|e| CofferError::Store(e.to_string()))?
    };

    let mut objects = Vec::new();
    for entity in entities {
        objects.extend(load_entity(conn, store, &entity, codec)?);
    }
    Ok(objects)
}

pub(crate) fn insert_object(
    conn: &Connection,
    object: &StoredObject,
    codec: &dyn ValueCodec,
) -> Result<()> {
    conn.execute(
        "INSERT INTO objects (entity, key, schema_version, attributes) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            object.entity(),
            object.id.key() as i64,
            object.schema_version as i64,
            codec.encode_attributes(&object.attributes)?
        ],
    )
    .map_err(|e| CofferError::Save(e.to_string()))?;
    Ok(())
}

pub(crate) fn read_history(
    conn: &Connection,
    store: &StoreIdentity,
    after: Option<HistoryToken>,
) -> Result<Vec<HistoryTransaction>> {
    let after = after.map(|t| t.value() as i64).unwrap_or(0);
    let mut stmt = conn
        .prepare(
            "SELECT h.token, h.author, h.created_at, c.entity, c.key, c.kind
             FROM history h LEFT JOIN history_changes c ON c.token = h.token
             WHERE h.token > ?1
             ORDER BY h.token, c.rowid",
        )
        .map_err(|e| CofferError::HistoryFetch(e.to_string()))?;
    let rows = stmt
        .query_map([after], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })
        .map_err(|e| CofferError::HistoryFetch(e.to_string()))?;

    let mut transactions: Vec<HistoryTransaction> = Vec::new();
    for row in rows {
        let (token, author, created_at, entity, key, kind) =
            row.map_err(|e| CofferError::HistoryFetch(e.to_string()))?;
        let token = HistoryToken(token as u64);

        if transactions.last().map(|tx| tx.token) != Some(token) {
            let timestamp = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| CofferError::HistoryFetch(e.to_string()))?
                .with_timezone(&chrono::Utc);
            transactions.push(HistoryTransaction {
                token,
                author,
                timestamp,
                changes: Vec::new(),
            });
        }

        if let (Some(entity), Some(key), Some(kind)) = (entity, key, kind) {
            let kind = ChangeKind::parse(&kind)
                .ok_or_else(|| CofferError::HistoryFetch(format!("Unknown change kind {kind}")))?;
            if let Some(tx) = transactions.last_mut() {
                tx.changes.push(HistoryChange {
                    id: ObjectId::new(store.clone(), entity, key as u64),
                    kind,
                });
            }
        }
    }
    Ok(transactions)
}

/// Read a store's metadata without opening it for use.
pub fn read_metadata(path: &Path) -> Result<StoreMetadata> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
        .map_err(|e| CofferError::UnknownSchema(format!("{}: {}", path.display(), e)))?;
    schema::read_meta(&conn)
}

/// Fold the WAL into the main file so the main file alone is a complete copy.
pub fn checkpoint(path: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
        .map_err(|e| CofferError::Store(e.to_string()))?;
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        .map_err(|e| CofferError::Store(e.to_string()))?;
    Ok(())
}
