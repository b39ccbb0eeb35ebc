//! Read connections for a store
//!
//! Object loads, fetches and history reads go through here so they never
//! queue behind the writer connection (the store runs in WAL mode).

use coffer_core::error::{CofferError, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A pooled read-only connection, returned to the pool on drop.
pub struct PooledSqliteConnection<'a> {
    conn: MutexGuard<'a, Connection>,
}

impl<'a> PooledSqliteConnection<'a> {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Read-only connections opened with `SQLITE_OPEN_READ_ONLY`.
///
/// `acquire` first looks for an idle connection and otherwise waits on
/// one in round-robin order. There is no acquire timeout.
pub struct SqliteReadPool {
    connections: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl SqliteReadPool {
    /// Opens `pool_size` (at least one) read-only connections.
    pub fn new(db_path: &Path, pool_size: usize) -> Result<Self> {
        let pool_size = pool_size.max(1);
        let mut connections = Vec::with_capacity(pool_size);

        for _ in 0..pool_size {
            let conn = Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| CofferError::Store(e.to_string()))?;

            connections.push(Mutex::new(conn));
        }

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
        })
    }

    /// Acquire a pooled read-only connection, blocking while all are busy.
    pub fn acquire(&self) -> PooledSqliteConnection<'_> {
        if let Some(conn) = self.try_acquire() {
            return conn;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        PooledSqliteConnection {
            conn: self.connections[idx].lock(),
        }
    }

    /// Try to acquire a pooled read-only connection without waiting
    ///
    /// Returns `None` if no connection is immediately available.
    pub fn try_acquire(&self) -> Option<PooledSqliteConnection<'_>> {
        self.connections
            .iter()
            .find_map(|conn| conn.try_lock())
            .map(|conn| PooledSqliteConnection { conn })
    }

    /// Number of idle connections
    pub fn available(&self) -> usize {
        self.connections.iter().filter(|c| !c.is_locked()).count()
    }

    pub fn pool_size(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_db() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Create the database with some test data
        let conn = Connection::open(&db_path).unwrap();
        conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY, value TEXT)", [])
            .unwrap();
        conn.execute("INSERT INTO test (id, value) VALUES (1, 'hello')", [])
            .unwrap();
        conn.execute("INSERT INTO test (id, value) VALUES (2, 'world')", [])
            .unwrap();
        drop(conn);

        (temp_dir, db_path)
    }

    #[test]
    fn test_pool_acquire_release() {
        let (_temp_dir, db_path) = create_test_db();
        let pool = SqliteReadPool::new(&db_path, 2).unwrap();
        assert_eq!(pool.available(), 2);

        let conn1 = pool.acquire();
        let conn2 = pool.acquire();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().is_none());

        drop(conn1);
        assert_eq!(pool.available(), 1);
        drop(conn2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_query() {
        let (_temp_dir, db_path) = create_test_db();
        let pool = SqliteReadPool::new(&db_path, 2).unwrap();

        let conn = pool.acquire();
        let value: String = conn
            .connection()
            .query_row("SELECT value FROM test WHERE id = ?1", [1], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(value, "hello");
    }

    #[test]
    fn test_zero_size_pool_gets_one_connection() {
        let (_temp_dir, db_path) = create_test_db();
        let pool = SqliteReadPool::new(&db_path, 0).unwrap();
        assert_eq!(pool.pool_size(), 1);
    }

    #[test]
    fn test_read_only_connections_reject_writes() {
        let (_temp_dir, db_path) = create_test_db();
        let pool = SqliteReadPool::new(&db_path, 1).unwrap();
        let conn = pool.acquire();
        assert!(conn
            .connection()
            .execute("INSERT INTO test (id, value) VALUES (3, 'x')", [])
            .is_err());
    }
}
