//! Bounded connection pool for the single store file.
//!
//! Pooling here avoids repeated open/close overhead on slow disks — it is
//! not a multi-client concurrency mechanism. Handles are scoped: each
//! operation acquires, uses, and releases within its own call, so the pool
//! cannot be exhausted by retained connections.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;

use super::{sqlite, StoreError, StoreResult};
use crate::config::{StoreConfig, StoreLocation};

#[derive(Debug)]
struct PoolInner {
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
    size: usize,
}

/// Fixed-size pool of configured connections to one store.
#[derive(Debug)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    location: StoreLocation,
}

impl ConnectionPool {
    /// Open `pool_size` connections (one for an in-memory store), each with
    /// durability pragmas applied. Fails with `StorageUnavailable` if the
    /// file cannot be opened or does not read back as a database.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        let size = match config.location {
            StoreLocation::Memory => 1,
            StoreLocation::Disk(_) => config.pool_size.max(1),
        };

        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(open_connection(config)?);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                available: Condvar::new(),
                size,
            }),
            location: config.location.clone(),
        })
    }

    /// Acquire a scoped connection handle, blocking until one is idle.
    pub fn acquire(&self) -> StoreResult<PooledConnection> {
        let mut idle = lock_idle(&self.inner.idle);
        while idle.is_empty() {
            idle = self
                .inner
                .available
                .wait(idle)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let conn = idle.pop().expect("non-empty after wait");
        drop(idle);

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Number of connections this pool was opened with.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Close every pooled connection deterministically. Blocks until all
    /// handed-out handles have been returned.
    pub fn close(self) {
        let mut idle = lock_idle(&self.inner.idle);
        while idle.len() < self.inner.size {
            idle = self
                .inner
                .available
                .wait(idle)
                .unwrap_or_else(PoisonError::into_inner);
        }
        idle.clear();
        tracing::info!("connection pool closed");
    }
}

fn lock_idle(idle: &Mutex<Vec<Connection>>) -> MutexGuard<'_, Vec<Connection>> {
    idle.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_connection(config: &StoreConfig) -> StoreResult<Connection> {
    let (conn, path_label) = match &config.location {
        StoreLocation::Memory => (
            Connection::open_in_memory().map_err(|e| unavailable(":memory:", &e))?,
            ":memory:".to_string(),
        ),
        StoreLocation::Disk(path) => {
            let label = path.display().to_string();
            let conn = Connection::open(path).map_err(|e| unavailable(&label, &e))?;
            (conn, label)
        }
    };

    sqlite::configure_pragmas(&conn, config.durability)
        .map_err(|e| unavailable(&path_label, &e))?;

    // Force a read so a file that is not a database fails here, at open,
    // rather than on the first repository call.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|e| unavailable(&path_label, &e))?;

    Ok(conn)
}

fn unavailable(path: &str, reason: &dyn std::fmt::Display) -> StoreError {
    StoreError::StorageUnavailable {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Scoped handle to a pooled connection. Returned to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = lock_idle(&self.pool.idle);
            idle.push(conn);
            self.pool.available.notify_one();
        }
    }
}
