// db/pool.rs
// Async connection pool using deadpool-sqlite
//
// Database work runs as synchronous closures on the pool's blocking
// threads via `interact`. Multi-statement operations receive a
// `&mut Connection` so they can open a rusqlite transaction.
//
// In-memory pools use a shared-cache URI (`file:memdb_xxx?mode=memory&
// cache=shared`) so every pooled connection, and any second pool opened
// on the same URI, observes one database. This is what lets a watcher on
// another connection tail a stream a producer is writing.

use crate::error::{Result, StoreError};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Check if a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
///
/// SQLITE_BUSY ("database is locked") occurs with file-based databases under
/// write contention. SQLITE_LOCKED ("database table is locked") occurs with
/// shared-cache in-memory databases when another connection holds a write
/// lock on the same table.
fn is_rusqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// Check if a StoreError wraps a SQLite contention error.
fn is_contention(err: &StoreError) -> bool {
    match err {
        StoreError::Db(e) => is_rusqlite_contention(e),
        _ => false,
    }
}

/// Retry delays for SQLite contention backoff (100ms, 500ms, 2s).
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_millis(2000),
];

/// Database pool wrapper.
///
/// Cloning shares the underlying pool, which is how one pool is injected
/// into several store instances.
#[derive(Clone)]
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
    /// URI for in-memory databases (used to share state across pools)
    memory_uri: Option<String>,
}

impl DatabasePool {
    /// Open a pooled database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        ensure_parent_directory(path)?;
        let conn_str = path.to_string_lossy().into_owned();
        let hook = make_file_post_create_hook(path.to_path_buf());
        let pool = build_pool(&conn_str, hook)?;
        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
            memory_uri: None,
        })
    }

    /// Open a pooled in-memory database.
    ///
    /// Uses a shared cache URI so all connections access the same in-memory
    /// database. Without shared cache, each pooled connection would get its
    /// own separate empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let uri = format!("file:memdb_{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
        Self::open_shared(&uri).await
    }

    /// Open a pool on an existing shared in-memory URI.
    ///
    /// This simulates a second process/connection attaching to the same
    /// store, which watchers are required to support.
    pub async fn open_shared(uri: &str) -> Result<Self> {
        let pool = build_pool(uri, make_memory_post_create_hook())?;
        Ok(Self {
            pool,
            path: None,
            memory_uri: Some(uri.to_string()),
        })
    }

    /// Get the memory URI (for sharing state across pools).
    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure with a connection from the pool.
    ///
    /// This is the primary API for database access. The closure runs on a
    /// blocking thread pool, so it won't block the async runtime. The
    /// `&mut Connection` allows callers to open transactions.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Other(format!("failed to get connection: {e}")))?;

        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| StoreError::Other(format!("interact failed: {e}")))?
    }

    /// Like [`interact`](Self::interact) but with retry on SQLite
    /// contention errors.
    ///
    /// Uses fixed backoff (100ms, 500ms, 2000ms) for up to 3 retries. Use
    /// this for critical writes that must not be lost. The closure must be
    /// `Clone` to support retries.
    pub async fn interact_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
            match self.interact(f.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if is_contention(&e) => {
                    tracing::warn!(
                        "SQLite contention on attempt {}/{}, retrying in {:?}",
                        attempt + 1,
                        RETRY_DELAYS.len(),
                        delay
                    );
                    tokio::time::sleep(*delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.interact(f).await
    }

    /// Close the pool. In-flight operations finish; new `interact` calls
    /// fail.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Get pool status for monitoring.
    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }
}

/// Pool status for monitoring.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub waiting: usize,
}

fn build_pool(conn_str: &str, hook: Hook) -> Result<Pool> {
    let cfg = Config::new(conn_str);
    cfg.builder(Runtime::Tokio1)
        .map_err(|e| StoreError::Other(format!("failed to create pool builder: {e}")))?
        .max_size(8)
        .post_create(hook)
        .build()
        .map_err(|e| StoreError::Other(format!("failed to build connection pool: {e}")))
}

/// Ensure parent directory exists with secure permissions (0o700 on Unix).
fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o700); // rwx------
            std::fs::set_permissions(parent, perms)?;
        }
        #[cfg(not(unix))]
        tracing::debug!(
            "Skipping directory permission restriction on non-Unix platform: {}",
            parent.display()
        );
    }
    Ok(())
}

/// Create a post_create hook for file-based databases.
///
/// Sets up PRAGMAs via `setup_connection` and restricts file permissions
/// to 0o600.
fn make_file_post_create_hook(path: PathBuf) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let path_for_perms = path.clone();
        Box::pin(async move {
            conn.interact(move |conn| {
                setup_connection(conn)?;

                #[cfg(unix)]
                if let Ok(metadata) = std::fs::metadata(&path_for_perms) {
                    let mut perms = metadata.permissions();
                    perms.set_mode(0o600); // rw-------
                    if let Err(e) = std::fs::set_permissions(&path_for_perms, perms) {
                        tracing::warn!("Failed to set database file permissions to 0600: {}", e);
                    }
                }
                #[cfg(not(unix))]
                tracing::debug!(
                    "Skipping DB file permission restriction on non-Unix platform: {}",
                    path_for_perms.display()
                );

                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
            })?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// Create a post_create hook for in-memory databases.
///
/// Enables foreign keys and busy_timeout (WAL mode is not applicable to
/// in-memory DBs).
fn make_memory_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys=ON; \
                     PRAGMA busy_timeout=5000;",
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
            })?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// Configure a connection after it's created.
/// Called from the post_create hook.
fn setup_connection(conn: &Connection) -> rusqlite::Result<()> {
    // WAL for concurrent readers, foreign key enforcement, busy timeout
    // for write contention (5s retry window), NORMAL synchronous (safe
    // with WAL).
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; \
         PRAGMA foreign_keys=ON; \
         PRAGMA busy_timeout=5000; \
         PRAGMA synchronous=NORMAL; \
         PRAGMA journal_size_limit=32768;",
    )?;
    Ok(())
}
