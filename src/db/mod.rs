// db/mod.rs
// Unified storage layer: graph tables, stream log, FTS search over rusqlite

mod branches;
mod chats;
mod checkpoints;
pub mod codec;
mod messages;
pub mod pool;
mod schema;
mod search;
mod streams;
mod types;

pub use branches::{
    create_branch_sync, get_active_branch_sync, get_branch_sync, list_branches_sync,
    rewind_to_message_sync, set_active_branch_sync, update_branch_head_sync,
};
pub use chats::{
    create_chat_sync, delete_chat_sync, get_chat_sync, list_chats_sync, update_chat_sync,
    upsert_chat_sync,
};
pub use checkpoints::{
    create_checkpoint_sync, delete_checkpoint_sync, get_checkpoint_sync, list_checkpoints_sync,
};
pub use messages::{
    add_message_sync, get_message_chain_sync, get_message_sync, get_messages_sync, get_graph_sync,
    has_children_sync,
};
pub use pool::{DatabasePool, PoolStatus};
pub use schema::run_migrations;
pub use search::search_messages_sync;
pub use streams::{
    append_chunks_sync, create_stream_sync, delete_stream_sync, get_chunks_sync,
    get_stream_status_sync, get_stream_sync, reopen_stream_sync, update_stream_status_sync,
    upsert_stream_sync,
};
pub use types::*;

use std::path::Path;

use crate::error::Result;

/// The conversational context store.
///
/// An async facade over [`DatabasePool`]: chats, the message DAG, branches,
/// checkpoints, the stream log, and full-text search. Cloning is cheap and
/// shares the pool.
///
/// Ownership of the pool is tracked so [`close`](Self::close) only shuts
/// down pools this store opened itself; an injected pool stays usable by
/// whoever else shares it.
#[derive(Clone)]
pub struct ContextStore {
    pub(crate) pool: DatabasePool,
    owns_pool: bool,
}

impl ContextStore {
    /// Open a store backed by a database file, creating schema as needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = DatabasePool::open(path).await?;
        Self::init(pool, true).await
    }

    /// Open an in-memory store (shared-cache, so all pooled connections
    /// see one database).
    pub async fn open_in_memory() -> Result<Self> {
        let pool = DatabasePool::open_in_memory().await?;
        Self::init(pool, true).await
    }

    /// Attach a second store to an existing in-memory database by URI.
    /// Simulates an independent connection for multi-watcher scenarios.
    pub async fn open_shared(uri: &str) -> Result<Self> {
        let pool = DatabasePool::open_shared(uri).await?;
        Self::init(pool, true).await
    }

    /// Build a store on an externally-owned pool. `close` will not close
    /// the pool.
    pub async fn with_pool(pool: DatabasePool) -> Result<Self> {
        Self::init(pool, false).await
    }

    async fn init(pool: DatabasePool, owns_pool: bool) -> Result<Self> {
        pool.interact(|conn| run_migrations(conn)).await?;
        Ok(Self { pool, owns_pool })
    }

    /// The underlying pool, for sharing with another store.
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// The shared in-memory URI, if this store is in-memory.
    pub fn memory_uri(&self) -> Option<&str> {
        self.pool.memory_uri()
    }

    /// Release the store's connections. A pool injected via
    /// [`with_pool`](Self::with_pool) is left open for its owner.
    pub fn close(&self) {
        if self.owns_pool {
            self.pool.close();
        }
    }
}
