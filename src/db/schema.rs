// db/schema.rs
// Database schema: graph tables, stream log, FTS5 search index

use rusqlite::Connection;

use crate::error::Result;

/// Run all schema setup.
///
/// Called during store initialization. Idempotent: every statement uses
/// `IF NOT EXISTS`, so reopening an existing database is a no-op.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    if let Err(e) = conn.execute_batch("PRAGMA optimize") {
        tracing::debug!("PRAGMA optimize skipped: {}", e);
    }
    Ok(())
}

/// Rebuild the FTS5 search index from the messages table.
///
/// Normally the index is maintained write-through by message upserts; this
/// repopulates it wholesale after bulk imports or suspected corruption.
pub fn rebuild_search_index(conn: &Connection) -> Result<()> {
    tracing::info!("Rebuilding message search index");

    conn.execute("DELETE FROM messages_fts", [])?;
    let inserted = conn.execute(
        "INSERT INTO messages_fts(message_id, chat_id, name, content)
         SELECT id, chat_id, name,
                CASE WHEN json_type(data) = 'text'
                     THEN json_extract(data, '$')
                     ELSE data
                END
         FROM messages",
        [],
    )?;

    tracing::info!("Search index rebuilt with {} entries", inserted);
    Ok(())
}

/// Database schema SQL
pub const SCHEMA: &str = r#"
-- =======================================
-- GRAPH: Chats, messages, branches, checkpoints
-- =======================================
CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT,
    metadata TEXT,                    -- JSON object, NULL when unset
    created_at INTEGER NOT NULL,      -- ms since epoch
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chats_updated ON chats(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    parent_id TEXT,                   -- weak reference, NULL for roots
    name TEXT NOT NULL,               -- role tag: 'user', 'assistant', ...
    kind TEXT,                        -- 'message', 'fragment', ...
    data TEXT NOT NULL,               -- JSON payload
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id);
CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parent_id);

CREATE TABLE IF NOT EXISTS branches (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    head_message_id TEXT,
    is_active INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    UNIQUE(chat_id, name)
);
CREATE INDEX IF NOT EXISTS idx_branches_chat ON branches(chat_id);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    message_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(chat_id, name)
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_chat ON checkpoints(chat_id);

-- =======================================
-- STREAMS: producer state machine + ordered chunk log
-- =======================================
CREATE TABLE IF NOT EXISTS streams (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,             -- queued|running|completed|failed|cancelled
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    cancel_requested_at INTEGER,
    error TEXT
);

CREATE TABLE IF NOT EXISTS stream_chunks (
    stream_id TEXT NOT NULL REFERENCES streams(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    data TEXT NOT NULL,               -- JSON payload
    created_at INTEGER NOT NULL,
    PRIMARY KEY (stream_id, seq)
);

-- =======================================
-- FULL-TEXT SEARCH (FTS5)
-- =======================================
-- Write-through index over message content; porter stemming with unicode
-- case folding so 'learn'/'learns'/'learning' are queryable alike.
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    message_id UNINDEXED,
    chat_id UNINDEXED,
    name UNINDEXED,
    content,
    tokenize='porter unicode61 remove_diacritics 1'
);
"#;
