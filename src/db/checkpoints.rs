// db/checkpoints.rs
// Named message pointers with upsert-by-(chat, name) semantics

use rusqlite::{Connection, OptionalExtension, params};

use super::ContextStore;
use super::types::Checkpoint;
use crate::error::{Result, StoreError};
use crate::utils::now_ms;

// ============================================================================
// Sync functions for pool.interact() usage
// ============================================================================

fn read_checkpoint(row: &rusqlite::Row) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        name: row.get(2)?,
        message_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

const CHECKPOINT_COLUMNS: &str = "id, chat_id, name, message_id, created_at";

/// Upsert by `(chat_id, name)`: on conflict the existing checkpoint keeps
/// its id but `message_id` and `created_at` are overwritten.
pub fn create_checkpoint_sync(
    conn: &Connection,
    chat_id: &str,
    name: &str,
    message_id: &str,
) -> Result<Checkpoint> {
    let chat_exists: bool = conn
        .query_row("SELECT 1 FROM chats WHERE id = ?1", [chat_id], |_| Ok(true))
        .optional()?
        .unwrap_or(false);
    if !chat_exists {
        return Err(StoreError::not_found("chat", chat_id));
    }

    conn.execute(
        "INSERT INTO checkpoints (id, chat_id, name, message_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(chat_id, name) DO UPDATE SET
             message_id = excluded.message_id,
             created_at = excluded.created_at",
        params![
            uuid::Uuid::new_v4().to_string(),
            chat_id,
            name,
            message_id,
            now_ms()
        ],
    )?;

    conn.query_row(
        &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE chat_id = ?1 AND name = ?2"),
        params![chat_id, name],
        read_checkpoint,
    )
    .map_err(Into::into)
}

pub fn get_checkpoint_sync(
    conn: &Connection,
    chat_id: &str,
    name: &str,
) -> Result<Option<Checkpoint>> {
    conn.query_row(
        &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE chat_id = ?1 AND name = ?2"),
        params![chat_id, name],
        read_checkpoint,
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_checkpoints_sync(conn: &Connection, chat_id: &str) -> Result<Vec<Checkpoint>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE chat_id = ?1 ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map([chat_id], read_checkpoint)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Returns true iff a checkpoint was deleted.
pub fn delete_checkpoint_sync(conn: &Connection, chat_id: &str, name: &str) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM checkpoints WHERE chat_id = ?1 AND name = ?2",
        params![chat_id, name],
    )?;
    Ok(rows > 0)
}

// ============================================================================
// ContextStore methods
// ============================================================================

impl ContextStore {
    /// Upsert a checkpoint at a message.
    pub async fn create_checkpoint(
        &self,
        chat_id: &str,
        name: &str,
        message_id: &str,
    ) -> Result<Checkpoint> {
        let chat_id = chat_id.to_string();
        let name = name.to_string();
        let message_id = message_id.to_string();
        self.pool
            .interact(move |conn| create_checkpoint_sync(conn, &chat_id, &name, &message_id))
            .await
    }

    pub async fn get_checkpoint(&self, chat_id: &str, name: &str) -> Result<Option<Checkpoint>> {
        let chat_id = chat_id.to_string();
        let name = name.to_string();
        self.pool
            .interact(move |conn| get_checkpoint_sync(conn, &chat_id, &name))
            .await
    }

    pub async fn list_checkpoints(&self, chat_id: &str) -> Result<Vec<Checkpoint>> {
        let chat_id = chat_id.to_string();
        self.pool
            .interact(move |conn| list_checkpoints_sync(conn, &chat_id))
            .await
    }

    pub async fn delete_checkpoint(&self, chat_id: &str, name: &str) -> Result<bool> {
        let chat_id = chat_id.to_string();
        let name = name.to_string();
        self.pool
            .interact(move |conn| delete_checkpoint_sync(conn, &chat_id, &name))
            .await
    }
}
