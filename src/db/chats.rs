// db/chats.rs
// Chat CRUD: create/upsert/get/update/list/delete

use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, Transaction, params, params_from_iter};
use serde_json::Value;

use super::ContextStore;
use super::codec;
use super::types::{Chat, ChatInfo, ChatPatch, ListChatsFilter, NewChat};
use crate::error::{Result, StoreError, is_unique_violation};
use crate::utils::now_ms;

// ============================================================================
// Sync functions for pool.interact() usage
// ============================================================================

pub(crate) fn read_chat(row: &rusqlite::Row) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        metadata: decode_metadata(row, 3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn decode_metadata(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<Value>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        }),
        None => Ok(None),
    }
}

const CHAT_COLUMNS: &str = "id, user_id, title, metadata, created_at, updated_at";

/// Insert a chat and its `main` branch in one transaction.
/// Fails with `Conflict` if the id already exists.
pub fn create_chat_sync(conn: &mut Connection, chat: &NewChat) -> Result<Chat> {
    let tx = conn.transaction()?;
    let created = insert_chat_tx(&tx, chat)?;
    tx.commit()?;
    Ok(created)
}

/// Insert if absent; otherwise return the existing row unchanged.
///
/// Never overwrites existing `title`, `metadata`, or timestamps. This is
/// the idempotency primitive callers rely on after restarts.
pub fn upsert_chat_sync(conn: &mut Connection, chat: &NewChat) -> Result<(Chat, bool)> {
    let tx = conn.transaction()?;
    if let Some(existing) = get_chat_tx(&tx, &chat.id)? {
        tx.commit()?;
        return Ok((existing, false));
    }
    let created = insert_chat_tx(&tx, chat)?;
    tx.commit()?;
    Ok((created, true))
}

/// Chat insert + main branch, shared by create and upsert. Runs inside the
/// caller's transaction.
fn insert_chat_tx(tx: &Transaction, chat: &NewChat) -> Result<Chat> {
    let now = now_ms();
    let metadata_text = chat.metadata.as_ref().map(codec::encode_value);
    tx.execute(
        "INSERT INTO chats (id, user_id, title, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![chat.id, chat.user_id, chat.title, metadata_text, now],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("chat '{}' already exists", chat.id))
        } else {
            e.into()
        }
    })?;

    // Every chat starts with exactly one active branch named 'main'.
    tx.execute(
        "INSERT INTO branches (id, chat_id, name, head_message_id, is_active, created_at)
         VALUES (?1, ?2, 'main', NULL, 1, ?3)",
        params![uuid::Uuid::new_v4().to_string(), chat.id, now],
    )?;

    tracing::debug!(chat_id = %chat.id, "created chat with main branch");
    Ok(Chat {
        id: chat.id.clone(),
        user_id: chat.user_id.clone(),
        title: chat.title.clone(),
        metadata: chat.metadata.clone(),
        created_at: now,
        updated_at: now,
    })
}

fn get_chat_tx(tx: &Transaction, id: &str) -> Result<Option<Chat>> {
    tx.query_row(
        &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
        [id],
        read_chat,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_chat_sync(conn: &Connection, id: &str) -> Result<Option<Chat>> {
    conn.query_row(
        &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
        [id],
        read_chat,
    )
    .optional()
    .map_err(Into::into)
}

/// Apply a field patch; only provided fields are written. `metadata`
/// replaces wholesale. Bumps `updated_at`.
pub fn update_chat_sync(conn: &Connection, id: &str, patch: &ChatPatch) -> Result<Chat> {
    let metadata_text = patch.metadata.as_ref().map(codec::encode_value);
    let rows = conn.execute(
        "UPDATE chats SET
            title = CASE WHEN ?2 THEN ?3 ELSE title END,
            metadata = CASE WHEN ?4 THEN ?5 ELSE metadata END,
            updated_at = ?6
         WHERE id = ?1",
        params![
            id,
            patch.title.is_some(),
            patch.title,
            patch.metadata.is_some(),
            metadata_text,
            now_ms()
        ],
    )?;
    if rows == 0 {
        return Err(StoreError::not_found("chat", id));
    }
    conn.query_row(
        &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
        [id],
        read_chat,
    )
    .map_err(Into::into)
}

/// List chats ordered by `updated_at` descending, with message and branch
/// counts. The metadata filter matches a single key with JSON-typed
/// equality; chats without metadata never match.
pub fn list_chats_sync(conn: &Connection, filter: &ListChatsFilter) -> Result<Vec<ChatInfo>> {
    let mut sql = format!(
        "SELECT {CHAT_COLUMNS},
                (SELECT COUNT(*) FROM messages m WHERE m.chat_id = chats.id) AS message_count,
                (SELECT COUNT(*) FROM branches b WHERE b.chat_id = chats.id) AS branch_count
         FROM chats WHERE 1=1"
    );
    let mut binds: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(ref user_id) = filter.user_id {
        sql.push_str(" AND user_id = ?");
        binds.push(Box::new(user_id.clone()));
    }

    if let Some(ref meta) = filter.metadata {
        let path = json_path(&meta.key);
        match &meta.value {
            Value::String(s) => {
                sql.push_str(" AND json_type(metadata, ?) = 'text' AND json_extract(metadata, ?) = ?");
                binds.push(Box::new(path.clone()));
                binds.push(Box::new(path));
                binds.push(Box::new(s.clone()));
            }
            Value::Bool(b) => {
                // json_type distinguishes true/false; json_extract would
                // collapse booleans into 0/1 and collide with numbers.
                sql.push_str(" AND json_type(metadata, ?) = ?");
                binds.push(Box::new(path));
                binds.push(Box::new(if *b { "true" } else { "false" }));
            }
            Value::Number(n) => {
                sql.push_str(
                    " AND json_type(metadata, ?) IN ('integer', 'real') AND json_extract(metadata, ?) = ?",
                );
                binds.push(Box::new(path.clone()));
                binds.push(Box::new(path));
                if let Some(i) = n.as_i64() {
                    binds.push(Box::new(i));
                } else {
                    binds.push(Box::new(n.as_f64().unwrap_or_default()));
                }
            }
            other => {
                return Err(StoreError::Validation(format!(
                    "metadata filter value must be a string, number, or boolean, got {other}"
                )));
            }
        }
    }

    sql.push_str(" ORDER BY updated_at DESC LIMIT ? OFFSET ?");
    binds.push(Box::new(filter.limit.map(|l| l as i64).unwrap_or(-1)));
    binds.push(Box::new(filter.offset.unwrap_or(0) as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds.iter().map(|b| b.as_ref())), |row| {
        let chat = read_chat(row)?;
        Ok(ChatInfo {
            id: chat.id,
            user_id: chat.user_id,
            title: chat.title,
            metadata: chat.metadata,
            created_at: chat.created_at,
            updated_at: chat.updated_at,
            message_count: row.get(6)?,
            branch_count: row.get(7)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// JSON path for a metadata key, quoted so keys containing dots or spaces
/// address a single field.
fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\"\""))
}

/// Delete a chat, cascading to messages, branches, checkpoints, and search
/// entries in one transaction. Returns true iff a row was deleted. When
/// `user_id` is given the delete only succeeds on an exact owner match.
pub fn delete_chat_sync(conn: &mut Connection, id: &str, user_id: Option<&str>) -> Result<bool> {
    let tx = conn.transaction()?;
    let rows = tx.execute(
        "DELETE FROM chats WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)",
        params![id, user_id],
    )?;
    if rows == 0 {
        return Ok(false);
    }
    // FK cascade covers messages/branches/checkpoints; the FTS virtual
    // table has no FK and is cleared explicitly.
    tx.execute("DELETE FROM messages_fts WHERE chat_id = ?1", [id])?;
    tx.commit()?;
    tracing::debug!(chat_id = %id, "deleted chat with cascade");
    Ok(true)
}

// ============================================================================
// ContextStore methods
// ============================================================================

impl ContextStore {
    /// Create a chat and its `main` branch atomically.
    pub async fn create_chat(&self, chat: NewChat) -> Result<Chat> {
        self.pool
            .interact(move |conn| create_chat_sync(conn, &chat))
            .await
    }

    /// Create a chat if absent; return the existing row unchanged
    /// otherwise. The flag is true when a new row was inserted.
    pub async fn upsert_chat(&self, chat: NewChat) -> Result<(Chat, bool)> {
        self.pool
            .interact(move |conn| upsert_chat_sync(conn, &chat))
            .await
    }

    pub async fn get_chat(&self, id: &str) -> Result<Option<Chat>> {
        let id = id.to_string();
        self.pool
            .interact(move |conn| get_chat_sync(conn, &id))
            .await
    }

    /// Update `title` and/or `metadata`; bumps `updated_at`.
    pub async fn update_chat(&self, id: &str, patch: ChatPatch) -> Result<Chat> {
        let id = id.to_string();
        self.pool
            .interact(move |conn| update_chat_sync(conn, &id, &patch))
            .await
    }

    /// List chats, newest activity first.
    pub async fn list_chats(&self, filter: ListChatsFilter) -> Result<Vec<ChatInfo>> {
        self.pool
            .interact(move |conn| list_chats_sync(conn, &filter))
            .await
    }

    /// Delete a chat and everything it owns. Returns true iff deleted.
    pub async fn delete_chat(&self, id: &str, user_id: Option<&str>) -> Result<bool> {
        let id = id.to_string();
        let user_id = user_id.map(str::to_string);
        self.pool
            .interact(move |conn| delete_chat_sync(conn, &id, user_id.as_deref()))
            .await
    }
}
