// db/messages.rs
// Message upsert, ancestor walk, graph dump

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::ContextStore;
use super::branches::get_active_branch_sync;
use super::codec;
use super::search::write_search_entry_tx;
use super::types::{ChatGraph, Checkpoint, GraphNode, Message, NewMessage};
use crate::error::{Result, StoreError};
use crate::utils::{now_ms, truncate_chars};

/// Preview length for graph dumps, in characters.
const PREVIEW_CHARS: usize = 50;

// ============================================================================
// Sync functions for pool.interact() usage
// ============================================================================

pub(crate) fn read_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let data_text: String = row.get(5)?;
    let data: Value = serde_json::from_str(&data_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        kind: row.get(4)?,
        data,
        created_at: row.get(6)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, chat_id, parent_id, name, kind, data, created_at";

/// Upsert a message by id and rewrite its search entry, atomically.
///
/// On conflict `parent_id`, `name`, `kind`, and `data` are updated while
/// `chat_id` and `created_at` are preserved; producers replaying after a
/// crash may legitimately rewrite the same id. A self-referential
/// `parent_id` is rejected.
pub fn add_message_sync(conn: &mut Connection, msg: &NewMessage) -> Result<Message> {
    if msg.parent_id.as_deref() == Some(msg.id.as_str()) {
        return Err(StoreError::Conflict(format!(
            "message '{}' cannot be its own parent",
            msg.id
        )));
    }

    let tx = conn.transaction()?;

    let existing: Option<(String, i64)> = tx
        .query_row(
            "SELECT chat_id, created_at FROM messages WHERE id = ?1",
            [&msg.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let data_text = codec::encode_value(&msg.data);
    let stored = match existing {
        Some((chat_id, created_at)) => {
            tx.execute(
                "UPDATE messages SET parent_id = ?2, name = ?3, kind = ?4, data = ?5
                 WHERE id = ?1",
                params![msg.id, msg.parent_id, msg.name, msg.kind, data_text],
            )?;
            Message {
                id: msg.id.clone(),
                chat_id,
                parent_id: msg.parent_id.clone(),
                name: msg.name.clone(),
                kind: msg.kind.clone(),
                data: msg.data.clone(),
                created_at,
            }
        }
        None => {
            let chat_exists: bool = tx
                .query_row("SELECT 1 FROM chats WHERE id = ?1", [&msg.chat_id], |_| {
                    Ok(true)
                })
                .optional()?
                .unwrap_or(false);
            if !chat_exists {
                return Err(StoreError::not_found("chat", &msg.chat_id));
            }
            let now = now_ms();
            tx.execute(
                "INSERT INTO messages (id, chat_id, parent_id, name, kind, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![msg.id, msg.chat_id, msg.parent_id, msg.name, msg.kind, data_text, now],
            )?;
            Message {
                id: msg.id.clone(),
                chat_id: msg.chat_id.clone(),
                parent_id: msg.parent_id.clone(),
                name: msg.name.clone(),
                kind: msg.kind.clone(),
                data: msg.data.clone(),
                created_at: now,
            }
        }
    };

    write_search_entry_tx(&tx, &stored)?;
    tx.commit()?;
    Ok(stored)
}

pub fn get_message_sync(conn: &Connection, id: &str) -> Result<Option<Message>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        [id],
        read_message,
    )
    .optional()
    .map_err(Into::into)
}

/// Walk the `parent_id` chain from `head_id` to the root and return it
/// root-first (chronological order).
///
/// The recursive CTE uses UNION set semantics, so a pathological
/// `parent_id` cycle cannot recurse unboundedly; the Rust-side walk keeps
/// a visited set and stops at the first revisit. An unknown head yields an
/// empty chain.
pub fn get_message_chain_sync(conn: &Connection, head_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "WITH RECURSIVE chain({MESSAGE_COLUMNS}) AS (
             SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1
             UNION
             SELECT m.id, m.chat_id, m.parent_id, m.name, m.kind, m.data, m.created_at
             FROM messages m JOIN chain c ON m.id = c.parent_id
         )
         SELECT {MESSAGE_COLUMNS} FROM chain"
    ))?;
    let by_id: HashMap<String, Message> = stmt
        .query_map([head_id], read_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect();

    let mut ordered = Vec::with_capacity(by_id.len());
    let mut visited: HashSet<&str> = HashSet::with_capacity(by_id.len());
    let mut cursor = by_id.get(head_id);
    while let Some(msg) = cursor {
        if !visited.insert(msg.id.as_str()) {
            tracing::warn!(message_id = %msg.id, "parent cycle detected in message chain");
            break;
        }
        ordered.push(msg.clone());
        cursor = msg.parent_id.as_deref().and_then(|pid| by_id.get(pid));
    }
    ordered.reverse();
    Ok(ordered)
}

/// Chain length without materializing payloads; used by branch listings.
pub(crate) fn chain_len_sync(conn: &Connection, head_id: &str) -> Result<i64> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE chain(id, parent_id) AS (
             SELECT id, parent_id FROM messages WHERE id = ?1
             UNION
             SELECT m.id, m.parent_id FROM messages m JOIN chain c ON m.id = c.parent_id
         )
         SELECT id, parent_id FROM chain",
    )?;
    let links: HashMap<String, Option<String>> = stmt
        .query_map([head_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut count = 0i64;
    let mut visited: HashSet<&str> = HashSet::with_capacity(links.len());
    let mut cursor = links.get_key_value(head_id);
    while let Some((id, parent)) = cursor {
        if !visited.insert(id.as_str()) {
            break;
        }
        count += 1;
        cursor = parent
            .as_deref()
            .and_then(|pid| links.get_key_value(pid));
    }
    Ok(count)
}

pub fn has_children_sync(conn: &Connection, id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM messages WHERE parent_id = ?1)",
        [id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

/// Resolve the active branch's head and return its chain. Fails with
/// `NotFound` when the chat does not exist; a headless branch yields an
/// empty list.
pub fn get_messages_sync(conn: &Connection, chat_id: &str) -> Result<Vec<Message>> {
    let chat_exists: bool = conn
        .query_row("SELECT 1 FROM chats WHERE id = ?1", [chat_id], |_| Ok(true))
        .optional()?
        .unwrap_or(false);
    if !chat_exists {
        return Err(StoreError::not_found("chat", chat_id));
    }
    let head = get_active_branch_sync(conn, chat_id)?.and_then(|b| b.head_message_id);
    match head {
        Some(head_id) => get_message_chain_sync(conn, &head_id),
        None => Ok(Vec::new()),
    }
}

/// Dump the whole graph for visualization: every message (with a bounded
/// content preview), branch, and checkpoint, ordered by `created_at`
/// ascending.
pub fn get_graph_sync(conn: &Connection, chat_id: &str) -> Result<ChatGraph> {
    let chat_exists: bool = conn
        .query_row("SELECT 1 FROM chats WHERE id = ?1", [chat_id], |_| Ok(true))
        .optional()?
        .unwrap_or(false);
    if !chat_exists {
        return Err(StoreError::not_found("chat", chat_id));
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 ORDER BY created_at ASC"
    ))?;
    let nodes = stmt
        .query_map([chat_id], read_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .map(|m| GraphNode {
            preview: truncate_chars(&codec::content_text(&m.data), PREVIEW_CHARS),
            id: m.id,
            parent_id: m.parent_id,
            name: m.name,
            kind: m.kind,
            created_at: m.created_at,
        })
        .collect();

    let branches = super::branches::list_branch_rows_sync(conn, chat_id)?;

    let mut stmt = conn.prepare(
        "SELECT id, chat_id, name, message_id, created_at
         FROM checkpoints WHERE chat_id = ?1 ORDER BY created_at ASC",
    )?;
    let checkpoints = stmt
        .query_map([chat_id], |row| {
            Ok(Checkpoint {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                name: row.get(2)?,
                message_id: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(ChatGraph {
        chat_id: chat_id.to_string(),
        nodes,
        branches,
        checkpoints,
    })
}

// ============================================================================
// ContextStore methods
// ============================================================================

impl ContextStore {
    /// Upsert a message and rewrite its search entry.
    pub async fn add_message(&self, msg: NewMessage) -> Result<Message> {
        self.pool
            .interact(move |conn| add_message_sync(conn, &msg))
            .await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_string();
        self.pool
            .interact(move |conn| get_message_sync(conn, &id))
            .await
    }

    /// Ancestor chain from `head_id`, root first.
    pub async fn get_message_chain(&self, head_id: &str) -> Result<Vec<Message>> {
        let head_id = head_id.to_string();
        self.pool
            .interact(move |conn| get_message_chain_sync(conn, &head_id))
            .await
    }

    pub async fn has_children(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.pool
            .interact(move |conn| has_children_sync(conn, &id))
            .await
    }

    /// Messages on the chat's active branch, root first.
    pub async fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let chat_id = chat_id.to_string();
        self.pool
            .interact(move |conn| get_messages_sync(conn, &chat_id))
            .await
    }

    /// Full graph dump for visualization.
    pub async fn get_graph(&self, chat_id: &str) -> Result<ChatGraph> {
        let chat_id = chat_id.to_string();
        self.pool
            .interact(move |conn| get_graph_sync(conn, &chat_id))
            .await
    }
}
