// db/search.rs
// Full-text search over message content (FTS5, porter-stemmed)

use rusqlite::types::ToSql;
use rusqlite::{Connection, params_from_iter};

use super::ContextStore;
use super::codec;
use super::messages::read_message;
use super::types::{Message, SearchOptions, SearchResult};
use crate::error::Result;

/// Snippet length bound, in tokens.
const SNIPPET_TOKENS: u32 = 32;

// ============================================================================
// Sync functions for pool.interact() usage
// ============================================================================

/// Rewrite the search entry for a message: the previous entry (if any) is
/// deleted and a fresh one inserted. Runs inside the message upsert
/// transaction so index and row never diverge.
pub(crate) fn write_search_entry_tx(conn: &Connection, msg: &Message) -> Result<()> {
    conn.execute(
        "DELETE FROM messages_fts WHERE message_id = ?1",
        [&msg.id],
    )?;
    conn.execute(
        "INSERT INTO messages_fts (message_id, chat_id, name, content)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![msg.id, msg.chat_id, msg.name, codec::content_text(&msg.data)],
    )?;
    Ok(())
}

/// Ranked full-text query scoped to one chat.
///
/// `query` is FTS5 match syntax: conjunction, `OR`, `NOT`, `"exact
/// phrase"`, `prefix*`. Results come back in ascending BM25 rank with
/// matched terms wrapped in `<mark>…</mark>`.
pub fn search_messages_sync(
    conn: &Connection,
    chat_id: &str,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    if let Some(roles) = &options.roles
        && roles.is_empty()
    {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT m.id, m.chat_id, m.parent_id, m.name, m.kind, m.data, m.created_at,
                bm25(messages_fts) AS rank,
                snippet(messages_fts, 3, '<mark>', '</mark>', '…', ",
    );
    sql.push_str(&SNIPPET_TOKENS.to_string());
    sql.push_str(
        ") AS snip
         FROM messages_fts
         JOIN messages m ON m.id = messages_fts.message_id
         WHERE messages_fts MATCH ? AND messages_fts.chat_id = ?",
    );

    let mut binds: Vec<Box<dyn ToSql>> = vec![
        Box::new(query.to_string()),
        Box::new(chat_id.to_string()),
    ];
    if let Some(roles) = &options.roles {
        let placeholders = vec!["?"; roles.len()].join(", ");
        sql.push_str(&format!(" AND m.name IN ({placeholders})"));
        for role in roles {
            binds.push(Box::new(role.clone()));
        }
    }
    sql.push_str(" ORDER BY rank LIMIT ?");
    binds.push(Box::new(options.limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds.iter().map(|b| b.as_ref())), |row| {
        Ok(SearchResult {
            message: read_message(row)?,
            rank: row.get(7)?,
            snippet: row.get(8)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

// ============================================================================
// ContextStore methods
// ============================================================================

impl ContextStore {
    /// Search message content within one chat. Never returns cross-chat
    /// results.
    pub async fn search_messages(
        &self,
        chat_id: &str,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let chat_id = chat_id.to_string();
        let query = query.to_string();
        self.pool
            .interact(move |conn| search_messages_sync(conn, &chat_id, &query, &options))
            .await
    }

    /// Repopulate the search index from the messages table.
    pub async fn rebuild_search_index(&self) -> Result<()> {
        self.pool
            .interact(|conn| super::schema::rebuild_search_index(conn))
            .await
    }
}
