// db/streams.rs
// Stream state rows and the ordered chunk log

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::ContextStore;
use super::codec;
use super::types::{NewStream, StreamChunk, StreamRecord, StreamStatus};
use crate::error::{Result, StoreError, is_unique_violation};
use crate::utils::now_ms;

// ============================================================================
// Sync functions for pool.interact() usage
// ============================================================================

fn read_stream(row: &rusqlite::Row) -> rusqlite::Result<StreamRecord> {
    let status_text: String = row.get(1)?;
    let status = StreamStatus::parse(&status_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(StreamRecord {
        id: row.get(0)?,
        status,
        created_at: row.get(2)?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        cancel_requested_at: row.get(5)?,
        error: row.get(6)?,
    })
}

fn read_chunk(row: &rusqlite::Row) -> rusqlite::Result<StreamChunk> {
    let data_text: String = row.get(2)?;
    let data: Value = serde_json::from_str(&data_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(StreamChunk {
        stream_id: row.get(0)?,
        seq: row.get(1)?,
        data,
        created_at: row.get(3)?,
    })
}

const STREAM_COLUMNS: &str =
    "id, status, created_at, started_at, finished_at, cancel_requested_at, error";

/// Insert a fresh `queued` stream. Fails with `Conflict` on id collision.
pub fn create_stream_sync(conn: &Connection, stream: &NewStream) -> Result<StreamRecord> {
    let created_at = stream.created_at.unwrap_or_else(now_ms);
    conn.execute(
        "INSERT INTO streams (id, status, created_at) VALUES (?1, 'queued', ?2)",
        params![stream.id, created_at],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("stream '{}' already exists", stream.id))
        } else {
            e.into()
        }
    })?;
    Ok(StreamRecord {
        id: stream.id.clone(),
        status: StreamStatus::Queued,
        created_at,
        started_at: None,
        finished_at: None,
        cancel_requested_at: None,
        error: None,
    })
}

/// Insert if absent; otherwise return the existing row byte-identical.
///
/// This is the idempotency primitive producers depend on after restarts:
/// a terminal stream is never reset to `queued` here (only `reopen` does
/// that).
pub fn upsert_stream_sync(
    conn: &mut Connection,
    stream: &NewStream,
) -> Result<(StreamRecord, bool)> {
    let tx = conn.transaction()?;
    let existing = tx
        .query_row(
            &format!("SELECT {STREAM_COLUMNS} FROM streams WHERE id = ?1"),
            [&stream.id],
            read_stream,
        )
        .optional()?;
    if let Some(existing) = existing {
        tx.commit()?;
        return Ok((existing, false));
    }
    let created = create_stream_sync(&tx, stream)?;
    tx.commit()?;
    Ok((created, true))
}

pub fn get_stream_sync(conn: &Connection, id: &str) -> Result<Option<StreamRecord>> {
    conn.query_row(
        &format!("SELECT {STREAM_COLUMNS} FROM streams WHERE id = ?1"),
        [id],
        read_stream,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_stream_status_sync(conn: &Connection, id: &str) -> Result<Option<StreamStatus>> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM streams WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;
    status.as_deref().map(StreamStatus::parse).transpose()
}

/// The single place stream status transitions happen.
///
/// Terminal states absorb: updating a terminal stream is a no-op that
/// returns the stored row, so a `persist` racing an external `cancel` can
/// never overwrite the outcome. Derived timestamps: entering `running`
/// stamps `started_at` (once); entering any terminal state stamps
/// `finished_at`; `failed` records the error, `cancelled` records
/// `cancel_requested_at`. `queued` is reachable only through `reopen`.
pub fn update_stream_status_sync(
    conn: &mut Connection,
    id: &str,
    status: StreamStatus,
    error: Option<&str>,
) -> Result<StreamRecord> {
    if status == StreamStatus::Queued {
        return Err(StoreError::Conflict(format!(
            "stream '{id}' can only return to 'queued' via reopen"
        )));
    }

    let tx = conn.transaction()?;
    let current = tx
        .query_row(
            &format!("SELECT {STREAM_COLUMNS} FROM streams WHERE id = ?1"),
            [id],
            read_stream,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("stream", id))?;

    if current.status.is_terminal() {
        tx.commit()?;
        return Ok(current);
    }

    let now = now_ms();
    let mut next = StreamRecord {
        status,
        ..current
    };
    match status {
        StreamStatus::Running => {
            next.started_at = next.started_at.or(Some(now));
        }
        StreamStatus::Completed => {
            next.finished_at = Some(now);
        }
        StreamStatus::Failed => {
            next.finished_at = Some(now);
            next.error = error.map(str::to_string);
        }
        StreamStatus::Cancelled => {
            next.finished_at = Some(now);
            next.cancel_requested_at = Some(now);
        }
        StreamStatus::Queued => unreachable!("rejected above"),
    }

    tx.execute(
        "UPDATE streams SET status = ?2, started_at = ?3, finished_at = ?4,
                cancel_requested_at = ?5, error = ?6
         WHERE id = ?1",
        params![
            id,
            next.status.as_str(),
            next.started_at,
            next.finished_at,
            next.cancel_requested_at,
            next.error
        ],
    )?;
    tx.commit()?;

    tracing::debug!(stream_id = %id, status = %next.status, "stream transition");
    Ok(next)
}

/// Batch-insert chunks preserving input order. Empty batch is a no-op.
/// A `(stream_id, seq)` collision surfaces as `Conflict`.
pub fn append_chunks_sync(conn: &mut Connection, chunks: &[StreamChunk]) -> Result<()> {
    if chunks.is_empty() {
        return Ok(());
    }
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO stream_chunks (stream_id, seq, data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for chunk in chunks {
            stmt.execute(params![
                chunk.stream_id,
                chunk.seq,
                codec::encode_value(&chunk.data),
                chunk.created_at
            ])
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!(
                        "chunk {}#{} already exists",
                        chunk.stream_id, chunk.seq
                    ))
                } else {
                    StoreError::from(e)
                }
            })?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Chunks with `seq >= from_seq` in ascending order, up to `limit`.
pub fn get_chunks_sync(
    conn: &Connection,
    stream_id: &str,
    from_seq: i64,
    limit: Option<usize>,
) -> Result<Vec<StreamChunk>> {
    let mut stmt = conn.prepare_cached(
        "SELECT stream_id, seq, data, created_at FROM stream_chunks
         WHERE stream_id = ?1 AND seq >= ?2
         ORDER BY seq ASC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(
        params![stream_id, from_seq, limit.map(|l| l as i64).unwrap_or(-1)],
        read_chunk,
    )?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Delete a stream; chunks go with it. Returns true iff a row was
/// deleted.
pub fn delete_stream_sync(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn.execute("DELETE FROM streams WHERE id = ?1", [id])?;
    Ok(rows > 0)
}

/// Reset a terminal stream to `queued`, clearing derived timestamps and
/// the error, and dropping every chunk, atomically. `Conflict` for a
/// `queued`/`running` stream, `NotFound` for an unknown id.
pub fn reopen_stream_sync(conn: &mut Connection, id: &str) -> Result<StreamRecord> {
    let tx = conn.transaction()?;
    let current = tx
        .query_row(
            &format!("SELECT {STREAM_COLUMNS} FROM streams WHERE id = ?1"),
            [id],
            read_stream,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("stream", id))?;

    if !current.status.is_terminal() {
        return Err(StoreError::Conflict(format!(
            "stream '{id}' is {} and cannot be reopened",
            current.status
        )));
    }

    tx.execute(
        "UPDATE streams SET status = 'queued', started_at = NULL, finished_at = NULL,
                cancel_requested_at = NULL, error = NULL
         WHERE id = ?1",
        [id],
    )?;
    tx.execute("DELETE FROM stream_chunks WHERE stream_id = ?1", [id])?;
    tx.commit()?;

    tracing::debug!(stream_id = %id, "stream reopened");
    Ok(StreamRecord {
        status: StreamStatus::Queued,
        started_at: None,
        finished_at: None,
        cancel_requested_at: None,
        error: None,
        ..current
    })
}

// ============================================================================
// ContextStore methods
// ============================================================================

impl ContextStore {
    pub async fn create_stream(&self, stream: NewStream) -> Result<StreamRecord> {
        self.pool
            .interact(move |conn| create_stream_sync(conn, &stream))
            .await
    }

    /// Insert if absent; otherwise return the stored row unchanged.
    pub async fn upsert_stream(&self, stream: NewStream) -> Result<(StreamRecord, bool)> {
        self.pool
            .interact(move |conn| upsert_stream_sync(conn, &stream))
            .await
    }

    pub async fn get_stream(&self, id: &str) -> Result<Option<StreamRecord>> {
        let id = id.to_string();
        self.pool
            .interact(move |conn| get_stream_sync(conn, &id))
            .await
    }

    pub async fn get_stream_status(&self, id: &str) -> Result<Option<StreamStatus>> {
        let id = id.to_string();
        self.pool
            .interact(move |conn| get_stream_status_sync(conn, &id))
            .await
    }

    /// Apply a state-machine transition. Terminal states absorb.
    pub async fn update_stream_status(
        &self,
        id: &str,
        status: StreamStatus,
        error: Option<&str>,
    ) -> Result<StreamRecord> {
        let id = id.to_string();
        let error = error.map(str::to_string);
        self.pool
            .interact(move |conn| update_stream_status_sync(conn, &id, status, error.as_deref()))
            .await
    }

    /// Append a batch of chunks in order.
    pub async fn append_chunks(&self, chunks: Vec<StreamChunk>) -> Result<()> {
        self.pool
            .interact(move |conn| append_chunks_sync(conn, &chunks))
            .await
    }

    pub async fn get_chunks(
        &self,
        stream_id: &str,
        from_seq: i64,
        limit: Option<usize>,
    ) -> Result<Vec<StreamChunk>> {
        let stream_id = stream_id.to_string();
        self.pool
            .interact(move |conn| get_chunks_sync(conn, &stream_id, from_seq, limit))
            .await
    }

    pub async fn delete_stream(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.pool
            .interact(move |conn| delete_stream_sync(conn, &id))
            .await
    }

    /// Reset a terminal stream to `queued` and drop its chunks.
    pub async fn reopen_stream(&self, id: &str) -> Result<StreamRecord> {
        let id = id.to_string();
        self.pool
            .interact(move |conn| reopen_stream_sync(conn, &id))
            .await
    }
}
