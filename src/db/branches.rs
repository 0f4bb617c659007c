// db/branches.rs
// Branch pointers: create/activate/head updates, plus rewind composition

use rusqlite::{Connection, OptionalExtension, Transaction, params};

use super::ContextStore;
use super::messages::chain_len_sync;
use super::types::{Branch, BranchInfo, NewBranch};
use crate::error::{Result, StoreError, is_unique_violation};
use crate::utils::now_ms;

// ============================================================================
// Sync functions for pool.interact() usage
// ============================================================================

fn read_branch(row: &rusqlite::Row) -> rusqlite::Result<Branch> {
    Ok(Branch {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        name: row.get(2)?,
        head_message_id: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

const BRANCH_COLUMNS: &str = "id, chat_id, name, head_message_id, is_active, created_at";

/// Create a branch. `(chat_id, name)` must be unique. When the new branch
/// is active, every other branch of the chat is deactivated in the same
/// transaction.
pub fn create_branch_sync(conn: &mut Connection, branch: &NewBranch) -> Result<Branch> {
    let tx = conn.transaction()?;
    let created = insert_branch_tx(&tx, branch)?;
    tx.commit()?;
    Ok(created)
}

fn insert_branch_tx(tx: &Transaction, branch: &NewBranch) -> Result<Branch> {
    let chat_exists: bool = tx
        .query_row("SELECT 1 FROM chats WHERE id = ?1", [&branch.chat_id], |_| {
            Ok(true)
        })
        .optional()?
        .unwrap_or(false);
    if !chat_exists {
        return Err(StoreError::not_found("chat", &branch.chat_id));
    }

    if branch.is_active {
        tx.execute(
            "UPDATE branches SET is_active = 0 WHERE chat_id = ?1",
            [&branch.chat_id],
        )?;
    }

    let id = branch
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let now = now_ms();
    tx.execute(
        "INSERT INTO branches (id, chat_id, name, head_message_id, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            branch.chat_id,
            branch.name,
            branch.head_message_id,
            branch.is_active,
            now
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!(
                "branch '{}' already exists in chat '{}'",
                branch.name, branch.chat_id
            ))
        } else {
            e.into()
        }
    })?;

    Ok(Branch {
        id,
        chat_id: branch.chat_id.clone(),
        name: branch.name.clone(),
        head_message_id: branch.head_message_id.clone(),
        is_active: branch.is_active,
        created_at: now,
    })
}

pub fn get_branch_sync(conn: &Connection, chat_id: &str, name: &str) -> Result<Option<Branch>> {
    conn.query_row(
        &format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE chat_id = ?1 AND name = ?2"),
        params![chat_id, name],
        read_branch,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_active_branch_sync(conn: &Connection, chat_id: &str) -> Result<Option<Branch>> {
    conn.query_row(
        &format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE chat_id = ?1 AND is_active = 1"),
        [chat_id],
        read_branch,
    )
    .optional()
    .map_err(Into::into)
}

/// Deactivate all branches of the chat, then activate the target in one
/// transaction, so no reader ever sees zero or two active branches.
pub fn set_active_branch_sync(
    conn: &mut Connection,
    chat_id: &str,
    branch_id: &str,
) -> Result<Branch> {
    let tx = conn.transaction()?;
    let target: Option<Branch> = tx
        .query_row(
            &format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?1 AND chat_id = ?2"),
            params![branch_id, chat_id],
            read_branch,
        )
        .optional()?;
    let Some(mut target) = target else {
        return Err(StoreError::not_found("branch", branch_id));
    };

    tx.execute(
        "UPDATE branches SET is_active = 0 WHERE chat_id = ?1",
        [chat_id],
    )?;
    tx.execute(
        "UPDATE branches SET is_active = 1 WHERE id = ?1",
        [branch_id],
    )?;
    tx.commit()?;

    target.is_active = true;
    Ok(target)
}

/// Point a branch at a new head (or clear it with `None`).
pub fn update_branch_head_sync(
    conn: &Connection,
    branch_id: &str,
    head_message_id: Option<&str>,
) -> Result<Branch> {
    let rows = conn.execute(
        "UPDATE branches SET head_message_id = ?2 WHERE id = ?1",
        params![branch_id, head_message_id],
    )?;
    if rows == 0 {
        return Err(StoreError::not_found("branch", branch_id));
    }
    conn.query_row(
        &format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?1"),
        [branch_id],
        read_branch,
    )
    .map_err(Into::into)
}

/// Plain branch rows for a chat, oldest first.
pub(crate) fn list_branch_rows_sync(conn: &Connection, chat_id: &str) -> Result<Vec<Branch>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BRANCH_COLUMNS} FROM branches WHERE chat_id = ?1 ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map([chat_id], read_branch)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Branches of a chat with their chain lengths (messages reachable from
/// each head).
pub fn list_branches_sync(conn: &Connection, chat_id: &str) -> Result<Vec<BranchInfo>> {
    let branches = list_branch_rows_sync(conn, chat_id)?;
    let mut out = Vec::with_capacity(branches.len());
    for b in branches {
        let message_count = match b.head_message_id.as_deref() {
            Some(head) => chain_len_sync(conn, head)?,
            None => 0,
        };
        out.push(BranchInfo {
            id: b.id,
            chat_id: b.chat_id,
            name: b.name,
            head_message_id: b.head_message_id,
            is_active: b.is_active,
            created_at: b.created_at,
            message_count,
        });
    }
    Ok(out)
}

/// Rewind: create a fresh branch pointing at `message_id` and make it
/// active, leaving existing branches intact.
///
/// The new branch is named `"<base>-v<n>"` where base is the active
/// branch's name and `n` is the branch count plus one.
pub fn rewind_to_message_sync(
    conn: &mut Connection,
    chat_id: &str,
    message_id: &str,
) -> Result<Branch> {
    let tx = conn.transaction()?;

    let belongs: bool = tx
        .query_row(
            "SELECT 1 FROM messages WHERE id = ?1 AND chat_id = ?2",
            params![message_id, chat_id],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if !belongs {
        return Err(StoreError::not_found("message", message_id));
    }

    let base: String = tx
        .query_row(
            "SELECT name FROM branches WHERE chat_id = ?1 AND is_active = 1",
            [chat_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or_else(|| "branch".to_string());
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM branches WHERE chat_id = ?1",
        [chat_id],
        |row| row.get(0),
    )?;

    let created = insert_branch_tx(
        &tx,
        &NewBranch {
            id: None,
            chat_id: chat_id.to_string(),
            name: format!("{}-v{}", base, count + 1),
            head_message_id: Some(message_id.to_string()),
            is_active: true,
        },
    )?;
    tx.commit()?;

    tracing::debug!(chat_id = %chat_id, branch = %created.name, "rewound to message");
    Ok(created)
}

// ============================================================================
// ContextStore methods
// ============================================================================

impl ContextStore {
    pub async fn create_branch(&self, branch: NewBranch) -> Result<Branch> {
        self.pool
            .interact(move |conn| create_branch_sync(conn, &branch))
            .await
    }

    pub async fn get_branch(&self, chat_id: &str, name: &str) -> Result<Option<Branch>> {
        let chat_id = chat_id.to_string();
        let name = name.to_string();
        self.pool
            .interact(move |conn| get_branch_sync(conn, &chat_id, &name))
            .await
    }

    pub async fn get_active_branch(&self, chat_id: &str) -> Result<Option<Branch>> {
        let chat_id = chat_id.to_string();
        self.pool
            .interact(move |conn| get_active_branch_sync(conn, &chat_id))
            .await
    }

    /// Switch the chat's active branch atomically.
    pub async fn set_active_branch(&self, chat_id: &str, branch_id: &str) -> Result<Branch> {
        let chat_id = chat_id.to_string();
        let branch_id = branch_id.to_string();
        self.pool
            .interact(move |conn| set_active_branch_sync(conn, &chat_id, &branch_id))
            .await
    }

    pub async fn update_branch_head(
        &self,
        branch_id: &str,
        head_message_id: Option<&str>,
    ) -> Result<Branch> {
        let branch_id = branch_id.to_string();
        let head = head_message_id.map(str::to_string);
        self.pool
            .interact(move |conn| update_branch_head_sync(conn, &branch_id, head.as_deref()))
            .await
    }

    pub async fn list_branches(&self, chat_id: &str) -> Result<Vec<BranchInfo>> {
        let chat_id = chat_id.to_string();
        self.pool
            .interact(move |conn| list_branches_sync(conn, &chat_id))
            .await
    }

    /// Create and activate a new branch headed at `message_id`.
    pub async fn rewind_to_message(&self, chat_id: &str, message_id: &str) -> Result<Branch> {
        let chat_id = chat_id.to_string();
        let message_id = message_id.to_string();
        self.pool
            .interact(move |conn| rewind_to_message_sync(conn, &chat_id, &message_id))
            .await
    }

    /// Restore a checkpoint: rewind to its message.
    pub async fn restore_checkpoint(&self, chat_id: &str, name: &str) -> Result<Branch> {
        let chat_id = chat_id.to_string();
        let name = name.to_string();
        self.pool
            .interact(move |conn| {
                let cp = super::checkpoints::get_checkpoint_sync(conn, &chat_id, &name)?
                    .ok_or_else(|| StoreError::not_found("checkpoint", &name))?;
                rewind_to_message_sync(conn, &chat_id, &cp.message_id)
            })
            .await
    }
}
