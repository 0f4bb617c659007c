// db/types.rs
// Data structures stored and returned by the context store

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Conversation root. Owns its messages, branches, checkpoints and their
/// search entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Chat row augmented with counts, as returned by `list_chats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatInfo {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
    pub message_count: i64,
    pub branch_count: i64,
}

/// Input for chat creation. Timestamps are stamped by the store.
#[derive(Debug, Clone, Default)]
pub struct NewChat {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub metadata: Option<Value>,
}

/// Field patch for `update_chat`. Only provided fields are written;
/// `metadata` replaces wholesale (callers merge before calling).
#[derive(Debug, Clone, Default)]
pub struct ChatPatch {
    pub title: Option<String>,
    pub metadata: Option<Value>,
}

/// Filter for `list_chats`.
#[derive(Debug, Clone, Default)]
pub struct ListChatsFilter {
    pub user_id: Option<String>,
    pub metadata: Option<MetadataFilter>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Single key/value metadata predicate, matched with JSON-typed equality.
#[derive(Debug, Clone)]
pub struct MetadataFilter {
    pub key: String,
    pub value: Value,
}

/// Immutable DAG node holding one turn's payload. `parent_id` is a weak
/// reference used only for ancestor walks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: Option<String>,
    pub data: Value,
    pub created_at: i64,
}

/// Input for `add_message`. On upsert the stored `chat_id` and
/// `created_at` are preserved.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub chat_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: Option<String>,
    pub data: Value,
}

/// Named head pointer into the message DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub chat_id: String,
    pub name: String,
    pub head_message_id: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
}

/// Branch row augmented with its chain length, as returned by
/// `list_branches`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchInfo {
    pub id: String,
    pub chat_id: String,
    pub name: String,
    pub head_message_id: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
    pub message_count: i64,
}

/// Input for `create_branch`. Omitted `id` gets a fresh UUID.
#[derive(Debug, Clone, Default)]
pub struct NewBranch {
    pub id: Option<String>,
    pub chat_id: String,
    pub name: String,
    pub head_message_id: Option<String>,
    pub is_active: bool,
}

/// Named, immutable pointer to a specific message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub chat_id: String,
    pub name: String,
    pub message_id: String,
    pub created_at: i64,
}

/// Stream state machine states. Terminal states absorb every transition
/// except `reopen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Validation(format!(
                "unknown stream status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one producer's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: String,
    pub status: StreamStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub cancel_requested_at: Option<i64>,
    pub error: Option<String>,
}

/// Input for stream registration. Omitted `created_at` is stamped at
/// insert time; on upsert conflict the stored row wins entirely.
#[derive(Debug, Clone, Default)]
pub struct NewStream {
    pub id: String,
    pub created_at: Option<i64>,
}

/// One ordered element of a stream's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream_id: String,
    pub seq: i64,
    pub data: Value,
    pub created_at: i64,
}

/// Ranked full-text search hit.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub message: Message,
    /// BM25 rank; lower is more relevant.
    pub rank: f64,
    /// Excerpt with matches wrapped in `<mark>…</mark>`.
    pub snippet: String,
}

/// Options for `search_messages`.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Exact-match filter on `Message.name`.
    pub roles: Option<Vec<String>>,
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            roles: None,
            limit: 20,
        }
    }
}

/// One node of a graph dump, with content truncated for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: Option<String>,
    pub preview: String,
    pub created_at: i64,
}

/// Whole-chat dump for visualization, everything ordered by `created_at`
/// ascending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatGraph {
    pub chat_id: String,
    pub nodes: Vec<GraphNode>,
    pub branches: Vec<Branch>,
    pub checkpoints: Vec<Checkpoint>,
}
