// src/lib.rs
// braid - conversational context store: message DAG with Git-like
// branching, durable stream replay, and full-text search

#![allow(clippy::collapsible_if)]
#![allow(clippy::too_many_arguments)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod db;
pub mod error;
pub mod stream;
pub mod utils;

pub use db::{
    Branch, BranchInfo, Chat, ChatGraph, ChatInfo, ChatPatch, Checkpoint, ContextStore,
    DatabasePool, GraphNode, ListChatsFilter, Message, MetadataFilter, NewBranch, NewChat,
    NewMessage, NewStream, PoolStatus, SearchOptions, SearchResult, StreamChunk, StreamRecord,
    StreamStatus,
};
pub use error::{Result, StoreError};
pub use stream::{
    ChunkStream, FlushStrategy, PersistOptions, PollEvent, PollState, PollingConfig,
    StreamManager, TelemetryHook, WatchOptions,
};
