// stream/mod.rs
// Stream persistence pipeline and passive watchers

mod manager;
mod polling;

pub use manager::{ChunkStream, FlushStrategy, PersistOptions, StreamManager, WatchOptions};
pub use polling::{PollEvent, PollState, PollingConfig, TelemetryHook};
