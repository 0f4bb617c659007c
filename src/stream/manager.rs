// stream/manager.rs
// StreamManager: producer persistence and passive replay over the chunk log

use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use super::polling::{PollEvent, PollState, PollingConfig, TelemetryHook};
use crate::db::{ContextStore, NewStream, StreamChunk, StreamRecord, StreamStatus};
use crate::error::{Result, StoreError};
use crate::utils::now_ms;

/// Lazy sequence of chunk payloads produced by [`StreamManager::watch`].
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// How `persist` flushes drained chunks into the log.
#[derive(Debug, Clone)]
pub enum FlushStrategy {
    /// One write per source element.
    Immediate,
    /// Buffer until `max_chunks` accumulate or `max_delay` elapses since
    /// the oldest buffered element.
    Batched {
        max_chunks: usize,
        max_delay: Duration,
    },
}

impl Default for FlushStrategy {
    fn default() -> Self {
        Self::Batched {
            max_chunks: 16,
            max_delay: Duration::from_millis(50),
        }
    }
}

/// Options for [`StreamManager::persist`].
#[derive(Debug, Clone, Default)]
pub struct PersistOptions {
    /// Schedule for the cancellation probe.
    pub cancel_polling: PollingConfig,
    pub strategy: FlushStrategy,
}

/// Options for [`StreamManager::watch`].
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub polling: PollingConfig,
    /// Page size for catchup reads.
    pub chunk_page_size: usize,
    /// Re-read status every this many tail iterations (an empty page
    /// always re-reads).
    pub status_check_every: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            polling: PollingConfig::default(),
            chunk_page_size: 64,
            status_check_every: 4,
        }
    }
}

enum DrainEnd {
    Completed,
    Cancelled,
}

/// Coordinates producers writing a stream's chunk log and observers
/// replaying it.
///
/// Producers call [`register`](Self::register) then
/// [`persist`](Self::persist); any number of watchers, including ones on
/// other connections to the same database, call [`watch`](Self::watch)
/// concurrently. The only coordination point is the ordered chunk log.
#[derive(Clone)]
pub struct StreamManager {
    store: ContextStore,
    telemetry: Option<TelemetryHook>,
}

impl StreamManager {
    pub fn new(store: ContextStore) -> Self {
        Self {
            store,
            telemetry: None,
        }
    }

    /// Install a polling telemetry hook.
    pub fn with_telemetry(mut self, hook: TelemetryHook) -> Self {
        self.telemetry = Some(hook);
        self
    }

    fn emit(telemetry: &Option<TelemetryHook>, event: PollEvent) {
        if let Some(hook) = telemetry {
            hook(event);
        }
    }

    /// Idempotently register a stream as `queued`. A second call returns
    /// the stored row unchanged with `false`; terminal streams are never
    /// reset here.
    pub async fn register(&self, stream_id: &str) -> Result<(StreamRecord, bool)> {
        self.store
            .upsert_stream(NewStream {
                id: stream_id.to_string(),
                created_at: None,
            })
            .await
    }

    /// Drain a producer stream into the chunk log.
    ///
    /// If the stream is already terminal this returns immediately without
    /// touching the row or the source. Otherwise the stream transitions to
    /// `running` and elements are appended with `seq = 0, 1, 2, …` per the
    /// flush strategy, while a parallel probe polls for an external
    /// `cancel`. On cancellation the drain flushes what it has buffered
    /// and returns with the stream left `cancelled`; on source or flush
    /// failure the stream is marked `failed` and the error is returned.
    pub async fn persist<S>(
        &self,
        source: S,
        stream_id: &str,
        options: PersistOptions,
    ) -> Result<()>
    where
        S: Stream<Item = anyhow::Result<Value>> + Send,
    {
        let status = self
            .store
            .get_stream_status(stream_id)
            .await?
            .ok_or_else(|| StoreError::not_found("stream", stream_id))?;
        if status.is_terminal() {
            tracing::debug!(stream_id, status = %status, "persist skipped: stream is terminal");
            return Ok(());
        }

        self.store
            .update_stream_status(stream_id, StreamStatus::Running, None)
            .await?;

        // drain -> probe: "I'm done, stop polling".
        // probe -> drain: "cancel observed, stop appending".
        let (done_tx, done_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let probe = tokio::spawn(cancel_probe(
            self.store.clone(),
            stream_id.to_string(),
            options.cancel_polling.clone(),
            done_rx,
            cancel_tx,
        ));

        let drained = self
            .drain(source, stream_id, &options.strategy, cancel_rx)
            .await;

        // Wake the probe immediately so a long probe sleep never delays
        // persist's return.
        let _ = done_tx.send(true);
        let _ = probe.await;

        match drained {
            Ok(DrainEnd::Completed) => {
                self.store
                    .update_stream_status(stream_id, StreamStatus::Completed, None)
                    .await?;
                Ok(())
            }
            Ok(DrainEnd::Cancelled) => Ok(()),
            Err(e) => {
                // Terminal transitions absorb, so a stream cancelled
                // mid-flush stays cancelled; the durability failure is
                // still surfaced.
                let _ = self
                    .store
                    .update_stream_status(stream_id, StreamStatus::Failed, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn drain<S>(
        &self,
        source: S,
        stream_id: &str,
        strategy: &FlushStrategy,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<DrainEnd>
    where
        S: Stream<Item = anyhow::Result<Value>> + Send,
    {
        let (max_chunks, max_delay) = match strategy {
            FlushStrategy::Immediate => (1, None),
            FlushStrategy::Batched {
                max_chunks,
                max_delay,
            } => ((*max_chunks).max(1), Some(*max_delay)),
        };

        let mut source = std::pin::pin!(source);
        let mut seq: i64 = 0;
        let mut batch: Vec<StreamChunk> = Vec::with_capacity(max_chunks);
        let mut flush_deadline: Option<Instant> = None;
        let mut cancel_signal_open = true;

        loop {
            tokio::select! {
                changed = cancel_rx.changed(), if cancel_signal_open => {
                    match changed {
                        Ok(()) if *cancel_rx.borrow() => {
                            // Flush what we have; anything the source emits
                            // after this point is dropped.
                            self.flush(&mut batch).await?;
                            tracing::debug!(stream_id, appended = seq, "drain stopped on cancel");
                            return Ok(DrainEnd::Cancelled);
                        }
                        Ok(()) => {}
                        // Probe exited without signalling; keep draining.
                        Err(_) => cancel_signal_open = false,
                    }
                }
                _ = tokio::time::sleep_until(flush_deadline.unwrap_or_else(Instant::now)),
                    if flush_deadline.is_some() =>
                {
                    self.flush(&mut batch).await?;
                    flush_deadline = None;
                }
                item = source.next() => match item {
                    Some(Ok(data)) => {
                        batch.push(StreamChunk {
                            stream_id: stream_id.to_string(),
                            seq,
                            data,
                            created_at: now_ms(),
                        });
                        seq += 1;
                        if batch.len() >= max_chunks {
                            self.flush(&mut batch).await?;
                            flush_deadline = None;
                        } else if flush_deadline.is_none()
                            && let Some(delay) = max_delay
                        {
                            flush_deadline = Some(Instant::now() + delay);
                        }
                    }
                    Some(Err(e)) => {
                        // Keep the durable prefix if we can; the producer
                        // error is what the caller sees either way.
                        let _ = self.flush(&mut batch).await;
                        return Err(StoreError::Producer(e.to_string()));
                    }
                    None => {
                        self.flush(&mut batch).await?;
                        return Ok(DrainEnd::Completed);
                    }
                },
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<StreamChunk>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let chunks = std::mem::take(batch);
        self.store.append_chunks(chunks).await
    }

    /// Replay a stream's chunks as a lazy sequence of payloads.
    ///
    /// Catches up page by page, then tails with adaptive backoff until the
    /// stream is terminal and fully drained, or the stream is deleted
    /// mid-watch (either closes the sequence normally). Watching is
    /// passive: dropping the sequence never mutates the stream.
    pub async fn watch(&self, stream_id: &str, options: WatchOptions) -> Result<ChunkStream> {
        // Fail fast on unknown streams before handing out a sequence.
        self.store
            .get_stream(stream_id)
            .await?
            .ok_or_else(|| StoreError::not_found("stream", stream_id))?;

        let store = self.store.clone();
        let telemetry = self.telemetry.clone();
        let id = stream_id.to_string();

        let stream = try_stream! {
            let mut poll = PollState::new(options.polling.clone());
            let mut from_seq: i64 = 0;
            let mut since_status_check = 0usize;

            loop {
                let page = store
                    .get_chunks(&id, from_seq, Some(options.chunk_page_size))
                    .await?;
                let full_page = page.len() == options.chunk_page_size;
                let got = page.len();

                if got > 0 {
                    poll.record_activity();
                    Self::emit(&telemetry, PollEvent::WatchChunks { count: got });
                    for chunk in page {
                        from_seq = chunk.seq + 1;
                        yield chunk.data;
                    }
                }
                if full_page {
                    // More may be immediately available; skip the sleep.
                    continue;
                }

                since_status_check += 1;
                if got == 0 || since_status_check >= options.status_check_every {
                    since_status_check = 0;
                    match store.get_stream_status(&id).await? {
                        // Deleted mid-watch: close normally.
                        None => break,
                        Some(status) if status.is_terminal() => {
                            // Drain anything that landed between the page
                            // read and the status read, then close.
                            let rest = store.get_chunks(&id, from_seq, None).await?;
                            for chunk in rest {
                                yield chunk.data;
                            }
                            break;
                        }
                        Some(_) => {}
                    }
                }

                let delay = poll.next_delay();
                if got == 0 {
                    Self::emit(
                        &telemetry,
                        PollEvent::WatchEmpty {
                            delay_ms: delay.as_millis() as u64,
                        },
                    );
                }
                tokio::time::sleep(delay).await;
            }
        };

        Ok(Box::pin(stream))
    }

    /// Request cancellation. A running `persist` stops appending within
    /// one polling cycle. No-op if the stream is already terminal.
    pub async fn cancel(&self, stream_id: &str) -> Result<StreamRecord> {
        self.store
            .update_stream_status(stream_id, StreamStatus::Cancelled, None)
            .await
    }

    /// Delete the stream and its chunks.
    pub async fn cleanup(&self, stream_id: &str) -> Result<bool> {
        self.store.delete_stream(stream_id).await
    }

    /// Reset a terminal stream to `queued`, dropping its chunks.
    pub async fn reopen(&self, stream_id: &str) -> Result<(StreamRecord, bool)> {
        let record = self.store.reopen_stream(stream_id).await?;
        Ok((record, true))
    }
}

/// Poll stream status on the adaptive schedule until cancellation is
/// observed, the stream reaches another terminal state or disappears, or
/// the drain loop reports completion via `done_rx`.
async fn cancel_probe(
    store: ContextStore,
    stream_id: String,
    config: PollingConfig,
    mut done_rx: watch::Receiver<bool>,
    cancel_tx: watch::Sender<bool>,
) {
    let mut poll = PollState::new(config);
    loop {
        let delay = poll.next_delay();
        tokio::select! {
            _ = done_rx.changed() => break,
            _ = tokio::time::sleep(delay) => {
                match store.get_stream_status(&stream_id).await {
                    Ok(Some(StreamStatus::Cancelled)) => {
                        tracing::debug!(stream_id = %stream_id, "cancel observed by probe");
                        let _ = cancel_tx.send(true);
                        break;
                    }
                    // Some other terminal transition won; nothing to signal.
                    Ok(Some(status)) if status.is_terminal() => break,
                    Ok(Some(_)) => {}
                    // Stream deleted out from under the producer.
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(stream_id = %stream_id, "cancel probe poll failed: {}", e);
                    }
                }
            }
        }
    }
}
