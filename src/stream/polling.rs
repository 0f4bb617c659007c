// stream/polling.rs
// Adaptive polling: exponential backoff with cap and jitter

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Parameters for an adaptive polling schedule.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub min_ms: u64,
    pub max_ms: u64,
    /// Growth factor applied after each idle probe.
    pub multiplier: f64,
    /// Additive jitter as a fraction of the base delay, in `[0, 1]`.
    pub jitter_ratio: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_ms: 50,
            max_ms: 1000,
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

/// Pure backoff state shared by watchers and the persist cancel probe.
///
/// Successive [`next_delay`](Self::next_delay) calls grow geometrically up
/// to `max_ms`; [`record_activity`](Self::record_activity) snaps back to
/// `min_ms`. The returned delay never exceeds `max_ms`, even at maximum
/// jitter.
#[derive(Debug, Clone)]
pub struct PollState {
    config: PollingConfig,
    current_ms: f64,
}

impl PollState {
    pub fn new(config: PollingConfig) -> Self {
        let current_ms = config.min_ms as f64;
        Self { config, current_ms }
    }

    /// The next delay to sleep; advances the idle backoff.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_ms.clamp(self.config.min_ms as f64, self.config.max_ms as f64);
        let jitter = if self.config.jitter_ratio > 0.0 {
            rand::rng().random_range(0.0..=base * self.config.jitter_ratio)
        } else {
            0.0
        };
        let delay = (base + jitter).min(self.config.max_ms as f64);
        self.current_ms = (self.current_ms * self.config.multiplier).min(self.config.max_ms as f64);
        Duration::from_millis(delay.round() as u64)
    }

    /// Activity observed: reset to the minimum interval.
    pub fn record_activity(&mut self) {
        self.current_ms = self.config.min_ms as f64;
    }
}

/// Telemetry events emitted by the watcher so operators can observe
/// polling behavior. Optional; correctness never depends on a consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// An empty poll; the watcher sleeps `delay_ms` before the next one.
    WatchEmpty { delay_ms: u64 },
    /// A page of chunks was delivered.
    WatchChunks { count: usize },
}

/// Callback receiving [`PollEvent`]s.
pub type TelemetryHook = Arc<dyn Fn(PollEvent) + Send + Sync>;
