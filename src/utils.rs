// src/utils.rs
// Shared helpers: monotonic clock, preview truncation

use std::sync::atomic::{AtomicI64, Ordering};

/// High-water mark for `now_ms`. Timestamps never repeat or go backwards
/// within a process, even if the wall clock does.
static LAST_MS: AtomicI64 = AtomicI64::new(0);

/// Current time in milliseconds since the Unix epoch, monotonic within
/// this process.
pub fn now_ms() -> i64 {
    let wall = chrono::Utc::now().timestamp_millis();
    let mut prev = LAST_MS.load(Ordering::Relaxed);
    loop {
        let next = wall.max(prev + 1);
        match LAST_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}

/// Truncate a string to at most `max` characters, appending an ellipsis
/// when anything was cut. Char-boundary safe.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_strictly_increasing() {
        let mut last = 0;
        for _ in 0..1000 {
            let t = now_ms();
            assert!(t > last, "timestamps must be strictly increasing");
            last = t;
        }
    }

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate_chars("hello", 50), "hello");
    }

    #[test]
    fn truncate_long_string_appends_ellipsis() {
        let s = "a".repeat(60);
        let out = truncate_chars(&s, 50);
        assert_eq!(out.chars().count(), 51);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn truncate_respects_multibyte_boundaries() {
        let s = "héllo wörld ünïcode çhars over the limit here….".repeat(3);
        let out = truncate_chars(&s, 50);
        assert_eq!(out.chars().count(), 51);
    }
}
