//! Tokio-backed time source
//!
//! Anchored to the wall clock at construction and advanced by the tokio
//! clock afterwards, so nodes running under a paused test runtime see
//! simulated time move exactly as their timers do.

use blehome_core::{SystemTimeSource, TimeSource, Timestamp};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TokioTimeSource {
    anchor: Timestamp,
    started: Instant,
}

impl TokioTimeSource {
    pub fn new() -> Self {
        Self {
            anchor: SystemTimeSource.now(),
            started: Instant::now(),
        }
    }
}

impl Default for TokioTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TokioTimeSource {
    fn now(&self) -> Timestamp {
        self.anchor + self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_follows_paused_tokio_clock() {
        let clock = TokioTimeSource::new();
        let before = clock.now();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(clock.now().duration_since(before), Duration::from_secs(5));
    }
}
