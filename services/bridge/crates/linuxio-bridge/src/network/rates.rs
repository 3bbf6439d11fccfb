//! Per-interface throughput rates against a process-wide last-sample cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Sample {
    at: Instant,
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Last-sample map keyed by interface name. The interval floor of one
/// second keeps a rapid double-poll from producing absurd rates.
#[derive(Default)]
pub struct RateCache {
    inner: Mutex<HashMap<String, Sample>>,
}

impl RateCache {
    #[must_use]
    pub fn new() -> Self {
        RateCache::default()
    }

    /// Record the counters for `name` and return (rx, tx) in bytes/second
    /// against the previous sample. The first observation yields zero.
    pub fn rates(&self, name: &str, rx_bytes: u64, tx_bytes: u64, now: Instant) -> (f64, f64) {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let prev = map.insert(
            name.to_string(),
            Sample {
                at: now,
                rx_bytes,
                tx_bytes,
            },
        );
        match prev {
            Some(prev) => {
                let interval = now
                    .saturating_duration_since(prev.at)
                    .max(Duration::from_secs(1));
                let secs = interval.as_secs_f64();
                #[allow(clippy::cast_precision_loss)]
                (
                    rx_bytes.saturating_sub(prev.rx_bytes) as f64 / secs,
                    tx_bytes.saturating_sub(prev.tx_bytes) as f64 / secs,
                )
            }
            None => (0.0, 0.0),
        }
    }
}
