//! Continuous-rate bandwidth ceiling.
//!
//! Unlike a token bucket, this model keeps no credit for idle time: each
//! call re-anchors its reference point to "now" rather than accumulating
//! against a fixed start time, so a long idle gap buys at most one
//! oversized chunk, never a standing surplus that later chunks can spend
//! down. This mirrors the original `BandwidthControl.available`, which
//! resets `last_tick` on every call.

use tokio::time::{Duration, Instant};

/// Tracks elapsed time against a ceiling and reports how long the caller
/// must wait before a chunk of a given size may go out. A ceiling of `0`
/// means unlimited: `reserve` always returns `Duration::ZERO`.
#[derive(Debug)]
pub struct BandwidthMeter {
    max_bps: u64,
    last_tick: Instant,
}

impl BandwidthMeter {
    pub fn new(max_bps: u64) -> Self {
        Self {
            max_bps,
            last_tick: Instant::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_bps == 0
    }

    /// Returns how long the caller should wait *before* sending `len`
    /// bytes to stay under the ceiling, and re-anchors the reference point
    /// to now. Call this immediately before writing the chunk; the
    /// returned duration is the delay to apply first.
    pub fn reserve(&mut self, len: usize) -> Duration {
        let now = Instant::now();

        if self.is_unlimited() {
            self.last_tick = now;
            return Duration::ZERO;
        }

        let elapsed = now.saturating_duration_since(self.last_tick);
        let allowed = (elapsed.as_secs_f64() * self.max_bps as f64) as u64;
        self.last_tick = now;

        let len = len as u64;
        if len <= allowed {
            return Duration::ZERO;
        }

        let overage = len - allowed;
        Duration::from_secs_f64(overage as f64 / self.max_bps as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_meter_never_waits() {
        let mut meter = BandwidthMeter::new(0);
        assert_eq!(meter.reserve(1_000_000), Duration::ZERO);
        assert_eq!(meter.reserve(1_000_000), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_buys_exactly_one_chunk_not_standing_credit() {
        let mut meter = BandwidthMeter::new(1_000);

        tokio::time::advance(Duration::from_secs(100)).await;
        // 100s idle at 1000 B/s allows exactly one 100_000-byte chunk through.
        assert_eq!(meter.reserve(100_000), Duration::ZERO);

        // A second chunk sent immediately after has no leftover credit: the
        // full overage must wait, proving idle time was not banked twice.
        let wait = meter.reserve(100_000);
        assert!(wait.as_secs_f64() > 99.0 && wait.as_secs_f64() <= 100.0);
    }

    #[tokio::test]
    async fn burst_over_ceiling_yields_positive_wait() {
        let mut meter = BandwidthMeter::new(1_000);
        let wait = meter.reserve(10_000);
        assert!(wait > Duration::ZERO);
        assert!(wait.as_secs_f64() > 8.0 && wait.as_secs_f64() < 10.0);
    }
}
