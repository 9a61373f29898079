use std::time::{Duration, Instant};

/// Measures transfer speed since the start of the current segment.
///
/// A segment begins when the meter is created or [`reset`](Self::reset),
/// which the scheduler does at every resume so paused time is not counted.
/// Callers pass the clock in, which keeps the meter usable under a paused
/// tokio clock.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    segment_start: Instant,
    segment_bytes: u64,
}

impl ThroughputMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            segment_start: now,
            segment_bytes: 0,
        }
    }

    /// Starts a new segment at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.segment_start = now;
        self.segment_bytes = 0;
    }

    /// Records `bytes` transferred in the current segment.
    pub fn record(&mut self, bytes: u64) {
        self.segment_bytes += bytes;
    }

    pub fn segment_bytes(&self) -> u64 {
        self.segment_bytes
    }

    /// Average bytes/second over the segment. Zero until time has elapsed.
    pub fn bytes_per_second(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.segment_start);
        if elapsed.is_zero() {
            return 0.0;
        }
        self.segment_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` while the speed is zero.
    pub fn eta(&self, remaining_bytes: u64, now: Instant) -> Option<Duration> {
        let speed = self.bytes_per_second(now);
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }
}

/// `round(done / total * 100)`, clamped to 100. An empty total is complete.
pub fn percent_complete(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done as f64 / total as f64 * 100.0).round();
    pct.min(100.0) as u8
}
