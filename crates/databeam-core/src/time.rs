//! Time access used across the platform.
//!
//! Sample timestamps are wall-clock nanoseconds since the Unix epoch; query
//! deadlines and decimation deltas are measured against a monotonic clock so
//! they survive wall-clock adjustments.

use chrono::{DateTime, Utc};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Clock facade. Stateless except for the monotonic reference point.
#[derive(Debug, Clone)]
pub struct TimeSource {
    started: Instant,
}

impl TimeSource {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Wall-clock nanoseconds since the Unix epoch.
    pub fn now_ns() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    /// Monotonic nanoseconds since this source was created.
    pub fn monotonic_ns(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }

    /// Compact timestamp suitable for filenames: `YYYYMMDD_HHMMSS`.
    pub fn now_file_str() -> String {
        let now: DateTime<Utc> = Utc::now();
        now.format("%Y%m%d_%H%M%S").to_string()
    }

    /// Time-of-day string for UI log entries: `HH:MM:SS`.
    pub fn now_time_only_str() -> String {
        let now: DateTime<Utc> = Utc::now();
        now.format("%H:%M:%S").to_string()
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}
