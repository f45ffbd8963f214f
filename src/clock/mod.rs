use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic nanosecond timestamp source.
///
/// Timestamps are anchored to the Unix epoch once, at construction, and then
/// advance with [`Instant`]. Two reads on the same clock never go backwards,
/// even if the host wall clock is stepped mid-run, while the values stay
/// comparable to wall-clock nanoseconds for the datasets.
#[derive(Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_unix_ns: u64,
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("origin_unix_ns", &self.origin_unix_ns)
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

impl Clock {
    /// Create a clock anchored at the current instant.
    pub fn new() -> Self {
        let origin_unix_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(duration_to_ns)
            .unwrap_or(0);

        Self {
            origin: Instant::now(),
            origin_unix_ns,
        }
    }

    /// Current timestamp in nanoseconds since the Unix epoch.
    pub fn now_ns(&self) -> u64 {
        self.origin_unix_ns
            .saturating_add(duration_to_ns(self.origin.elapsed()))
    }

    /// Time elapsed since the clock was created.
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_to_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
