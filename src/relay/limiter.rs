use std::time::Duration;

use tokio::time::Instant;

/// Leaky bucket of one: a frame is admitted only if at least
/// `1s / max_fps` has passed since the previous admission. Nothing is
/// queued or delayed.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_admitted: Option<Instant>,
    admitted: u64,
    dropped: u64,
}

impl RateLimiter {
    pub fn new(max_fps: u32) -> Self {
        Self {
            min_interval: Self::interval_for(max_fps),
            last_admitted: None,
            admitted: 0,
            dropped: 0,
        }
    }

    fn interval_for(max_fps: u32) -> Duration {
        Duration::from_secs(1) / max_fps.max(1)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        let due = match self.last_admitted {
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
            None => true,
        };

        if due {
            self.last_admitted = Some(now);
            self.admitted += 1;
        } else {
            self.dropped += 1;
        }
        due
    }

    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
