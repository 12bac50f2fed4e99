use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;

/// Wall clock anchored on tokio's monotonic clock.
///
/// Epoch timestamps are derived from `tokio::time::Instant`, so a paused
/// runtime advanced with `tokio::time::advance` moves this clock as well.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_ms: i64,
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    pub fn starting_at(epoch_ms: i64) -> Self {
        Self {
            anchor_ms: epoch_ms,
            anchor: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        let elapsed: i64 = self.anchor.elapsed().as_millis().try_into().unwrap_or(i64::MAX);
        self.anchor_ms.saturating_add(elapsed)
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
