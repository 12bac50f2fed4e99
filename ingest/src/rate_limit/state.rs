use serde::{Deserialize, Serialize};

pub const HOUR_MS: i64 = 3_600_000;
const MINUTE_MS: i64 = 60_000;
/// Look-back of the admission log in whole minutes. The current minute is
/// counted too, so a partially elapsed oldest bucket is never dropped early.
const WINDOW_MINUTES: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounter {
    pub count: u32,
    #[serde(rename = "lastReset")]
    pub last_reset: i64,
}

/// Durable budget shared by every process talking to the GitHub API.
///
/// Field names of the serialized form are a stable on-disk contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterState {
    #[serde(rename = "tokens")]
    pub tokens_remaining: u32,
    #[serde(rename = "resetTime")]
    pub reset_at: i64,
    #[serde(rename = "totalRequestsThisHour", default)]
    pub requests_this_window: u32,
    #[serde(rename = "lastRequestTime", default)]
    pub last_request_at: i64,
    #[serde(rename = "lastStatusLog", default)]
    pub last_status_log: i64,
    #[serde(rename = "lastError", default)]
    pub last_error: Option<LastError>,
    #[serde(rename = "failedPromises", default)]
    pub failures: FailureCounter,
    /// `(minute since epoch, admissions)` buckets for the rolling-hour ceiling.
    #[serde(rename = "admissionLog", default)]
    pub admissions: Vec<(i64, u32)>,
}

impl RateLimiterState {
    pub fn fresh(hourly_limit: u32, now_ms: i64) -> Self {
        Self {
            tokens_remaining: hourly_limit,
            reset_at: now_ms + HOUR_MS,
            requests_this_window: 0,
            last_request_at: 0,
            last_status_log: 0,
            last_error: None,
            failures: FailureCounter {
                count: 0,
                last_reset: now_ms,
            },
            admissions: Vec::new(),
        }
    }

    /// Brings a loaded document back within its invariants: replenishes the
    /// budget once `reset_at` has passed and drops admission buckets older
    /// than the window.
    pub fn refresh(&mut self, hourly_limit: u32, now_ms: i64) {
        self.tokens_remaining = self.tokens_remaining.min(hourly_limit);
        if self.reset_at <= now_ms {
            self.tokens_remaining = hourly_limit;
            self.reset_at = now_ms + HOUR_MS;
        }
        let oldest = minute_of(now_ms) - WINDOW_MINUTES;
        self.admissions.retain(|(minute, _)| *minute >= oldest);
    }

    pub fn admissions_in_window(&self, now_ms: i64) -> u32 {
        let oldest = minute_of(now_ms) - WINDOW_MINUTES;
        self.admissions
            .iter()
            .filter(|(minute, _)| *minute >= oldest)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Remaining admissions permitted right now by both the token budget and
    /// the rolling-hour ceiling.
    pub fn available(&self, hourly_limit: u32, now_ms: i64) -> u32 {
        let window_left = hourly_limit.saturating_sub(self.admissions_in_window(now_ms));
        self.tokens_remaining.min(window_left)
    }

    /// Consumes one unit of budget. Returns `false` without touching the
    /// state when nothing is available.
    pub fn try_admit(&mut self, hourly_limit: u32, now_ms: i64) -> bool {
        self.refresh(hourly_limit, now_ms);
        if self.available(hourly_limit, now_ms) == 0 {
            return false;
        }

        self.tokens_remaining -= 1;
        self.requests_this_window = self.requests_this_window.saturating_add(1);
        self.last_request_at = now_ms;

        let minute = minute_of(now_ms);
        match self.admissions.last_mut() {
            Some((last, count)) if *last == minute => *count += 1,
            _ => self.admissions.push((minute, 1)),
        }
        true
    }

    /// Returns an admission nobody was left to use.
    pub fn refund(&mut self, hourly_limit: u32) {
        self.tokens_remaining = self.tokens_remaining.saturating_add(1).min(hourly_limit);
        self.requests_this_window = self.requests_this_window.saturating_sub(1);
        if let Some((_, count)) = self.admissions.last_mut() {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.admissions.pop();
            }
        }
    }

    /// Reconciles with the budget reported by the API.
    pub fn apply_server_limits(
        &mut self,
        remaining: u32,
        reset_epoch_secs: i64,
        hourly_limit: u32,
        now_ms: i64,
    ) {
        self.tokens_remaining = remaining.min(hourly_limit);
        let reset_ms = reset_epoch_secs.saturating_mul(1000);
        if reset_ms > now_ms {
            self.reset_at = reset_ms;
        } else if self.reset_at <= now_ms {
            self.reset_at = now_ms + HOUR_MS;
        }
    }

    pub fn record_error(&mut self, message: &str, now_ms: i64) {
        self.last_error = Some(LastError {
            message: message.to_string(),
            timestamp: now_ms,
        });
    }

    pub fn record_failure(&mut self, message: &str, now_ms: i64) {
        self.record_error(message, now_ms);
        self.failures.count = self.failures.count.saturating_add(1);
    }

    pub fn hourly_reset(&mut self, now_ms: i64) {
        self.requests_this_window = 0;
        self.failures = FailureCounter {
            count: 0,
            last_reset: now_ms,
        };
        self.last_error = None;
    }

    pub fn budget_used(&self, hourly_limit: u32) -> f64 {
        if hourly_limit == 0 {
            return 1.0;
        }
        f64::from(self.requests_this_window) / f64::from(hourly_limit)
    }
}

fn minute_of(epoch_ms: i64) -> i64 {
    epoch_ms.div_euclid(MINUTE_MS)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn serializes_with_stable_field_names() {
        let mut state = RateLimiterState::fresh(4500, NOW);
        state.record_error("boom", NOW);
        let value = serde_json::to_value(&state).expect("serialize");

        for field in [
            "tokens",
            "resetTime",
            "totalRequestsThisHour",
            "lastRequestTime",
            "lastStatusLog",
            "lastError",
            "failedPromises",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(value["failedPromises"]["lastReset"], NOW);
        assert_eq!(value["lastError"]["message"], "boom");
    }

    #[test]
    fn loads_documents_without_admission_log() {
        let raw = r#"{
            "tokens": 12,
            "resetTime": 1700000600000,
            "totalRequestsThisHour": 30,
            "lastRequestTime": 1699999990000,
            "lastStatusLog": 0,
            "lastError": null,
            "failedPromises": {"count": 2, "lastReset": 1699999000000}
        }"#;
        let state: RateLimiterState = serde_json::from_str(raw).expect("parse");
        assert_eq!(state.tokens_remaining, 12);
        assert_eq!(state.failures.count, 2);
        assert!(state.admissions.is_empty());
    }

    #[test]
    fn refresh_replenishes_after_reset() {
        let mut state = RateLimiterState::fresh(10, NOW);
        state.tokens_remaining = 0;
        state.refresh(10, NOW + HOUR_MS - 1);
        assert_eq!(state.tokens_remaining, 0);

        state.refresh(10, NOW + HOUR_MS);
        assert_eq!(state.tokens_remaining, 10);
        assert!(state.reset_at > NOW + HOUR_MS);
    }

    #[test]
    fn admission_log_caps_rolling_hour() {
        let mut state = RateLimiterState::fresh(3, NOW);
        assert!(state.try_admit(3, NOW));
        assert!(state.try_admit(3, NOW + 1_000));
        assert!(state.try_admit(3, NOW + 2_000));
        assert!(!state.try_admit(3, NOW + 3_000));

        // Tokens come back at reset, but the window still holds the earlier admissions.
        let after_reset = NOW + HOUR_MS + 1;
        state.refresh(3, after_reset);
        assert_eq!(state.tokens_remaining, 3);
        assert!(!state.try_admit(3, after_reset));

        let window_clear = NOW + HOUR_MS + 2 * MINUTE_MS;
        assert!(state.try_admit(3, window_clear));
    }

    #[test]
    fn server_limits_clamp_to_hourly_limit() {
        let mut state = RateLimiterState::fresh(4500, NOW);
        state.apply_server_limits(4999, NOW / 1000 + 600, 4500, NOW);
        assert_eq!(state.tokens_remaining, 4500);
        assert_eq!(state.reset_at, NOW + 600_000);

        state.apply_server_limits(0, 1, 4500, NOW);
        assert_eq!(state.tokens_remaining, 0);
        assert_eq!(state.reset_at, NOW + 600_000);
    }

    #[test]
    fn hourly_reset_clears_counters() {
        let mut state = RateLimiterState::fresh(10, NOW);
        assert!(state.try_admit(10, NOW));
        state.record_failure("oops", NOW);
        state.hourly_reset(NOW + HOUR_MS);

        assert_eq!(state.requests_this_window, 0);
        assert_eq!(state.failures.count, 0);
        assert_eq!(state.failures.last_reset, NOW + HOUR_MS);
        assert!(state.last_error.is_none());
        assert_eq!(state.tokens_remaining, 9);
    }
}
