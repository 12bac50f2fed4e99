//! Cross-process rate limiter for GitHub API calls.
//!
//! Callers queue up through [`RateLimiter::acquire`] and are admitted in FIFO
//! order by a single drain task per process. The budget itself lives in a
//! [`LimiterStateStore`], so every process sharing that store draws from
//! the same hourly allowance.

pub mod postgres;
pub mod state;
pub mod store;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use postgres::PostgresStateStore;
pub use state::RateLimiterState;
pub use store::{FileStateStore, LimiterStateStore, MemoryStateStore};

use crate::clock::Clock;
use crate::error::{RateLimitError, StateError};
use crate::retry::exponential_backoff;

const STATUS_LOG_INTERVAL_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub hourly_limit: u32,
    pub max_burst: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub burst_interval: Duration,
    pub max_retries: u32,
    pub admission_timeout: Duration,
    pub reset_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            hourly_limit: 4500,
            max_burst: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            burst_interval: Duration::from_secs(1),
            max_retries: 3,
            admission_timeout: Duration::from_secs(30),
            reset_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdmissionState {
    Queued,
    Retrying(u32),
}

struct AdmissionRequest {
    ticket: u64,
    key: String,
    enqueued_at: Instant,
    state: AdmissionState,
    reply: oneshot::Sender<Result<(), RateLimitError>>,
}

#[derive(Default)]
struct AdmissionQueue {
    items: VecDeque<AdmissionRequest>,
    draining: bool,
    closed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub store: String,
    pub hourly_limit: u32,
    pub queued: usize,
    pub draining: bool,
    pub admissions_last_hour: u32,
    pub state: RateLimiterState,
}

struct Inner {
    config: RateLimiterConfig,
    store: Arc<dyn LimiterStateStore>,
    clock: Clock,
    queue: Mutex<AdmissionQueue>,
    wake: Notify,
    next_ticket: AtomicU64,
    cancel: CancellationToken,
}

/// Cheap to clone; all clones share one queue and one drain task.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Builds the limiter and starts its hourly reset task. Must be called
    /// from within a tokio runtime.
    pub fn start(config: RateLimiterConfig, store: Arc<dyn LimiterStateStore>, clock: Clock) -> Self {
        info!(
            stage = "rate_limit",
            event = "limiter.start",
            store = %store.describe(),
            hourly_limit = config.hourly_limit,
            max_burst = config.max_burst,
            "starting rate limiter"
        );

        let inner = Arc::new(Inner {
            config,
            store,
            clock,
            queue: Mutex::new(AdmissionQueue::default()),
            wake: Notify::new(),
            next_ticket: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&inner).run_hourly_reset());
        Self { inner }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    /// Waits for permission to make one API call.
    pub async fn acquire(&self, key: &str) -> Result<(), RateLimitError> {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (reply, mut admitted) = oneshot::channel();
        {
            let mut queue = self.inner.queue.lock().await;
            if queue.closed {
                return Err(RateLimitError::Closed);
            }
            queue.items.push_back(AdmissionRequest {
                ticket,
                key: key.to_string(),
                enqueued_at: Instant::now(),
                state: AdmissionState::Queued,
                reply,
            });
            debug!(
                stage = "rate_limit",
                event = "admission.enqueue",
                key,
                ticket,
                queued = queue.items.len(),
                "queued admission request"
            );
        }
        self.ensure_draining().await;

        let timeout = self.inner.config.admission_timeout;
        match tokio::time::timeout(timeout, &mut admitted).await {
            Ok(outcome) => outcome.unwrap_or(Err(RateLimitError::Closed)),
            Err(_) => {
                let removed = {
                    let mut queue = self.inner.queue.lock().await;
                    match queue.items.iter().position(|r| r.ticket == ticket) {
                        Some(index) => queue.items.remove(index).is_some(),
                        None => false,
                    }
                };
                if !removed {
                    // Popped by the drain task. Closing the receiver makes a
                    // later grant fail to send, and the drain task refunds it.
                    admitted.close();
                    if let Ok(verdict) = admitted.try_recv() {
                        return verdict;
                    }
                }
                warn!(
                    stage = "rate_limit",
                    event = "admission.timeout",
                    key,
                    ticket,
                    waited_ms = timeout.as_millis(),
                    "admission timed out"
                );
                Err(RateLimitError::Timeout {
                    key: key.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    /// Reconciles the shared budget with what the API reported.
    pub async fn update_limits(&self, remaining: u32, reset_epoch_secs: i64) -> Result<(), StateError> {
        let limit = self.inner.config.hourly_limit;
        let clock = self.inner.clock;
        let mut should_log = false;
        let state = self
            .inner
            .store
            .update(&mut |state| {
                let now = clock.now_ms();
                state.apply_server_limits(remaining, reset_epoch_secs, limit, now);
                should_log = remaining < 1000
                    || remaining % 500 == 0
                    || now - state.last_status_log >= STATUS_LOG_INTERVAL_MS;
                if should_log {
                    state.last_status_log = now;
                }
            })
            .await?;

        if should_log {
            info!(
                stage = "rate_limit",
                event = "limiter.budget",
                remaining,
                tokens = state.tokens_remaining,
                reset_at = state.reset_at,
                requests_this_hour = state.requests_this_window,
                "GitHub budget update"
            );
        }

        if remaining > 0 {
            self.inner.wake.notify_one();
            self.ensure_draining().await;
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<LimiterStatus, StateError> {
        let state = self.inner.store.load().await?;
        let (queued, draining) = {
            let queue = self.inner.queue.lock().await;
            (queue.items.len(), queue.draining)
        };
        Ok(LimiterStatus {
            store: self.inner.store.describe(),
            hourly_limit: self.inner.config.hourly_limit,
            queued,
            draining,
            admissions_last_hour: state.admissions_in_window(self.inner.clock.now_ms()),
            state,
        })
    }

    pub async fn queued(&self) -> usize {
        self.inner.queue.lock().await.items.len()
    }

    /// Stops background tasks and rejects every request still waiting.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let pending: Vec<AdmissionRequest> = {
            let mut queue = self.inner.queue.lock().await;
            queue.closed = true;
            queue.items.drain(..).collect()
        };
        info!(
            stage = "rate_limit",
            event = "limiter.shutdown",
            rejected = pending.len(),
            "rate limiter shut down"
        );
        for request in pending {
            let _ = request.reply.send(Err(RateLimitError::Closed));
        }
    }

    async fn ensure_draining(&self) {
        {
            let mut queue = self.inner.queue.lock().await;
            if queue.draining || queue.closed || queue.items.is_empty() {
                return;
            }
            queue.draining = true;
        }
        tokio::spawn(Arc::clone(&self.inner).drain());
    }
}

impl Inner {
    async fn drain(self: Arc<Self>) {
        let limit = self.config.hourly_limit;
        loop {
            if self.cancel.is_cancelled() {
                self.queue.lock().await.draining = false;
                return;
            }

            let state = match self.store.load().await {
                Ok(state) => state,
                Err(err) => {
                    self.fail_all(&err).await;
                    return;
                }
            };

            let queue_len = {
                let mut queue = self.queue.lock().await;
                if queue.items.is_empty() {
                    queue.draining = false;
                    return;
                }
                queue.items.len()
            };

            let burst = self.burst_size(&state, queue_len);
            if burst == 0 {
                debug!(
                    stage = "rate_limit",
                    event = "drain.exhausted",
                    tokens = state.tokens_remaining,
                    reset_at = state.reset_at,
                    queued = queue_len,
                    "budget exhausted, waiting"
                );
                self.pause(self.config.max_delay).await;
                continue;
            }

            let mut last_request_at = state.last_request_at;
            let mut used = state.budget_used(limit);
            for _ in 0..burst {
                let wait = self.adaptive_delay(used).saturating_sub(self.since(last_request_at));
                if !wait.is_zero() && self.sleep_or_cancel(wait).await {
                    break;
                }

                let Some(request) = self.queue.lock().await.items.pop_front() else {
                    break;
                };
                if request.reply.is_closed() {
                    continue;
                }

                let clock = self.clock;
                let mut granted = false;
                let recorded = self
                    .store
                    .update(&mut |state| {
                        granted = state.try_admit(limit, clock.now_ms());
                    })
                    .await;

                match recorded {
                    Ok(updated) if granted => {
                        last_request_at = updated.last_request_at;
                        used = updated.budget_used(limit);
                        debug!(
                            stage = "rate_limit",
                            event = "admission.grant",
                            key = %request.key,
                            ticket = request.ticket,
                            waited_ms = request.enqueued_at.elapsed().as_millis(),
                            tokens = updated.tokens_remaining,
                            "admitted request"
                        );
                        if request.reply.send(Ok(())).is_err() {
                            self.refund(&request.key, request.ticket).await;
                        }
                    }
                    Ok(_) if request.reply.is_closed() => break,
                    Ok(_) => {
                        // Another process took the last of the budget.
                        self.queue.lock().await.items.push_front(request);
                        break;
                    }
                    Err(_) if request.reply.is_closed() => continue,
                    Err(err) => {
                        if self.retry_or_fail(request, err).await {
                            break;
                        }
                    }
                }
            }

            let remaining = self.queue.lock().await.items.len();
            if remaining > 0 {
                let factor = (u32::try_from(remaining).unwrap_or(u32::MAX) / self.config.max_burst.max(1))
                    .saturating_add(1);
                let pause = self
                    .config
                    .burst_interval
                    .saturating_mul(factor)
                    .min(self.config.max_delay);
                self.sleep_or_cancel(pause).await;
            }
        }
    }

    /// Returns `true` when the request went back on the queue.
    async fn retry_or_fail(&self, mut request: AdmissionRequest, err: StateError) -> bool {
        let message = format!("{err:#}");
        let clock = self.clock;
        let attempts = match request.state {
            AdmissionState::Queued => 0,
            AdmissionState::Retrying(n) => n,
        };

        if attempts < self.config.max_retries {
            request.state = AdmissionState::Retrying(attempts + 1);
            warn!(
                stage = "rate_limit",
                event = "admission.retry",
                key = %request.key,
                ticket = request.ticket,
                attempt = attempts + 1,
                error = %message,
                "failed to record admission, requeueing"
            );
            self.queue.lock().await.items.push_back(request);
            if let Err(record_err) = self
                .store
                .update(&mut |state| state.record_error(&message, clock.now_ms()))
                .await
            {
                debug!(stage = "rate_limit", event = "state.record_error", error = %record_err, "could not persist last error");
            }
            let backoff = exponential_backoff(self.config.base_delay, attempts, self.config.max_delay);
            self.sleep_or_cancel(backoff).await;
            return true;
        }

        error!(
            stage = "rate_limit",
            event = "admission.failed",
            key = %request.key,
            ticket = request.ticket,
            attempts = attempts + 1,
            error = %message,
            "giving up on admission"
        );
        let _ = request.reply.send(Err(RateLimitError::Exhausted {
            key: request.key.clone(),
            attempts: attempts + 1,
            message: message.clone(),
        }));
        if let Err(record_err) = self
            .store
            .update(&mut |state| state.record_failure(&message, clock.now_ms()))
            .await
        {
            debug!(stage = "rate_limit", event = "state.record_failure", error = %record_err, "could not persist failure");
        }
        false
    }

    /// Gives back an admission whose caller stopped waiting after it was
    /// recorded.
    async fn refund(&self, key: &str, ticket: u64) {
        let limit = self.config.hourly_limit;
        let result = self.store.update(&mut |state| state.refund(limit)).await;
        match result {
            Ok(_) => debug!(
                stage = "rate_limit",
                event = "admission.refund",
                key,
                ticket,
                "caller gave up, admission refunded"
            ),
            Err(err) => warn!(
                stage = "rate_limit",
                event = "admission.refund",
                result = "error",
                key,
                ticket,
                error = %format!("{err:#}"),
                "could not refund abandoned admission"
            ),
        }
    }

    async fn fail_all(&self, err: &StateError) {
        let message = format!("{err:#}");
        let failed: Vec<AdmissionRequest> = {
            let mut queue = self.queue.lock().await;
            queue.draining = false;
            queue.items.drain(..).collect()
        };
        error!(
            stage = "rate_limit",
            event = "drain.fail_fast",
            rejected = failed.len(),
            error = %message,
            "rate limiter state unavailable, rejecting queued requests"
        );
        for request in failed {
            let _ = request.reply.send(Err(RateLimitError::Unavailable {
                key: request.key,
                message: message.clone(),
            }));
        }
    }

    async fn run_hourly_reset(self: Arc<Self>) {
        let period = self.config.reset_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => self.hourly_reset().await,
            }
        }
    }

    async fn hourly_reset(&self) {
        let clock = self.clock;
        match self.store.load().await {
            Ok(state) => info!(
                stage = "rate_limit",
                event = "limiter.hourly_summary",
                requests = state.requests_this_window,
                failures = state.failures.count,
                tokens = state.tokens_remaining,
                last_error = state.last_error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                "hourly rate limiter summary"
            ),
            Err(err) => warn!(
                stage = "rate_limit",
                event = "limiter.hourly_summary",
                result = "error",
                error = %format!("{err:#}"),
                "could not load rate limiter state for summary"
            ),
        }

        if let Err(err) = self
            .store
            .update(&mut |state| state.hourly_reset(clock.now_ms()))
            .await
        {
            warn!(
                stage = "rate_limit",
                event = "limiter.hourly_reset",
                result = "error",
                error = %format!("{err:#}"),
                "hourly reset failed"
            );
        }
    }

    fn burst_size(&self, state: &RateLimiterState, queue_len: usize) -> u32 {
        let limit = self.config.hourly_limit.max(1);
        let max_burst = self.config.max_burst.max(1);
        let tokens = state.tokens_remaining;
        let proportional = (u64::from(tokens) * u64::from(max_burst)).div_ceil(u64::from(limit));
        let proportional = u32::try_from(proportional).unwrap_or(max_burst);
        let window_left = limit.saturating_sub(state.admissions_in_window(self.clock.now_ms()));
        let queued = u32::try_from(queue_len).unwrap_or(u32::MAX);

        max_burst
            .min(queued)
            .min(proportional)
            .min(tokens)
            .min(window_left)
    }

    fn adaptive_delay(&self, used: f64) -> Duration {
        let factor = if used > 0.95 {
            4.0
        } else if used > 0.9 {
            2.5
        } else if used > 0.8 {
            1.5
        } else {
            1.0
        };
        self.config.base_delay.mul_f64(factor).min(self.config.max_delay)
    }

    fn since(&self, epoch_ms: i64) -> Duration {
        let elapsed = self.clock.now_ms().saturating_sub(epoch_ms);
        Duration::from_millis(u64::try_from(elapsed).unwrap_or(0))
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Returns `true` if cancelled before the sleep finished.
    async fn sleep_or_cancel(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancel.cancelled() => true,
        }
    }
}
