//! Batching upsert writer in front of a [`RepoStore`].

pub mod postgres;
pub mod store;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ecoindex_types::PendingRecord;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use postgres::PostgresStore;
pub use store::{MemoryStore, RepoStore};

use crate::clock::Clock;
use crate::error::WriteError;
use crate::retry::exponential_backoff;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub max_pending: usize,
    pub min_batch_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_flush_attempts: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_pending: 500,
            min_batch_interval: Duration::from_secs(1),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_flush_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Idle,
    InProgress,
    Written(usize),
}

#[derive(Default)]
struct WriterState {
    pending: VecDeque<PendingRecord>,
    /// Ecosystem to lower-cased keys already stored or written this run.
    processed: HashMap<String, HashSet<String>>,
    written_at: HashMap<String, DateTime<Utc>>,
    last_flush: Option<Instant>,
    consecutive_failures: u32,
}

impl WriterState {
    fn mark_processed(&mut self, pending: &PendingRecord) {
        let keys = self.processed.entry(pending.ecosystem.clone()).or_default();
        keys.insert(pending.key());
        if let Some(alias) = &pending.listed_as {
            keys.insert(alias.clone());
        }
    }
}

pub struct BatchWriter {
    store: Arc<dyn RepoStore>,
    config: WriterConfig,
    clock: Clock,
    state: Mutex<WriterState>,
    /// Set while one flush owns the head of `pending`.
    processing: AtomicBool,
    flushed: Notify,
}

/// Releases the flush slot even when the flushing future is dropped.
struct FlushSlot<'a> {
    writer: &'a BatchWriter,
}

impl Drop for FlushSlot<'_> {
    fn drop(&mut self) {
        self.writer.processing.store(false, Ordering::Release);
        self.writer.flushed.notify_waiters();
    }
}

impl BatchWriter {
    pub fn new(store: Arc<dyn RepoStore>, config: WriterConfig, clock: Clock) -> Self {
        Self {
            store,
            config,
            clock,
            state: Mutex::new(WriterState::default()),
            processing: AtomicBool::new(false),
            flushed: Notify::new(),
        }
    }

    /// Seeds the processed set with what the store already holds for
    /// `ecosystem`. Returns the number of known repositories.
    pub async fn initialize(&self, ecosystem: &str) -> Result<usize, WriteError> {
        let start = std::time::Instant::now();
        let keys = self.store.existing_keys(ecosystem).await?;
        let count = keys.len();
        self.state
            .lock()
            .await
            .processed
            .entry(ecosystem.to_string())
            .or_default()
            .extend(keys);
        info!(
            stage = "writer",
            event = "writer.initialize",
            ecosystem,
            known = count,
            duration_ms = start.elapsed().as_millis(),
            "loaded persisted repositories"
        );
        Ok(count)
    }

    pub async fn is_processed(&self, ecosystem: &str, key: &str) -> bool {
        self.state
            .lock()
            .await
            .processed
            .get(ecosystem)
            .is_some_and(|keys| keys.contains(&key.to_ascii_lowercase()))
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn last_written(&self, key: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .written_at
            .get(&key.to_ascii_lowercase())
            .copied()
    }

    /// Queues one record for persistence. Write failures are logged here and
    /// the records stay queued for the next flush.
    pub async fn enqueue(&self, pending: PendingRecord) -> EnqueueOutcome {
        let key = pending.key();
        if self.is_processed(&pending.ecosystem, &key).await {
            debug!(stage = "writer", event = "writer.skip", repo = %key, "already persisted");
            return EnqueueOutcome::Skipped;
        }

        self.relieve_backpressure().await;

        let batch_full = {
            let mut state = self.state.lock().await;
            state.pending.push_back(pending);
            state.pending.len() >= self.config.batch_size
        };
        if batch_full {
            self.flush_logged().await;
        }
        EnqueueOutcome::Queued
    }

    /// Single flush attempt. Records leave the queue only after the store
    /// commits them, so dropping this future loses nothing.
    pub async fn flush(&self) -> Result<FlushOutcome, WriteError> {
        let wait = {
            let state = self.state.lock().await;
            if state.pending.is_empty() {
                return Ok(FlushOutcome::Idle);
            }
            if self.processing.swap(true, Ordering::AcqRel) {
                return Ok(FlushOutcome::InProgress);
            }
            state
                .last_flush
                .map(|at| self.config.min_batch_interval.saturating_sub(at.elapsed()))
                .unwrap_or_default()
        };
        let _slot = FlushSlot { writer: self };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        // Enqueue only appends, so the head stays ours until the slot is released.
        let batch: Vec<PendingRecord> = self.state.lock().await.pending.iter().cloned().collect();
        let start = std::time::Instant::now();
        match self.store.upsert_batch(&batch).await {
            Ok(()) => {
                let written_at = self.clock.now();
                {
                    let mut state = self.state.lock().await;
                    let committed = batch.len().min(state.pending.len());
                    state.pending.drain(..committed);
                    for pending in &batch {
                        state.written_at.insert(pending.key(), written_at);
                        state.mark_processed(pending);
                    }
                    state.last_flush = Some(Instant::now());
                    state.consecutive_failures = 0;
                }
                info!(
                    stage = "writer",
                    event = "writer.flush",
                    result = "ok",
                    written = batch.len(),
                    duration_ms = start.elapsed().as_millis(),
                    "flushed batch"
                );
                Ok(FlushOutcome::Written(batch.len()))
            }
            Err(err) => {
                let size = batch.len();
                let (backoff, backlog, failures) = {
                    let mut state = self.state.lock().await;
                    state.consecutive_failures += 1;
                    state.last_flush = Some(Instant::now());
                    let backlog = state.pending.len();
                    (
                        self.failure_backoff(state.consecutive_failures, backlog),
                        backlog,
                        state.consecutive_failures,
                    )
                };
                error!(
                    stage = "writer",
                    event = "writer.flush",
                    result = "error",
                    batch = size,
                    backlog,
                    consecutive_failures = failures,
                    backoff_ms = backoff.as_millis(),
                    error = %format!("{err:#}"),
                    "batch write failed, records stay queued"
                );
                tokio::time::sleep(backoff).await;
                Err(err)
            }
        }
    }

    /// Flushes until nothing is pending. Gives up after
    /// `max_flush_attempts` consecutive failures; the records stay queued.
    pub async fn flush_all(&self) -> Result<(), WriteError> {
        let mut failures = 0u32;
        loop {
            match self.flush().await {
                Ok(FlushOutcome::Idle) => return Ok(()),
                Ok(FlushOutcome::Written(_)) => failures = 0,
                Ok(FlushOutcome::InProgress) => self.wait_for_flush().await,
                Err(err) => {
                    failures += 1;
                    if failures >= self.config.max_flush_attempts {
                        warn!(
                            stage = "writer",
                            event = "writer.flush_all",
                            result = "error",
                            attempts = failures,
                            pending = self.pending_len().await,
                            "giving up on flush, records remain queued"
                        );
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn relieve_backpressure(&self) {
        loop {
            if self.pending_len().await < self.config.max_pending {
                return;
            }
            match self.flush().await {
                Ok(FlushOutcome::InProgress) => self.wait_for_flush().await,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        stage = "writer",
                        event = "writer.backpressure",
                        result = "error",
                        error = %format!("{err:#}"),
                        "flush under backpressure failed"
                    );
                    return;
                }
            }
        }
    }

    async fn flush_logged(&self) {
        // Failures are already logged by flush(); the batch stays queued.
        let _ = self.flush().await;
    }

    async fn wait_for_flush(&self) {
        let notified = self.flushed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.processing.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    fn failure_backoff(&self, failures: u32, backlog: usize) -> Duration {
        let base = exponential_backoff(
            self.config.base_backoff,
            failures.saturating_sub(1),
            self.config.max_backoff,
        );
        let scale = backlog.div_ceil(self.config.batch_size.max(1)).max(1);
        base.saturating_mul(u32::try_from(scale).unwrap_or(u32::MAX))
            .min(self.config.max_backoff)
    }
}
