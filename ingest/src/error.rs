use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository identifier '{input}': {reason}")]
pub struct ValidationError {
    pub input: String,
    pub reason: &'static str,
}

impl ValidationError {
    pub fn new(input: impl Into<String>, reason: &'static str) -> Self {
        Self {
            input: input.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    Timeout,
    Exhausted,
    Server,
    Unavailable,
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    #[error("admission for '{key}' timed out after {waited:?}")]
    Timeout { key: String, waited: Duration },
    #[error("admission for '{key}' failed after {attempts} attempts: {message}")]
    Exhausted {
        key: String,
        attempts: u32,
        message: String,
    },
    #[error("GitHub rate limited '{key}' (retry after {retry_after:?})")]
    Server {
        key: String,
        retry_after: Option<Duration>,
    },
    #[error("rate limiter state unavailable while admitting '{key}': {message}")]
    Unavailable { key: String, message: String },
    #[error("rate limiter is shut down")]
    Closed,
}

impl RateLimitError {
    pub fn kind(&self) -> RateLimitKind {
        match self {
            RateLimitError::Timeout { .. } => RateLimitKind::Timeout,
            RateLimitError::Exhausted { .. } => RateLimitKind::Exhausted,
            RateLimitError::Server { .. } => RateLimitKind::Server,
            RateLimitError::Unavailable { .. } => RateLimitKind::Unavailable,
            RateLimitError::Closed => RateLimitKind::Closed,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("state database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("timed out waiting for state lock {}", .0.display())]
    LockTimeout(PathBuf),
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error("request for {resource} failed after {attempts} attempts: {message}")]
    Network {
        resource: String,
        attempts: u32,
        message: String,
    },
    #[error("GitHub returned status {status} for {resource}")]
    Status { resource: String, status: u16 },
    #[error("failed to decode response for {resource}: {source}")]
    Decode {
        resource: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
