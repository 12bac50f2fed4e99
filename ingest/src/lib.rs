//! Ingestion core for ecosystem repository listings: a persistent GitHub rate
//! limiter, a caching fetch client and a batching Postgres writer.

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod github;
pub mod logging;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod source;
pub mod writer;

#[cfg(test)]
mod test_support;
