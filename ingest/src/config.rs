use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use humantime::parse_duration;
use serde::Deserialize;

use crate::github::{ClientConfig, DEFAULT_API_BASE};
use crate::rate_limit::RateLimiterConfig;
use crate::retry::RetryPolicy;
use crate::writer::WriterConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub github: GitHubConfig,
    pub rate_limit: RateLimitConfig,
    pub writer: WriterConfig,
    pub database: DatabaseConfig,
    pub sources: SourcesConfig,
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_base: String,
    pub token_env: String,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub page_delay: Duration,
    pub fetch_concurrency: usize,
}

impl GitHubConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            api_base: self.api_base.clone(),
            retry: self.retry.clone(),
            page_delay: self.page_delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateBackend {
    File(PathBuf),
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub limiter: RateLimiterConfig,
    pub state: StateBackend,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SourcesConfig {
    pub dir: PathBuf,
    pub category: String,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    github: RawGitHubConfig,
    #[serde(default)]
    rate_limit: RawRateLimitConfig,
    #[serde(default)]
    writer: RawWriterConfig,
    #[serde(default)]
    database: RawDatabaseConfig,
    #[serde(default)]
    sources: RawSourcesConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RawGitHubConfig {
    api_base: Option<String>,
    token_env: Option<String>,
    cache_dir: Option<PathBuf>,
    cache_ttl: Option<String>,
    request_timeout: Option<String>,
    max_retries: Option<u32>,
    max_rate_limit_retries: Option<u32>,
    base_backoff: Option<String>,
    max_backoff: Option<String>,
    page_delay: Option<String>,
    fetch_concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRateLimitConfig {
    hourly_limit: Option<u32>,
    max_burst: Option<u32>,
    base_delay: Option<String>,
    max_delay: Option<String>,
    burst_interval: Option<String>,
    max_retries: Option<u32>,
    admission_timeout: Option<String>,
    reset_interval: Option<String>,
    state: Option<String>,
    state_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWriterConfig {
    batch_size: Option<usize>,
    max_pending: Option<usize>,
    min_batch_interval: Option<String>,
    base_backoff: Option<String>,
    max_backoff: Option<String>,
    max_flush_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDatabaseConfig {
    max_connections: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSourcesConfig {
    dir: Option<PathBuf>,
    category: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;

        let parsed: FileConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse TOML {}", path.display()))?;

        Self::from_raw(parsed)
    }

    fn from_raw(raw: FileConfig) -> Result<Self> {
        let retry_defaults = RetryPolicy::default();
        let gh = raw.github;
        let github = GitHubConfig {
            api_base: gh.api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            token_env: gh.token_env.unwrap_or_else(|| "GITHUB_TOKEN".to_string()),
            cache_dir: gh
                .cache_dir
                .unwrap_or_else(|| PathBuf::from(".ecoindex/cache")),
            cache_ttl: duration_or(gh.cache_ttl, "24h", "github.cache_ttl")?,
            request_timeout: duration_or(gh.request_timeout, "30s", "github.request_timeout")?,
            retry: RetryPolicy {
                max_retries: gh.max_retries.unwrap_or(retry_defaults.max_retries),
                max_rate_limit_retries: gh
                    .max_rate_limit_retries
                    .unwrap_or(retry_defaults.max_rate_limit_retries),
                base_backoff: duration_or(gh.base_backoff, "1s", "github.base_backoff")?,
                max_backoff: duration_or(gh.max_backoff, "60s", "github.max_backoff")?,
            },
            page_delay: duration_or(gh.page_delay, "250ms", "github.page_delay")?,
            fetch_concurrency: gh.fetch_concurrency.unwrap_or(4),
        };

        let limiter_defaults = RateLimiterConfig::default();
        let rl = raw.rate_limit;
        let state = match rl.state.as_deref().unwrap_or("file") {
            "file" => StateBackend::File(
                rl.state_path
                    .unwrap_or_else(|| PathBuf::from(".ecoindex/rate-limiter.json")),
            ),
            "postgres" => StateBackend::Postgres,
            "memory" => StateBackend::Memory,
            other => bail!("rate_limit.state must be one of file, postgres, memory; got '{other}'"),
        };
        let rate_limit = RateLimitConfig {
            limiter: RateLimiterConfig {
                hourly_limit: rl.hourly_limit.unwrap_or(limiter_defaults.hourly_limit),
                max_burst: rl.max_burst.unwrap_or(limiter_defaults.max_burst),
                base_delay: duration_or(rl.base_delay, "100ms", "rate_limit.base_delay")?,
                max_delay: duration_or(rl.max_delay, "5s", "rate_limit.max_delay")?,
                burst_interval: duration_or(rl.burst_interval, "1s", "rate_limit.burst_interval")?,
                max_retries: rl.max_retries.unwrap_or(limiter_defaults.max_retries),
                admission_timeout: duration_or(
                    rl.admission_timeout,
                    "30s",
                    "rate_limit.admission_timeout",
                )?,
                reset_interval: duration_or(rl.reset_interval, "1h", "rate_limit.reset_interval")?,
            },
            state,
        };

        let writer_defaults = WriterConfig::default();
        let wr = raw.writer;
        let writer = WriterConfig {
            batch_size: wr.batch_size.unwrap_or(writer_defaults.batch_size),
            max_pending: wr.max_pending.unwrap_or(writer_defaults.max_pending),
            min_batch_interval: duration_or(
                wr.min_batch_interval,
                "1s",
                "writer.min_batch_interval",
            )?,
            base_backoff: duration_or(wr.base_backoff, "1s", "writer.base_backoff")?,
            max_backoff: duration_or(wr.max_backoff, "30s", "writer.max_backoff")?,
            max_flush_attempts: wr
                .max_flush_attempts
                .unwrap_or(writer_defaults.max_flush_attempts),
        };

        let database = DatabaseConfig {
            max_connections: raw.database.max_connections.unwrap_or(5),
        };

        let sources = SourcesConfig {
            dir: raw
                .sources
                .dir
                .unwrap_or_else(|| PathBuf::from("data/ecosystems")),
            category: raw
                .sources
                .category
                .unwrap_or_else(|| "general".to_string()),
        };

        Ok(Self {
            github,
            rate_limit,
            writer,
            database,
            sources,
        })
    }

    pub fn validate_config(&self) -> Result<()> {
        let gh = &self.github;
        if !(gh.api_base.starts_with("http://") || gh.api_base.starts_with("https://")) {
            bail!("github.api_base must be an http(s) url, got '{}'", gh.api_base);
        }
        if gh.token_env.trim().is_empty() {
            bail!("github.token_env must not be empty");
        }
        if gh.fetch_concurrency == 0 {
            bail!("github.fetch_concurrency must be at least 1");
        }
        if gh.retry.max_backoff < gh.retry.base_backoff {
            bail!("github.max_backoff must not be shorter than github.base_backoff");
        }

        let limiter = &self.rate_limit.limiter;
        if limiter.hourly_limit == 0 {
            bail!("rate_limit.hourly_limit must be greater than zero");
        }
        if limiter.max_burst == 0 {
            bail!("rate_limit.max_burst must be greater than zero");
        }
        if limiter.max_delay < limiter.base_delay {
            bail!("rate_limit.max_delay must not be shorter than rate_limit.base_delay");
        }
        if let StateBackend::File(path) = &self.rate_limit.state {
            if path.as_os_str().is_empty() {
                bail!("rate_limit.state_path must not be empty");
            }
        }

        let writer = &self.writer;
        if writer.batch_size == 0 {
            bail!("writer.batch_size must be greater than zero");
        }
        if writer.max_pending < writer.batch_size {
            bail!(
                "writer.max_pending ({}) must be at least writer.batch_size ({})",
                writer.max_pending,
                writer.batch_size
            );
        }
        if writer.max_flush_attempts == 0 {
            bail!("writer.max_flush_attempts must be greater than zero");
        }

        if self.database.max_connections == 0 {
            bail!("database.max_connections must be greater than zero");
        }
        if self.sources.category.trim().is_empty() {
            bail!("sources.category must not be empty");
        }

        Ok(())
    }
}

fn duration_or(value: Option<String>, default: &str, field: &str) -> Result<Duration> {
    parse_duration_string(value.as_deref().unwrap_or(default), field)
}

fn parse_duration_string(value: &str, field: &str) -> Result<Duration> {
    let duration = parse_duration(value)
        .with_context(|| format!("invalid duration for {field}: '{value}'"))?;

    if duration.is_zero() {
        return Err(anyhow!("duration for {field} must be greater than zero"));
    }

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(raw: &str) -> Result<AppConfig> {
        let parsed: FileConfig = toml::from_str(raw).expect("parse config");
        AppConfig::from_raw(parsed)
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = parse("").expect("normalize");

        assert_eq!(cfg.github.api_base, DEFAULT_API_BASE);
        assert_eq!(cfg.github.cache_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.github.fetch_concurrency, 4);
        assert_eq!(cfg.rate_limit.limiter.hourly_limit, 4500);
        assert_eq!(cfg.rate_limit.limiter.admission_timeout, Duration::from_secs(30));
        assert_eq!(
            cfg.rate_limit.state,
            StateBackend::File(PathBuf::from(".ecoindex/rate-limiter.json"))
        );
        assert_eq!(cfg.writer.batch_size, 50);
        assert_eq!(cfg.writer.max_pending, 500);
        assert_eq!(cfg.database.max_connections, 5);
        assert_eq!(cfg.sources.category, "general");
        cfg.validate_config().expect("defaults are valid");
    }

    #[test]
    fn parses_all_sections() {
        let cfg = parse(
            r#"
            [github]
            api_base = "http://localhost:9000"
            cache_ttl = "2h"
            max_retries = 5
            page_delay = "10ms"
            fetch_concurrency = 8

            [rate_limit]
            hourly_limit = 100
            max_burst = 2
            state = "postgres"

            [writer]
            batch_size = 10
            max_pending = 20
            min_batch_interval = "500ms"

            [database]
            max_connections = 2

            [sources]
            dir = "/srv/ecosystems"
            category = "defi"
            "#,
        )
        .expect("normalize");

        assert_eq!(cfg.github.cache_ttl, Duration::from_secs(7200));
        assert_eq!(cfg.github.retry.max_retries, 5);
        assert_eq!(cfg.github.client_config().page_delay, Duration::from_millis(10));
        assert_eq!(cfg.rate_limit.limiter.max_burst, 2);
        assert_eq!(cfg.rate_limit.state, StateBackend::Postgres);
        assert_eq!(cfg.writer.min_batch_interval, Duration::from_millis(500));
        assert_eq!(cfg.sources.dir, PathBuf::from("/srv/ecosystems"));
        cfg.validate_config().expect("valid");
    }

    #[test]
    fn rejects_zero_duration() {
        let err = parse(
            r#"
            [writer]
            min_batch_interval = "0s"
            "#,
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn rejects_unknown_state_backend() {
        let err = parse(
            r#"
            [rate_limit]
            state = "redis"
            "#,
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("rate_limit.state"));
    }

    #[test]
    fn validation_catches_inconsistent_writer_limits() {
        let cfg = parse(
            r#"
            [writer]
            batch_size = 100
            max_pending = 10
            "#,
        )
        .expect("normalize");
        let err = cfg.validate_config().expect_err("should fail");
        assert!(err.to_string().contains("writer.max_pending"));
    }

    #[test]
    fn validation_rejects_zero_limit() {
        let cfg = parse(
            r#"
            [rate_limit]
            hourly_limit = 0
            "#,
        )
        .expect("normalize");
        assert!(cfg.validate_config().is_err());
    }
}
