//! GitHub REST client: cache first, then rate-limited requests with retry.

pub mod cache;
pub mod id;
pub mod models;
pub mod transport;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ecoindex_types::{Contributor, LanguageStats, RepositoryRecord};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

pub use cache::{ResourceKind, ResponseCache};
pub use id::RepoId;
pub use transport::{ApiResponse, ApiTransport, ReqwestTransport, TransportError};

use crate::clock::Clock;
use crate::error::{FetchError, RateLimitError};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use models::{ApiContributor, ApiRepository};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: String,
    pub retry: RetryPolicy,
    pub page_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            retry: RetryPolicy::default(),
            page_delay: Duration::from_millis(250),
        }
    }
}

enum Outcome {
    Success,
    NotFound,
    RateLimited(Option<Duration>),
    Transient,
    Fatal,
}

pub struct GitHubClient {
    transport: Arc<dyn ApiTransport>,
    limiter: RateLimiter,
    cache: ResponseCache,
    config: ClientConfig,
    clock: Clock,
}

impl GitHubClient {
    pub fn new(
        transport: Arc<dyn ApiTransport>,
        limiter: RateLimiter,
        cache: ResponseCache,
        config: ClientConfig,
        clock: Clock,
    ) -> Self {
        Self {
            transport,
            limiter,
            cache,
            config: ClientConfig {
                api_base: config.api_base.trim_end_matches('/').to_string(),
                ..config
            },
            clock,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub async fn fetch_repository(&self, input: &str) -> Result<Option<RepositoryRecord>, FetchError> {
        let id = RepoId::parse(input)?;
        self.repository(&id).await
    }

    pub async fn fetch_contributors(&self, input: &str) -> Result<Option<Vec<Contributor>>, FetchError> {
        let id = RepoId::parse(input)?;
        self.contributors(&id).await
    }

    pub async fn fetch_languages(&self, input: &str) -> Result<Option<LanguageStats>, FetchError> {
        let id = RepoId::parse(input)?;
        self.languages(&id).await
    }

    /// Repository metadata with contributors and languages attached.
    ///
    /// A missing repository is `Ok(None)`. Failures of the two secondary
    /// resources leave the corresponding field `None` so the stored rows for
    /// them are kept as they are.
    pub async fn fetch_all(&self, input: &str) -> Result<Option<RepositoryRecord>, FetchError> {
        let id = RepoId::parse(input)?;
        let Some(mut record) = self.repository(&id).await? else {
            return Ok(None);
        };

        match self.contributors(&id).await {
            Ok(contributors) => record.contributors = contributors,
            Err(err) => warn!(
                stage = "fetch",
                event = "fetch.contributors",
                result = "error",
                repo = %id,
                error = %format!("{err:#}"),
                "contributors unavailable, keeping stored list"
            ),
        }
        match self.languages(&id).await {
            Ok(languages) => record.languages = languages,
            Err(err) => warn!(
                stage = "fetch",
                event = "fetch.languages",
                result = "error",
                repo = %id,
                error = %format!("{err:#}"),
                "languages unavailable, keeping stored stats"
            ),
        }
        Ok(Some(record))
    }

    async fn repository(&self, id: &RepoId) -> Result<Option<RepositoryRecord>, FetchError> {
        if let Some(record) = self.cache.get(id, ResourceKind::Repository).await {
            return Ok(Some(record));
        }

        let resource = id.full_name();
        let url = format!("{}/repos/{}/{}", self.config.api_base, id.owner, id.name);
        let Some(response) = self.get_with_retry(&url, &resource).await? else {
            return Ok(None);
        };
        let record = decode::<ApiRepository>(&response, &resource)?.into_record();
        self.cache.put(id, ResourceKind::Repository, &record).await;
        Ok(Some(record))
    }

    async fn contributors(&self, id: &RepoId) -> Result<Option<Vec<Contributor>>, FetchError> {
        if let Some(list) = self.cache.get(id, ResourceKind::Contributors).await {
            return Ok(Some(list));
        }

        let resource = format!("{}/contributors", id.full_name());
        let mut next = Some(format!(
            "{}/repos/{}/{}/contributors?per_page=100",
            self.config.api_base, id.owner, id.name
        ));
        let mut contributors = Vec::new();
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if pages > 0 {
                tokio::time::sleep(self.config.page_delay).await;
            }
            let Some(response) = self.get_with_retry(&url, &resource).await? else {
                if pages == 0 {
                    return Ok(None);
                }
                break;
            };
            pages += 1;
            // Empty repositories answer 204 with no body.
            if response.status == 204 || response.body.is_empty() {
                break;
            }
            let page: Vec<ApiContributor> = decode(&response, &resource)?;
            contributors.extend(page.into_iter().filter_map(ApiContributor::into_contributor));
            next = response.next_link();
        }

        debug!(
            stage = "fetch",
            event = "fetch.contributors",
            repo = %id,
            pages,
            contributors = contributors.len(),
            "fetched contributors"
        );
        self.cache.put(id, ResourceKind::Contributors, &contributors).await;
        Ok(Some(contributors))
    }

    async fn languages(&self, id: &RepoId) -> Result<Option<LanguageStats>, FetchError> {
        if let Some(stats) = self.cache.get(id, ResourceKind::Languages).await {
            return Ok(Some(stats));
        }

        let resource = format!("{}/languages", id.full_name());
        let url = format!("{}/repos/{}/{}/languages", self.config.api_base, id.owner, id.name);
        let Some(response) = self.get_with_retry(&url, &resource).await? else {
            return Ok(None);
        };
        let stats: LanguageStats = if response.body.is_empty() {
            LanguageStats::new()
        } else {
            decode(&response, &resource)?
        };
        self.cache.put(id, ResourceKind::Languages, &stats).await;
        Ok(Some(stats))
    }

    /// One logical request: admission, transport, budget reconciliation and
    /// classification, repeated per the retry policy. `Ok(None)` is a
    /// definitive not-found.
    async fn get_with_retry(&self, url: &str, resource: &str) -> Result<Option<ApiResponse>, FetchError> {
        let policy = &self.config.retry;
        let mut transient_attempts = 0u32;
        let mut rate_limited_attempts = 0u32;

        loop {
            self.limiter.acquire(resource).await?;

            let start = Instant::now();
            let response = match self.transport.get(url).await {
                Ok(response) => response,
                Err(err) => {
                    if transient_attempts >= policy.max_retries {
                        return Err(FetchError::Network {
                            resource: resource.to_string(),
                            attempts: transient_attempts + 1,
                            message: err.to_string(),
                        });
                    }
                    let wait = policy.backoff(transient_attempts);
                    transient_attempts += 1;
                    warn!(
                        stage = "fetch",
                        event = "request.retry",
                        resource,
                        attempt = transient_attempts,
                        wait_ms = wait.as_millis(),
                        error = %err,
                        "transport error, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
            };

            self.record_limits(&response).await;
            debug!(
                stage = "fetch",
                event = "request.end",
                resource,
                status = response.status,
                duration_ms = start.elapsed().as_millis(),
                "request finished"
            );

            match self.classify(&response) {
                Outcome::Success => return Ok(Some(response)),
                Outcome::NotFound => {
                    info!(
                        stage = "fetch",
                        event = "request.not_found",
                        resource,
                        status = response.status,
                        "resource not found"
                    );
                    return Ok(None);
                }
                Outcome::RateLimited(hint) => {
                    if rate_limited_attempts >= policy.max_rate_limit_retries {
                        return Err(RateLimitError::Server {
                            key: resource.to_string(),
                            retry_after: hint,
                        }
                        .into());
                    }
                    let wait = policy.rate_limit_wait(rate_limited_attempts, hint);
                    rate_limited_attempts += 1;
                    warn!(
                        stage = "fetch",
                        event = "request.rate_limited",
                        resource,
                        status = response.status,
                        attempt = rate_limited_attempts,
                        wait_ms = wait.as_millis(),
                        "rate limited by GitHub, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Outcome::Transient => {
                    if transient_attempts >= policy.max_retries {
                        return Err(FetchError::Network {
                            resource: resource.to_string(),
                            attempts: transient_attempts + 1,
                            message: format!("server returned {}", response.status),
                        });
                    }
                    let wait = policy.backoff(transient_attempts);
                    transient_attempts += 1;
                    warn!(
                        stage = "fetch",
                        event = "request.retry",
                        resource,
                        status = response.status,
                        attempt = transient_attempts,
                        wait_ms = wait.as_millis(),
                        "server error, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Outcome::Fatal => {
                    return Err(FetchError::Status {
                        resource: resource.to_string(),
                        status: response.status,
                    });
                }
            }
        }
    }

    fn classify(&self, response: &ApiResponse) -> Outcome {
        match response.status {
            200..=299 => Outcome::Success,
            404 | 410 | 451 => Outcome::NotFound,
            429 => Outcome::RateLimited(self.server_hint(response)),
            403 if is_rate_limited(response) => Outcome::RateLimited(self.server_hint(response)),
            408 | 500..=599 => Outcome::Transient,
            _ => Outcome::Fatal,
        }
    }

    /// `retry-after` if present, otherwise the time left until the budget
    /// resets when it is exhausted.
    fn server_hint(&self, response: &ApiResponse) -> Option<Duration> {
        if let Some(retry_after) = response.retry_after() {
            return Some(retry_after);
        }
        if response.rate_limit_remaining() != Some(0) {
            return None;
        }
        let reset_ms = response.rate_limit_reset()?.saturating_mul(1000);
        let wait_ms = reset_ms.saturating_sub(self.clock.now_ms());
        u64::try_from(wait_ms).ok().map(Duration::from_millis)
    }

    async fn record_limits(&self, response: &ApiResponse) {
        let (Some(remaining), Some(reset)) = (response.rate_limit_remaining(), response.rate_limit_reset()) else {
            return;
        };
        if let Err(err) = self.limiter.update_limits(remaining, reset).await {
            warn!(
                stage = "fetch",
                event = "limiter.update",
                result = "error",
                error = %format!("{err:#}"),
                "failed to record GitHub budget"
            );
        }
    }
}

fn is_rate_limited(response: &ApiResponse) -> bool {
    if response.retry_after().is_some() || response.rate_limit_remaining() == Some(0) {
        return true;
    }
    let body = response.body_text().to_ascii_lowercase();
    body.contains("rate limit") || body.contains("abuse detection")
}

fn decode<T: DeserializeOwned>(response: &ApiResponse, resource: &str) -> Result<T, FetchError> {
    serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
        resource: resource.to_string(),
        source,
    })
}
