use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ecoindex_types::RepositoryRecord;

use crate::clock::Clock;
use crate::github::transport::{ApiResponse, ApiTransport, TransportError};
use crate::rate_limit::{MemoryStateStore, RateLimiter, RateLimiterConfig};

pub const NOW: i64 = 1_700_000_000_000;

/// Transport answering from per-url queues of canned responses.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<ApiResponse, TransportError>>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, response: ApiResponse) {
        self.push(url, Ok(response));
    }

    pub fn fail(&self, url: &str, message: &str) {
        self.push(url, Err(TransportError(message.to_string())));
    }

    pub fn json(&self, url: &str, status: u16, body: serde_json::Value) {
        self.respond(url, ApiResponse::new(status, body.to_string()));
    }

    fn push(&self, url: &str, outcome: Result<ApiResponse, TransportError>) {
        self.scripts
            .lock()
            .expect("scripts")
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls").len()
    }
}

#[async_trait]
impl ApiTransport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<ApiResponse, TransportError> {
        self.calls.lock().expect("calls").push(url.to_string());
        self.scripts
            .lock()
            .expect("scripts")
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(TransportError(format!("unscripted request {url}"))))
    }
}

pub fn memory_limiter(clock: Clock) -> (RateLimiter, Arc<MemoryStateStore>) {
    let config = RateLimiterConfig {
        admission_timeout: std::time::Duration::from_secs(3600),
        ..RateLimiterConfig::default()
    };
    let store = Arc::new(MemoryStateStore::new(config.hourly_limit, clock));
    (RateLimiter::start(config, store.clone(), clock), store)
}

pub fn repo_json(id: i64, full_name: &str, stars: i64) -> serde_json::Value {
    let (owner, name) = full_name.split_once('/').expect("owner/name");
    serde_json::json!({
        "id": id,
        "name": name,
        "full_name": full_name,
        "owner": {"login": owner},
        "description": format!("{full_name} description"),
        "html_url": format!("https://github.com/{full_name}"),
        "homepage": null,
        "stargazers_count": stars,
        "forks_count": 1,
        "watchers_count": stars,
        "open_issues_count": 0,
        "size": 100,
        "default_branch": "main",
        "language": "Rust",
        "license": {"name": "MIT License"},
        "topics": ["blockchain"],
        "archived": false,
        "fork": false,
        "created_at": "2020-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z",
        "pushed_at": "2024-01-01T00:00:00Z"
    })
}

pub fn record(id: i64, full_name: &str, stars: i64) -> RepositoryRecord {
    let api: crate::github::models::ApiRepository =
        serde_json::from_value(repo_json(id, full_name, stars)).expect("repo json");
    api.into_record()
}

/// Migrated store for tests that need a real Postgres. Returns `None` when
/// `ECOINDEX_TEST_DATABASE_URL` is unset so those tests pass as no-ops.
pub async fn test_database() -> Option<crate::writer::PostgresStore> {
    let url = std::env::var("ECOINDEX_TEST_DATABASE_URL").ok()?;
    let store = crate::writer::PostgresStore::connect(&url, 4)
        .await
        .expect("connect to test database");
    store.migrate().await.expect("migrate test database");
    Some(store)
}
