use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use ecoindex_types::PendingRecord;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{ValidationError, WriteError};
use crate::github::{GitHubClient, RepoId};
use crate::source::SourceReader;
use crate::writer::{BatchWriter, EnqueueOutcome};

/// Per-run counters. `total` counts every URL read from the source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub not_found: usize,
}

impl RunSummary {
    pub fn merge(&mut self, other: &RunSummary) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.not_found += other.not_found;
    }

    fn record(&mut self, outcome: RepoOutcome) {
        self.total += 1;
        match outcome {
            RepoOutcome::Succeeded => self.succeeded += 1,
            RepoOutcome::Failed => self.failed += 1,
            RepoOutcome::Skipped => self.skipped += 1,
            RepoOutcome::NotFound => self.not_found += 1,
        }
    }
}

enum Candidate {
    Repo(RepoId),
    Duplicate(RepoId),
    Invalid(ValidationError),
}

enum RepoOutcome {
    Succeeded,
    Failed,
    Skipped,
    NotFound,
}

/// Drives one ecosystem from source file to stored rows.
pub struct Ingestor {
    client: Arc<GitHubClient>,
    writer: Arc<BatchWriter>,
    sources: SourceReader,
    fetch_concurrency: usize,
}

impl Ingestor {
    pub fn new(
        client: Arc<GitHubClient>,
        writer: Arc<BatchWriter>,
        sources: SourceReader,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            client,
            writer,
            sources,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    pub fn writer(&self) -> &Arc<BatchWriter> {
        &self.writer
    }

    /// Fetches and stores every repository listed for `ecosystem`.
    ///
    /// Only a failure to read the already-stored keys aborts the run.
    /// Per-repository failures are counted, and a final flush that gives up
    /// is logged with its records left queued.
    pub async fn run_ecosystem(&self, ecosystem: &str, category: &str) -> Result<RunSummary, WriteError> {
        let start = Instant::now();
        info!(
            stage = "run",
            event = "run.begin",
            ecosystem,
            category,
            concurrency = self.fetch_concurrency,
            "starting ecosystem run"
        );

        self.writer.initialize(ecosystem).await?;

        let mut seen = HashSet::new();
        let summary = self
            .sources
            .parse(ecosystem)
            .map(|url| {
                let candidate = match RepoId::parse(&url) {
                    Ok(id) if !seen.insert(id.key()) => Candidate::Duplicate(id),
                    Ok(id) => Candidate::Repo(id),
                    Err(err) => Candidate::Invalid(err),
                };
                self.process(candidate, ecosystem, category)
            })
            .buffer_unordered(self.fetch_concurrency)
            .fold(RunSummary::default(), |mut summary, outcome| async move {
                summary.record(outcome);
                summary
            })
            .await;

        if let Err(err) = self.writer.flush_all().await {
            error!(
                stage = "run",
                event = "run.flush",
                result = "fail",
                ecosystem,
                pending = self.writer.pending_len().await,
                error = %format!("{err:#}"),
                "final flush failed"
            );
        }

        info!(
            stage = "run",
            event = "run.summary",
            ecosystem,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            not_found = summary.not_found,
            duration_ms = start.elapsed().as_millis(),
            "ecosystem run finished"
        );
        Ok(summary)
    }

    /// Runs every ecosystem under the sources directory in order.
    pub async fn run_all(&self, category: &str) -> anyhow::Result<RunSummary> {
        let ecosystems = self.sources.list_sources().await?;
        let mut total = RunSummary::default();
        for ecosystem in &ecosystems {
            match self.run_ecosystem(ecosystem, category).await {
                Ok(summary) => total.merge(&summary),
                Err(err) => error!(
                    stage = "run",
                    event = "run.end",
                    result = "fail",
                    ecosystem = %ecosystem,
                    error = %format!("{err:#}"),
                    "ecosystem run aborted"
                ),
            }
        }
        info!(
            stage = "run",
            event = "run.all",
            ecosystems = ecosystems.len(),
            total = total.total,
            succeeded = total.succeeded,
            failed = total.failed,
            skipped = total.skipped,
            not_found = total.not_found,
            "all ecosystems finished"
        );
        Ok(total)
    }

    async fn process(&self, candidate: Candidate, ecosystem: &str, category: &str) -> RepoOutcome {
        let id = match candidate {
            Candidate::Repo(id) => id,
            Candidate::Duplicate(id) => {
                debug!(stage = "run", event = "repo.duplicate", repo = %id, "listed twice in source");
                return RepoOutcome::Skipped;
            }
            Candidate::Invalid(err) => {
                warn!(
                    stage = "run",
                    event = "repo.invalid",
                    result = "fail",
                    error = %err,
                    "skipping malformed repository url"
                );
                return RepoOutcome::Failed;
            }
        };

        if self.writer.is_processed(ecosystem, &id.key()).await {
            debug!(stage = "run", event = "repo.skip", repo = %id, "already stored");
            return RepoOutcome::Skipped;
        }

        let start = Instant::now();
        match self.client.fetch_all(&id.full_name()).await {
            Ok(Some(record)) => {
                let pending = PendingRecord::new(record, ecosystem, category).with_source_key(&id.key());
                match self.writer.enqueue(pending).await {
                    EnqueueOutcome::Queued => RepoOutcome::Succeeded,
                    EnqueueOutcome::Skipped => RepoOutcome::Skipped,
                }
            }
            Ok(None) => RepoOutcome::NotFound,
            Err(err) => {
                warn!(
                    stage = "run",
                    event = "repo.fetch",
                    result = "fail",
                    repo = %id,
                    duration_ms = start.elapsed().as_millis(),
                    error = %format!("{err:#}"),
                    "repository fetch failed"
                );
                RepoOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::clock::Clock;
    use crate::github::{ClientConfig, ResponseCache};
    use crate::test_support::{NOW, ScriptedTransport, memory_limiter, record, repo_json};
    use crate::writer::{MemoryStore, RepoStore, WriterConfig};

    const API: &str = "https://api.test";

    struct Harness {
        ingestor: Ingestor,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryStore>,
        sources: TempDir,
        _cache: TempDir,
    }

    fn harness() -> Harness {
        let clock = Clock::starting_at(NOW);
        let transport = ScriptedTransport::new();
        let (limiter, _state) = memory_limiter(clock);
        let cache_dir = TempDir::new().expect("tempdir");
        let client = GitHubClient::new(
            transport.clone(),
            limiter,
            ResponseCache::new(cache_dir.path(), Duration::from_secs(24 * 3600), clock),
            ClientConfig {
                api_base: API.to_string(),
                ..ClientConfig::default()
            },
            clock,
        );
        let store = Arc::new(MemoryStore::new());
        let writer = BatchWriter::new(store.clone(), WriterConfig::default(), clock);
        let sources = TempDir::new().expect("tempdir");
        let ingestor = Ingestor::new(
            Arc::new(client),
            Arc::new(writer),
            SourceReader::new(sources.path()),
            4,
        );
        Harness {
            ingestor,
            transport,
            store,
            sources,
            _cache: cache_dir,
        }
    }

    impl Harness {
        fn source(&self, id: &str, urls: &[&str]) {
            let body: String = urls
                .iter()
                .map(|url| format!("[[repo]]\nurl = \"{url}\"\n"))
                .collect();
            std::fs::write(self.sources.path().join(format!("{id}.toml")), body).expect("write source");
        }

        fn script_repo(&self, id: i64, full_name: &str, stars: i64) {
            let base = format!("{API}/repos/{full_name}");
            self.transport.json(&base, 200, repo_json(id, full_name, stars));
            self.transport.json(
                &format!("{base}/contributors?per_page=100"),
                200,
                json!([{"login": "alice", "id": 1, "contributions": 5}]),
            );
            self.transport.json(&format!("{base}/languages"), 200, json!({"Rust": 100}));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn counts_every_outcome() {
        let h = harness();
        h.source(
            "eco",
            &[
                "https://github.com/foo/bar",
                "https://github.com/Foo/Bar",
                "https://github.com/gone/repo",
                "https://github.com/not-a-repo",
                "https://github.com/locked/repo",
            ],
        );
        h.script_repo(1, "foo/bar", 10);
        h.transport
            .json(&format!("{API}/repos/gone/repo"), 404, json!({"message": "Not Found"}));
        h.transport.json(
            &format!("{API}/repos/locked/repo"),
            403,
            json!({"message": "Resource not accessible"}),
        );

        let summary = h.ingestor.run_ecosystem("eco", "defi").await.expect("run");
        assert_eq!(
            summary,
            RunSummary {
                total: 5,
                succeeded: 1,
                failed: 2,
                skipped: 1,
                not_found: 1,
            }
        );

        let stored = h.store.get("foo/bar").expect("stored");
        assert_eq!(stored.ecosystems.get("eco").map(String::as_str), Some("defi"));
        assert_eq!(stored.record.languages.as_ref().map(|l| l.len()), Some(1));
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.ingestor.writer().pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_repositories_are_not_fetched_again() {
        let h = harness();
        h.store
            .upsert_batch(&[PendingRecord::new(record(1, "foo/bar", 10), "eco", "defi")])
            .await
            .expect("seed");
        h.source("eco", &["https://github.com/foo/bar"]);

        let summary = h.ingestor.run_ecosystem("eco", "defi").await.expect("run");
        assert_eq!(summary.skipped, 1);
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_all_sums_ecosystems() {
        let h = harness();
        h.source("alpha", &["https://github.com/a/one"]);
        h.source("beta", &["https://github.com/b/two", "https://gitlab.com/c/three"]);
        h.script_repo(1, "a/one", 1);
        h.script_repo(2, "b/two", 2);

        let summary = h.ingestor.run_all("general").await.expect("run all");
        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_all_keeps_repo_listed_in_two_ecosystems() {
        let h = harness();
        h.source("alpha", &["https://github.com/a/one"]);
        h.source("beta", &["https://github.com/a/one"]);
        h.script_repo(1, "a/one", 1);
        h.script_repo(1, "a/one", 1);

        let summary = h.ingestor.run_all("general").await.expect("run all");
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 0);

        let stored = h.store.get("a/one").expect("stored");
        assert_eq!(stored.ecosystems.keys().collect::<Vec<_>>(), vec!["alpha", "beta"]);
    }

    #[tokio::test(start_paused = true)]
    async fn renamed_repo_is_not_fetched_again() {
        let h = harness();
        h.source("eco", &["https://github.com/old/name"]);
        let base = format!("{API}/repos/old/name");
        h.transport.json(&base, 200, repo_json(1, "new/name", 5));
        h.transport.json(&format!("{base}/contributors?per_page=100"), 200, json!([]));
        h.transport.json(&format!("{base}/languages"), 200, json!({}));

        let first = h.ingestor.run_ecosystem("eco", "defi").await.expect("first run");
        assert_eq!(first.succeeded, 1);
        let calls = h.transport.call_count();

        let second = h.ingestor.run_ecosystem("eco", "defi").await.expect("second run");
        assert_eq!(second.skipped, 1);
        assert_eq!(h.transport.call_count(), calls);

        let keys = h.store.existing_keys("eco").await.expect("keys");
        assert!(keys.contains("old/name"));
        assert!(keys.contains("new/name"));
    }

    #[tokio::test(start_paused = true)]
    async fn write_failures_do_not_fail_the_run() {
        let h = harness();
        h.source("eco", &["https://github.com/foo/bar"]);
        h.script_repo(1, "foo/bar", 10);
        h.store.fail_on_key("foo/bar");

        let summary = h.ingestor.run_ecosystem("eco", "defi").await.expect("run");
        assert_eq!(summary.succeeded, 1);
        assert!(h.store.is_empty());
        assert_eq!(h.ingestor.writer().pending_len().await, 1);
    }
}
