use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{AppConfig, StateBackend};
use crate::github::{GitHubClient, ResponseCache, ReqwestTransport};
use crate::logging::init_logging;
use crate::pipeline::Ingestor;
use crate::rate_limit::{
    FileStateStore, LimiterStateStore, MemoryStateStore, PostgresStateStore, RateLimiter,
};
use crate::source::SourceReader;
use crate::writer::{BatchWriter, PostgresStore, RepoStore};

#[derive(Debug, Parser)]
#[command(
    name = "ecoindex-ingest",
    version,
    about = "Fetch GitHub metadata for ecosystem repositories into Postgres"
)]
pub struct Cli {
    #[arg(long, default_value = "ecoindex.toml")]
    config: PathBuf,
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest one ecosystem, or every ecosystem under the sources directory.
    Run {
        #[arg(long)]
        ecosystem: Option<String>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Print the shared rate limiter state as JSON.
    Status,
    /// Remove an ecosystem's repositories below a star threshold.
    Prune {
        #[arg(long)]
        ecosystem: String,
        #[arg(long)]
        min_stars: i64,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Delete expired response cache files.
    PurgeCache,
    ValidateConfig,
}

pub async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_logging(cli.verbose)?;
    info!(
        stage = "startup",
        event = "startup.begin",
        config_path = %cli.config.display(),
        "ecoindex-ingest starting"
    );

    let cfg = load_config(&cli)?;

    match &cli.command {
        Command::ValidateConfig => {
            info!(
                stage = "startup",
                event = "startup.validate_only.exit",
                result = "ok",
                "configuration validation passed"
            );
            Ok(())
        }
        Command::Status => status(&cli, &cfg).await,
        Command::Run {
            ecosystem,
            category,
        } => {
            let category = category.clone().unwrap_or_else(|| cfg.sources.category.clone());
            run_ingest(&cli, &cfg, ecosystem.as_deref(), &category).await
        }
        Command::Prune {
            ecosystem,
            min_stars,
            yes,
        } => {
            if !yes {
                bail!("prune deletes rows; pass --yes to confirm");
            }
            let db = connect_database(&cli, &cfg).await?;
            let start = Instant::now();
            let detached = db.prune_below_stars(ecosystem, *min_stars).await?;
            info!(
                stage = "prune",
                event = "prune.end",
                result = "ok",
                ecosystem = %ecosystem,
                min_stars,
                detached,
                duration_ms = start.elapsed().as_millis(),
                "pruned repositories below star threshold"
            );
            Ok(())
        }
        Command::PurgeCache => {
            let cache = ResponseCache::new(&cfg.github.cache_dir, cfg.github.cache_ttl, Clock::new());
            let removed = cache.purge_expired().await.with_context(|| {
                format!("failed to purge cache {}", cfg.github.cache_dir.display())
            })?;
            println!("{removed}");
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let load_start = Instant::now();
    let cfg = match AppConfig::load(&cli.config).context("failed to load ecoindex-ingest config") {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(
                stage = "startup",
                event = "config.load.end",
                result = "fail",
                config_path = %cli.config.display(),
                duration_ms = load_start.elapsed().as_millis(),
                error = %format!("{err:#}"),
                "configuration load failed"
            );
            return Err(err);
        }
    };

    if let Err(err) = cfg.validate_config() {
        error!(
            stage = "startup",
            event = "config.validate.end",
            result = "fail",
            error = %format!("{err:#}"),
            "configuration validation failed"
        );
        return Err(err);
    }

    info!(
        stage = "startup",
        event = "config.load.end",
        result = "ok",
        config_path = %cli.config.display(),
        duration_ms = load_start.elapsed().as_millis(),
        "configuration loaded"
    );
    Ok(cfg)
}

async fn connect_database(cli: &Cli, cfg: &AppConfig) -> Result<PostgresStore> {
    let url = cli
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set; export it or pass --database-url")?;
    let db = PostgresStore::connect(url, cfg.database.max_connections)
        .await
        .context("failed to connect to Postgres")?;
    db.migrate().await.context("failed to run migrations")?;
    Ok(db)
}

fn state_store(
    cfg: &AppConfig,
    pool: Option<&PgPool>,
    clock: Clock,
) -> Result<Arc<dyn LimiterStateStore>> {
    let limit = cfg.rate_limit.limiter.hourly_limit;
    let store: Arc<dyn LimiterStateStore> = match &cfg.rate_limit.state {
        StateBackend::File(path) => Arc::new(FileStateStore::new(path, limit, clock)),
        StateBackend::Memory => Arc::new(MemoryStateStore::new(limit, clock)),
        StateBackend::Postgres => {
            let pool = pool.context("rate_limit.state = \"postgres\" needs a database connection")?;
            Arc::new(PostgresStateStore::new(pool.clone(), limit, clock))
        }
    };
    info!(
        stage = "startup",
        event = "limiter.store",
        store = %store.describe(),
        "rate limiter state store selected"
    );
    Ok(store)
}

async fn status(cli: &Cli, cfg: &AppConfig) -> Result<()> {
    let clock = Clock::new();
    let db = match cfg.rate_limit.state {
        StateBackend::Postgres => Some(connect_database(cli, cfg).await?),
        _ => None,
    };
    let store = state_store(cfg, db.as_ref().map(PostgresStore::pool), clock)?;
    let limiter = RateLimiter::start(cfg.rate_limit.limiter.clone(), store, clock);
    let status = limiter.status().await;
    limiter.shutdown().await;

    let status = status.context("failed to read rate limiter state")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_ingest(
    cli: &Cli,
    cfg: &AppConfig,
    ecosystem: Option<&str>,
    category: &str,
) -> Result<()> {
    let clock = Clock::new();
    let db = connect_database(cli, cfg).await?;
    let store = state_store(cfg, Some(db.pool()), clock)?;
    let limiter = RateLimiter::start(cfg.rate_limit.limiter.clone(), store, clock);

    let token = std::env::var(&cfg.github.token_env).ok();
    if token.is_none() {
        warn!(
            stage = "startup",
            event = "github.token",
            token_env = %cfg.github.token_env,
            "no GitHub token found, requests are unauthenticated"
        );
    }
    let transport = Arc::new(ReqwestTransport::new(token, cfg.github.request_timeout)?);
    let cache = ResponseCache::new(&cfg.github.cache_dir, cfg.github.cache_ttl, clock);
    let client = GitHubClient::new(
        transport,
        limiter.clone(),
        cache,
        cfg.github.client_config(),
        clock,
    );
    let writer = BatchWriter::new(Arc::new(db), cfg.writer.clone(), clock);
    let ingestor = Ingestor::new(
        Arc::new(client),
        Arc::new(writer),
        SourceReader::new(&cfg.sources.dir),
        cfg.github.fetch_concurrency,
    );

    info!(
        stage = "startup",
        event = "startup.mode",
        mode = if ecosystem.is_some() { "single" } else { "all" },
        category,
        "starting ingestion"
    );

    let outcome = tokio::select! {
        result = async {
            match ecosystem {
                Some(ecosystem) => ingestor
                    .run_ecosystem(ecosystem, category)
                    .await
                    .map_err(anyhow::Error::from),
                None => ingestor.run_all(category).await,
            }
        } => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let result = match outcome {
        Some(Ok(summary)) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Some(Err(err)) => Err(err),
        None => {
            info!(stage = "startup", event = "startup.shutdown", "received ctrl-c, flushing queued records");
            if let Err(err) = ingestor.writer().flush_all().await {
                error!(
                    stage = "startup",
                    event = "startup.shutdown",
                    result = "fail",
                    pending = ingestor.writer().pending_len().await,
                    error = %format!("{err:#}"),
                    "queued records could not be written"
                );
            }
            Ok(())
        }
    };

    limiter.shutdown().await;
    result
}
