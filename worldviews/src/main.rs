/*
worldviews - single-binary main.rs
Runs news ingestion and interpretation generation, either once from the CLI or as a
long-lived background worker.
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{Config, PersonaScope};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use common::init_db_pool;

use worldviews::cache;
use worldviews::dispatcher::{Dispatcher, DispatcherSettings};
use worldviews::events::EventBus;
use worldviews::generator::{GenerationSettings, InterpretationGenerator};
use worldviews::llm::ProviderClient;
use worldviews::models::Tier;
use worldviews::news_api::{self, NewsApiClient};
use worldviews::scraping::ReadabilityFetcher;
use worldviews::storage::{articles, interpretations, personas};
use worldviews::worker::{IngestionSettings, Worker};

#[derive(Parser, Debug)]
#[command(name = "worldviews", about = "Worldviews news ingestion + interpretation worker")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ingestion loop and generation workers until Ctrl-C
    Worker,
    /// Fetch and ingest once, then wait for queued generation to finish
    Ingest,
    /// Generate an interpretation synchronously and print it as JSON
    Generate {
        #[arg(long)]
        article: i64,
        /// Persona slug
        #[arg(long)]
        persona: String,
        /// Also produce the detailed analysis
        #[arg(long)]
        detailed: bool,
    },
    /// List active personas
    Personas,
    /// List the most recently published active articles
    Articles {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Print one article and every interpretation stored for it as JSON
    Show {
        #[arg(long)]
        article: i64,
    },
}

/// Everything the commands share, built once from config
struct App {
    pool: sqlx::SqlitePool,
    config: Config,
    generator: Arc<InterpretationGenerator>,
    cache: Arc<dyn cache::CacheStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = load_config(args.config).await?;
    let app = build_app(config).await?;

    match args.command {
        Command::Worker => run_worker(app).await,
        Command::Ingest => run_ingest(app).await,
        Command::Generate {
            article,
            persona,
            detailed,
        } => run_generate(app, article, &persona, detailed).await,
        Command::Personas => run_personas(app).await,
        Command::Articles { limit } => run_articles(app, limit).await,
        Command::Show { article } => run_show(app, article).await,
    }
}

async fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = explicit {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .map_err(|e| {
        error!(error = %format!("{:#}", e), "failed to load configuration");
        e
    })?;
    info!(defaults = ?default_path, overrides = ?override_path, "configuration loaded");
    Ok(config)
}

async fn build_app(config: Config) -> Result<App> {
    // Resolve and log the absolute DB path before connecting
    let db_path_abs = match tokio::fs::canonicalize(&config.database.path).await {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => config.database.path.clone(),
    };
    info!(db_path = %db_path_abs, "resolved DB path");

    let pool = init_db_pool(&db_path_abs)
        .await
        .with_context(|| format!("failed to initialize database pool at {}", db_path_abs))?;

    if config.admin.as_ref().and_then(|a| a.auto_migrate).unwrap_or(true) {
        info!("Auto-migrate enabled: running DB migrations");
        common::run_migrations(&pool).await?;
        info!("DB migrations completed");
    }

    let synced = common::sync_personas(&config, &pool).await?;
    info!(synced, configured = config.personas.len(), "official personas synchronized");

    // Keys are read here, once, and handed to the components as values
    let llm_config = config.llm.clone().unwrap_or_default();
    let client = Arc::new(ProviderClient::from_config(&llm_config, |name| std::env::var(name).ok()));
    info!(providers = ?client.provider_ids(), mock = client.is_mock(), "provider chain ready");

    let backend = config.cache.as_ref().and_then(|c| c.backend).unwrap_or_default();
    let cache = cache::from_backend(backend, &pool);

    let settings = GenerationSettings::from_config(&config);
    let fetch_timeout = config
        .news
        .as_ref()
        .and_then(|n| n.fetch_timeout_seconds)
        .unwrap_or(10);
    let fetcher = ReadabilityFetcher::new(fetch_timeout, settings.min_full_text_chars)?;

    let generator = Arc::new(
        InterpretationGenerator::new(pool.clone(), client, cache.clone(), EventBus::default(), settings)
            .with_fetcher(Arc::new(fetcher)),
    );

    Ok(App {
        pool,
        config,
        generator,
        cache,
    })
}

fn news_client(config: &Config) -> Result<NewsApiClient> {
    let news = config.news.clone().unwrap_or_default();
    let api_key = news.api_key_env.as_deref().and_then(|name| std::env::var(name).ok());
    NewsApiClient::new(
        news.api_url.unwrap_or_else(|| news_api::DEFAULT_API_URL.to_string()),
        api_key,
        news.fetch_timeout_seconds.unwrap_or(10),
    )
}

fn start_worker(app: &App) -> Result<(Worker, Vec<JoinHandle<()>>)> {
    let (dispatcher, handles) = Dispatcher::start(
        app.pool.clone(),
        app.generator.clone(),
        DispatcherSettings::from_config(&app.config),
    );
    let worker = Worker {
        pool: app.pool.clone(),
        news: news_client(&app.config)?,
        dispatcher,
        cache: app.cache.clone(),
        settings: IngestionSettings::from_config(&app.config),
    };
    Ok((worker, handles))
}

async fn run_worker(app: App) -> Result<()> {
    info!("Starting in worker mode");
    let (worker, handles) = start_worker(&app)?;
    let shutdown_notify = Arc::new(Notify::new());

    // Stand-in for a live view: log every change notification
    let mut events = app.generator.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(
                article_id = event.article_id,
                persona_id = event.persona_id,
                field = ?event.changed_field,
                "interpretation changed"
            );
        }
    });

    let signal_notify = shutdown_notify.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, notifying worker to shutdown");
            signal_notify.notify_one();
        }
    });

    if let Err(e) = worker.run(shutdown_notify).await {
        error!(error = %format!("{:#}", e), "worker encountered an error");
    }

    // Closing the last dispatcher handle lets the queue workers drain and exit
    drop(worker);
    drain(handles, Duration::from_secs(20)).await;

    info!("Shutdown complete");
    Ok(())
}

async fn run_ingest(app: App) -> Result<()> {
    let (worker, handles) = start_worker(&app)?;

    if let Some(report) = worker.run_ingestion_cycle(true).await? {
        println!(
            "ingested: {} new, {} updated, {} skipped, {} invalid, {} failed",
            report.new.len(),
            report.updated.len(),
            report.skipped.len(),
            report.invalid,
            report.failed
        );
    }

    drop(worker);
    drain(handles, Duration::from_secs(600)).await;
    Ok(())
}

async fn drain(handles: Vec<JoinHandle<()>>, grace: Duration) {
    let all = async {
        for handle in handles {
            if let Err(join_err) = handle.await {
                error!(%join_err, "queue worker panicked");
            }
        }
    };
    if tokio::time::timeout(grace, all).await.is_err() {
        info!("Timed out waiting for queued generation; continuing shutdown");
    }
}

async fn run_generate(app: App, article_id: i64, slug: &str, detailed: bool) -> Result<()> {
    let persona = personas::get_persona_by_slug(&app.pool, slug)
        .await?
        .with_context(|| format!("no persona with slug {}", slug))?;

    let tier = if detailed { Tier::Detailed } else { Tier::Quick };
    let interpretation = app.generator.generate(article_id, persona.id, tier).await?;

    println!("{}", serde_json::to_string_pretty(&interpretation)?);
    Ok(())
}

async fn run_personas(app: App) -> Result<()> {
    for persona in personas::list_personas(&app.pool, PersonaScope::Active).await? {
        println!(
            "{:>3}  {:<14} {:<22} {}",
            persona.id,
            persona.slug,
            persona.name,
            if persona.official { "official" } else { "user" }
        );
    }
    Ok(())
}

async fn run_articles(app: App, limit: i64) -> Result<()> {
    for article in articles::latest_articles(&app.pool, limit).await? {
        let metadata = article.metadata_json();
        println!(
            "{:>5} {} {} {:<11} {:<20} {} ({})",
            article.id,
            if article.featured { "*" } else { " " },
            article.published_at.format("%Y-%m-%d %H:%M"),
            article.category,
            article.source,
            article.headline,
            metadata["author"].as_str().unwrap_or("unknown author")
        );
    }
    Ok(())
}

async fn run_show(app: App, article_id: i64) -> Result<()> {
    let article = articles::get_article(&app.pool, article_id)
        .await?
        .with_context(|| format!("no article with id {}", article_id))?;
    let takes = interpretations::interpretations_for_article(&app.pool, article_id).await?;

    let out = serde_json::json!({ "article": article, "interpretations": takes });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
