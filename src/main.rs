use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use gleaner::config::Config;
use gleaner::fetch::FetchScheduler;
use gleaner::orchestrator::Orchestrator;
use gleaner::service::Service;
use gleaner::storage::{Database, StoreError};
use gleaner::summarize::{LoadBalancer, SummaryPool, Summarizer};

/// Get the config directory path (~/.config/gleaner/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("gleaner"))
}

#[derive(Parser, Debug)]
#[command(name = "gleaner", about = "Background feed ingestion and summarization daemon")]
struct Args {
    /// Path to config.toml (default: ~/.config/gleaner/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run a single fetch/summarize/retention cycle, then exit
    #[arg(long)]
    once: bool,

    /// Rebuild the full-text search index and exit
    #[arg(long)]
    rebuild_search: bool,

    /// Compact the database and clean up orphaned rows, then exit
    #[arg(long)]
    compact: bool,

    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    // User-only access: the database holds the whole reading history
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(&config_dir) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o700);
            if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to set config directory permissions to 0700"
                );
            }
        }
    }

    let config_path = args
        .config
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path).context("Failed to load configuration")?;

    let db_path = if config.database_path.is_empty() {
        config_dir.join("gleaner.db")
    } else {
        PathBuf::from(&config.database_path)
    };

    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(StoreError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of gleaner appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    if args.rebuild_search {
        let count = db
            .rebuild_search_index()
            .await
            .context("Failed to rebuild search index")?;
        println!("Search index rebuilt: {} articles indexed", count);
        return Ok(());
    }

    // Startup consistency check; drift is repairable with --rebuild-search
    match db.check_index_consistency().await {
        Ok(report) if report.is_consistent => {
            tracing::debug!("Search index is consistent");
        }
        Ok(report) => {
            tracing::warn!(
                articles = report.articles_count,
                indexed = report.index_count,
                "Search index out of sync, run with --rebuild-search"
            );
            eprintln!(
                "Warning: search index is out of sync ({} articles, {} indexed). Run with --rebuild-search to fix.",
                report.articles_count, report.index_count
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to check search index consistency");
        }
    }

    let client = reqwest::Client::builder()
        .user_agent(concat!("gleaner/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    // Singletons, constructed once and passed by handle
    let balancer = Arc::new(LoadBalancer::new(config.summarize.endpoints.clone()));
    let probe = Arc::clone(&balancer).spawn_probe(
        client.clone(),
        Duration::from_secs(config.summarize.probe_interval_secs),
    );
    let summarizer = Arc::new(Summarizer::new(
        client.clone(),
        Arc::clone(&balancer),
        config.summarize.clone(),
    ));
    let pool = SummaryPool::new(&config.summarize, summarizer);
    let scheduler = FetchScheduler::new(db.clone(), client, config.fetch.clone());

    let service = Arc::new(Service::new(
        db.clone(),
        scheduler,
        pool,
        balancer,
        &config,
    ));

    if args.compact {
        service.run_maintenance().await?;
        service.shutdown().await;
        probe.abort();
        println!("Database compacted.");
        return Ok(());
    }

    let orchestrator = Orchestrator::new(Arc::clone(&service), config.orchestrator);

    if args.once {
        orchestrator.run_cycle(1).await;
        service.shutdown().await;
        probe.abort();
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!(
        db = %db_path.display(),
        interval_secs = config.orchestrator.cycle_interval_secs,
        "gleaner starting"
    );
    orchestrator.run(shutdown_rx).await;

    service.shutdown().await;
    probe.abort();
    println!("Goodbye!");
    Ok(())
}
