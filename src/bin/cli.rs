//! Article Crawler CLI
//!
//! Local execution entry point. Runs the collector, dispatcher and workers
//! in one process over an in-memory bus.

use std::path::PathBuf;
use std::sync::Arc;

use article_crawler::{
    bus::{MemoryBus, MessageBus},
    error::{AppError, Result},
    models::{Config, TableSchema, WorkerConfig},
    services::{Dispatcher, FrontierCollector, MinerRegistry, StatusLedger, Worker, WorkerStats},
    storage::{LocalStorage, TableStore},
    utils::http::{HttpPageSource, PageSource},
};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Article Crawler - publication site crawler and miner
#[derive(Parser, Debug)]
#[command(
    name = "article-crawler",
    version,
    about = "Discovers article URLs and mines them into records"
)]
struct Cli {
    /// Directory holding the ledger and record tables
    #[arg(short, long, default_value = "storage")]
    storage_dir: PathBuf,

    /// Path to config file (default: {storage_dir}/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the tables and write a default config if none exists
    Init,

    /// Crawl a site and mine what it finds
    Run {
        /// Site name from the config
        #[arg(long)]
        site: String,

        /// Search keywords
        #[arg(short, long, num_args = 1.., required = true)]
        keywords: Vec<String>,

        /// Maximum number of article URLs to discover
        #[arg(short, long, default_value_t = 100)]
        limit: usize,

        /// First search page to request (1-based)
        #[arg(long, default_value_t = 1)]
        start_page: u32,

        /// Number of in-process workers
        #[arg(short, long, default_value_t = 1)]
        workers: usize,

        /// Deliveries before a message is dead-lettered
        #[arg(long, default_value_t = 5)]
        max_deliveries: u32,
    },

    /// Republish undone ledger items and mine them
    Sweep {
        /// Maximum number of items to republish
        #[arg(short, long)]
        limit: Option<usize>,

        /// Number of in-process workers
        #[arg(short, long, default_value_t = 1)]
        workers: usize,

        /// Deliveries before a message is dead-lettered
        #[arg(long, default_value_t = 5)]
        max_deliveries: u32,
    },

    /// Print undone items as JSON lines
    Undone {
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print every ledger row for one article URL
    History { url: String },

    /// Validate configuration
    Validate,
}

/// Initialize logging based on verbosity and format flags.
fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancel `token` on Ctrl-C.
fn watch_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, shutting down");
            token.cancel();
        }
    });
}

/// Shared handles for commands that mine.
struct Pipeline {
    config: Config,
    storage: Arc<LocalStorage>,
    ledger: StatusLedger,
    source: Arc<dyn PageSource>,
    registry: Arc<MinerRegistry>,
}

impl Pipeline {
    async fn open(config: Config, storage: Arc<LocalStorage>) -> Result<Self> {
        let ledger = StatusLedger::open(storage.clone(), config.ledger.clone()).await?;
        storage
            .ensure_table(&TableSchema::mined_records(&config.ledger.data_table))
            .await?;

        let source: Arc<dyn PageSource> = Arc::new(HttpPageSource::from_config(&config.crawler)?);
        let registry = MinerRegistry::from_sites(
            &config.sites,
            Arc::clone(&source),
            config.worker.mining_timeout_secs,
        )?;
        info!(domains = ?registry.domains(), "Miner registry ready");

        Ok(Self {
            config,
            storage,
            ledger,
            source,
            registry: Arc::new(registry),
        })
    }

    async fn spawn_workers(
        &self,
        count: usize,
        bus: &MemoryBus,
        shutdown: &CancellationToken,
    ) -> Result<Vec<JoinHandle<Result<WorkerStats>>>> {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count.max(1) {
            let config = WorkerConfig {
                worker_id: self
                    .config
                    .worker
                    .worker_id
                    .as_ref()
                    .map(|id| if count > 1 { format!("{id}-{index}") } else { id.clone() }),
                ..self.config.worker.clone()
            };
            let mut worker = Worker::new(
                self.ledger.clone(),
                self.storage.clone(),
                self.config.ledger.data_table.clone(),
                Arc::clone(&self.registry),
                config,
            );
            worker.prepare().await?;

            let bus = bus.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { worker.run(&bus, shutdown).await }));
        }
        Ok(handles)
    }
}

/// Wait for the bus to drain, then stop the workers and report.
async fn drain(
    bus: &MemoryBus,
    workers: Vec<JoinHandle<Result<WorkerStats>>>,
    shutdown: &CancellationToken,
) {
    tokio::select! {
        _ = bus.wait_idle() => {}
        _ = shutdown.cancelled() => {}
    }
    bus.close();

    for (index, outcome) in futures::future::join_all(workers)
        .await
        .into_iter()
        .enumerate()
    {
        match outcome {
            Ok(Ok(stats)) => info!(worker = index, ?stats, "Worker finished"),
            Ok(Err(e)) => error!(worker = index, error = %e, "Worker failed"),
            Err(e) => error!(worker = index, error = %e, "Worker task panicked"),
        }
    }

    let stats = bus.stats();
    info!(?stats, "Bus drained");
    if stats.dead_lettered > 0 {
        warn!(
            dead_lettered = stats.dead_lettered,
            "Some messages exhausted their deliveries"
        );
    }
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    info!("Article Crawler starting...");

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.storage_dir.join("config.toml"));
    let config = Config::load_or_default(&config_path);
    let storage = Arc::new(LocalStorage::new(&cli.storage_dir));

    if let Err(e) = config.validate() {
        error!("Config validation failed: {}", e);
        return Err(e);
    }

    match cli.command {
        Command::Init => {
            tokio::fs::create_dir_all(&cli.storage_dir).await?;
            StatusLedger::open(storage.clone(), config.ledger.clone()).await?;
            storage
                .ensure_table(&TableSchema::mined_records(&config.ledger.data_table))
                .await?;

            if tokio::fs::try_exists(&config_path).await? {
                info!("Config already exists at {}", config_path.display());
            } else {
                let text = toml::to_string_pretty(&config)
                    .map_err(|e| AppError::config(format!("cannot serialize config: {e}")))?;
                tokio::fs::write(&config_path, text).await?;
                info!("Default config written to {}", config_path.display());
            }
            info!(
                status_table = %config.ledger.status_table,
                data_table = %config.ledger.data_table,
                "Tables ready"
            );
        }

        Command::Run {
            site,
            keywords,
            limit,
            start_page,
            workers,
            max_deliveries,
        } => {
            let site = config
                .site(&site)
                .cloned()
                .ok_or_else(|| AppError::config(format!("unknown site '{site}'")))?;
            let pipeline = Pipeline::open(config, storage).await?;
            pipeline
                .registry
                .ensure_covers(std::slice::from_ref(&site))?;

            let shutdown = CancellationToken::new();
            watch_ctrl_c(shutdown.clone());

            let bus = MemoryBus::with_max_deliveries(max_deliveries);
            let handles = pipeline.spawn_workers(workers, &bus, &shutdown).await?;

            let dispatcher = Dispatcher::new(
                pipeline.ledger.clone(),
                Arc::new(bus.clone()) as Arc<dyn MessageBus>,
                pipeline.config.dispatcher.clone(),
            );
            let mut frontier = FrontierCollector::new(
                Arc::clone(&pipeline.source),
                &pipeline.config.crawler,
            )
            .collect(&site, &keywords, limit)
            .starting_at(start_page);

            info!(site = %site.name, ?keywords, limit, workers, "Run started");
            let dispatched = dispatcher.run(&mut frontier, limit, shutdown.clone()).await;
            drain(&bus, handles, &shutdown).await;

            let summary = dispatched?;
            info!(?summary, "Run complete!");
        }

        Command::Sweep {
            limit,
            workers,
            max_deliveries,
        } => {
            let pipeline = Pipeline::open(config, storage).await?;

            let shutdown = CancellationToken::new();
            watch_ctrl_c(shutdown.clone());

            let bus = MemoryBus::with_max_deliveries(max_deliveries);
            let handles = pipeline.spawn_workers(workers, &bus, &shutdown).await?;

            let dispatcher = Dispatcher::new(
                pipeline.ledger.clone(),
                Arc::new(bus.clone()) as Arc<dyn MessageBus>,
                pipeline.config.dispatcher.clone(),
            );
            let requeued = dispatcher.requeue_undone(limit).await;
            drain(&bus, handles, &shutdown).await;

            let requeued = requeued?;
            info!(requeued, "Sweep complete!");
        }

        Command::Undone { limit } => {
            let ledger = StatusLedger::open(storage, config.ledger.clone()).await?;
            let undone = ledger.query_undone(limit).await?;
            for item in &undone {
                println!("{}", serde_json::to_string(item)?);
            }
            info!(count = undone.len(), "Undone items listed");
        }

        Command::History { url } => {
            let ledger = StatusLedger::open(storage, config.ledger.clone()).await?;
            let rows = ledger.history(&url).await?;
            if rows.is_empty() {
                warn!(url = %url, "No ledger rows for this URL");
            }
            for row in &rows {
                println!(
                    "{}\t{}\t{}\t{}",
                    row.seq,
                    row.item.timestamp.to_rfc3339(),
                    row.item.status,
                    row.item.worker_id.as_deref().unwrap_or("-")
                );
            }
        }

        Command::Validate => {
            info!("Validating configuration...");
            let source: Arc<dyn PageSource> =
                Arc::new(HttpPageSource::from_config(&config.crawler)?);
            let registry = MinerRegistry::from_sites(
                &config.sites,
                source,
                config.worker.mining_timeout_secs,
            )?;
            info!("✓ Config OK ({} sites)", config.sites.len());
            info!("✓ Miners OK ({} domains)", registry.domains().len());
            info!("All validations passed!");
        }
    }

    info!("Done!");

    Ok(())
}
