use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod aggregator;
mod config;
mod context;
mod db;
mod discovery;
mod error;
mod extract;
mod inference;
mod logging;
mod models;
mod queue;
mod report;
mod risk;
mod segmenter;
mod worker;

use config::Config;
use context::AnalysisContext;
use db::PgStore;
use discovery::{Discovery, DiscoveryRules};
use extract::FfmpegExtractor;
use inference::HttpClassifier;
use models::ScanJob;
use queue::{JobQueue, RedisQueue};
use worker::{Worker, WorkerSettings};

#[derive(Parser)]
#[command(name = "content-warning-scanner")]
#[command(about = "Scans subtitles for content-warning triggers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load default categories and models
    Seed,
    /// Register a file and queue it for scanning
    Enqueue {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Show how many jobs are waiting
    QueueLen,
    /// Walk media folders and queue new or changed files
    Discover {
        /// Folder to walk; defaults to MEDIA_PATHS
        #[arg(long = "path")]
        paths: Vec<PathBuf>,
        /// Keep rescanning every SCAN_INTERVAL_SECS until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Consume scan jobs until interrupted
    Worker,
    /// Scan one file locally and write a markdown report
    Scan {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Manage the model registry
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    /// List active models and their load status
    List,
    /// Register a custom model
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        huggingface_id: String,
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,
        #[arg(long, default_value = "text-classification")]
        task_type: String,
        #[arg(long, default_value_t = 1.0)]
        weight: f64,
        /// JSON object with `threshold` and/or `label_mappings`
        #[arg(long, default_value = "{}")]
        config: String,
    },
    /// Deactivate a model
    Remove {
        #[arg(long)]
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    logging::init_tracing(config.log_format);

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Enqueue { file, priority } => {
            let path = file.to_string_lossy().to_string();
            db::register_file(&pool, &path).await?;

            let queue = RedisQueue::connect(&config.redis_url, &config.queue_name).await?;
            let mut job = ScanJob::new(path);
            job.priority = priority;
            queue.push(&job).await?;
            println!("Queued job {} for {}.", job.id, job.file_path);
        }
        Commands::QueueLen => {
            let queue = RedisQueue::connect(&config.redis_url, &config.queue_name).await?;
            println!("{} jobs pending on {}.", queue.pending_jobs().await?, config.queue_name);
        }
        Commands::Discover { paths, watch } => {
            let roots: Vec<PathBuf> = if paths.is_empty() {
                config.media_paths.iter().map(PathBuf::from).collect()
            } else {
                paths
            };
            anyhow::ensure!(
                !roots.is_empty(),
                "no media paths given; pass --path or set MEDIA_PATHS"
            );

            let queue = RedisQueue::connect(&config.redis_url, &config.queue_name).await?;
            let discovery = Discovery::new(
                Arc::new(PgStore::new(pool)),
                Arc::new(queue),
                roots,
                DiscoveryRules::new(&config.extensions, &config.ignore_patterns),
            );

            if watch {
                let cancel = shutdown_on_ctrl_c();
                discovery.run(config.scan_interval, cancel).await;
            } else {
                let stats = discovery.scan_once().await;
                println!(
                    "Scanned {} files, queued {} for processing.",
                    stats.files_seen, stats.queued
                );
            }
        }
        Commands::Worker => {
            let mut context = AnalysisContext::new();
            context.load(&pool).await?;

            let queue = RedisQueue::connect(&config.redis_url, &config.queue_name).await?;
            let classifier = HttpClassifier::new(&config.inference_url)?;

            let cancel = shutdown_on_ctrl_c();

            Worker::new(
                Arc::new(queue),
                Arc::new(PgStore::new(pool)),
                Arc::new(classifier),
                Arc::new(FfmpegExtractor::new()),
                context,
                WorkerSettings {
                    poll_timeout: config.poll_timeout,
                    queue_backoff: config.queue_backoff,
                    segment_concurrency: config.segment_concurrency,
                },
            )
            .run(cancel)
            .await;
        }
        Commands::Scan { file, out } => {
            let mut context = AnalysisContext::new();
            context.load(&pool).await?;
            let classifier = HttpClassifier::new(&config.inference_url)?;

            let started = Instant::now();
            let segments = segmenter::segment_file(&file, &FfmpegExtractor::new()).await;
            let triggers = worker::analyze_segments(
                &context,
                &classifier,
                &segments,
                config.segment_concurrency,
            )
            .await;
            let result = risk::summarize(None, worker::elapsed_ms(started), triggers);
            let report = report::build_report(&file.display().to_string(), &result);

            match out {
                Some(out) => {
                    std::fs::write(&out, report)?;
                    println!("Report written to {}.", out.display());
                }
                None => print!("{report}"),
            }
            context.dispose();
        }
        Commands::Models { command } => match command {
            ModelCommands::List => {
                let models = db::list_models(&pool).await?;
                if models.is_empty() {
                    println!("No active models.");
                }
                for model in models {
                    println!(
                        "- #{} {}{} ({}, {}) weight {:.2} [{}] categories: {}{}",
                        model.id,
                        model.name,
                        if model.is_custom { " (custom)" } else { "" },
                        model.huggingface_id,
                        model.task_type,
                        model.weight,
                        model.status,
                        model.categories.join(", "),
                        model
                            .error_message
                            .map(|err| format!(" error: {err}"))
                            .unwrap_or_default()
                    );
                }
            }
            ModelCommands::Add {
                name,
                huggingface_id,
                categories,
                task_type,
                weight,
                config,
            } => {
                let config: serde_json::Value =
                    serde_json::from_str(&config).context("--config must be valid JSON")?;
                let id = db::add_model(
                    &pool,
                    &db::NewModel {
                        name,
                        huggingface_id,
                        task_type,
                        categories,
                        weight,
                        config,
                    },
                )
                .await?;
                println!("Registered model #{id}; workers load it on next start.");
            }
            ModelCommands::Remove { id } => {
                if db::deactivate_model(&pool, id).await? {
                    println!("Model #{id} deactivated.");
                } else {
                    println!("No model with id {id}.");
                }
            }
        },
    }

    Ok(())
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });
    cancel
}
