use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};

use newsroom::app::{app_api_loop, AppState};
use newsroom::clustering::refresh_clusters;
use newsroom::db::Database;
use newsroom::environment::Settings;
use newsroom::logging::configure_logging;
use newsroom::pipeline::worker::{refresh_loop, run_ingest_once, spawn_workers};
use newsroom::pipeline::Collaborators;
use newsroom::resolver::{resolve_pending, verify_primary_invariant};
use newsroom::WorkerDetail;

#[derive(Parser)]
#[clap(name = "newsroom", about = "Regional news pipeline and review service")]
struct Cli {
    /// SQLite database file, overrides DATABASE_PATH
    #[clap(long)]
    database_path: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API, the pipeline workers and the periodic cluster refresh
    Serve {
        /// Listen port, overrides PORT
        #[clap(short, long)]
        port: Option<u16>,

        /// Simultaneous collaborator calls per gate pass, overrides WORKER_CONCURRENCY
        #[clap(short, long)]
        workers: Option<usize>,
    },

    /// Run the pipeline workers without the API
    Work {
        /// Simultaneous collaborator calls per gate pass, overrides WORKER_CONCURRENCY
        #[clap(short, long)]
        workers: Option<usize>,
    },

    /// Rebuild the cluster cache once
    Refresh,

    /// Run one keyword filter and primary resolution pass, then check primary pointers
    Resolve,
}

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging("newsroom");

    let args = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(path) = args.database_path {
        settings.database_path = path;
    }

    let db = Database::new(&settings.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", settings.database_path))?;

    match args.command {
        Commands::Serve { port, workers } => {
            if let Some(port) = port {
                settings.port = port;
            }
            if let Some(workers) = workers {
                settings.worker_concurrency = workers.max(1);
            }
            let collaborators = Collaborators::from_settings(&settings);
            spawn_workers(&db, &settings, &collaborators);
            tokio::spawn(refresh_loop(
                db.clone(),
                settings.clone(),
                collaborators.clone(),
                WorkerDetail::new("cluster refresh", 0),
            ));

            let state = AppState {
                db,
                settings: Arc::new(settings),
                grouper: collaborators.grouper,
            };
            app_api_loop(state).await?;
        }
        Commands::Work { workers } => {
            if let Some(workers) = workers {
                settings.worker_concurrency = workers.max(1);
            }
            let collaborators = Collaborators::from_settings(&settings);
            spawn_workers(&db, &settings, &collaborators);
            refresh_loop(
                db,
                settings,
                collaborators,
                WorkerDetail::new("cluster refresh", 0),
            )
            .await;
        }
        Commands::Refresh => {
            let collaborators = Collaborators::from_settings(&settings);
            let outcome =
                refresh_clusters(&db, &settings, collaborators.grouper.as_ref()).await?;
            info!("Cluster refresh: {:?}", outcome);
        }
        Commands::Resolve => {
            let processed = run_ingest_once(&db, &settings).await?;
            // A second resolution pass picks up anything the filter produced at the tail.
            let stats = resolve_pending(&db, settings.simhash_max_distance, settings.batch_size).await?;
            info!("Processed {} articles, trailing resolution: {:?}", processed, stats);

            let violations = verify_primary_invariant(&db).await?;
            if violations.is_empty() {
                info!("Every resolved article points at a primary");
            } else {
                error!("{} articles point at something other than a primary: {:?}", violations.len(), violations);
            }
        }
    }

    Ok(())
}
