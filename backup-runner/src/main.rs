mod config;
mod db;
mod error;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::db::connection::{create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::db::store::{SqliteHistoryStore, SqliteJobStore};
use crate::services::driver::{drive_to_end, spawn_drive, with_orchestrator};
use crate::services::watcher::start_stall_watcher;
use crate::state::AppState;
use backup_engine::database::sqlite::SqliteConnector;
use backup_engine::utils::logger;
use backup_engine::{BackupOrchestrator, JobKind, JobPhase, JobRequest};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable site backups")]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a backup to completion in the foreground
    Run {
        /// database, files or full
        #[arg(short, long, default_value = "full")]
        kind: JobKind,

        /// Extra destination ids, on top of the configured ones
        #[arg(short, long)]
        destination: Vec<String>,
    },
    /// Serve the continuation endpoint and watch for stalled jobs
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the persisted status of a job
    Status { id: String },
    /// Ask whichever process drives the job to cancel it
    Cancel { id: String },
}

fn build_orchestrator(config: &AppConfig, pool: &DbPool) -> BackupOrchestrator {
    let mut orchestrator = BackupOrchestrator::new(
        config.engine.clone(),
        Box::new(SqliteJobStore::new(pool.clone())),
        Box::new(SqliteHistoryStore::new(pool.clone())),
    );
    if let Some(path) = &config.site_database {
        orchestrator = orchestrator.with_database(Arc::new(SqliteConnector::new(path.clone())));
    }
    orchestrator
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::from_env(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    logger::init(&config.log_level)?;
    config.engine.validate()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let pool = create_pool(&config.db_path.to_string_lossy())?;
    migrate(&pool, &config.data_dir)?;

    let orchestrator = build_orchestrator(&config, &pool);
    let state = Arc::new(AppState::new(pool, config, orchestrator));

    let result = match args.command {
        Command::Run { kind, destination } => run(state.clone(), kind, destination).await,
        Command::Serve { port } => serve(state.clone(), port).await,
        Command::Status { id } => {
            let job = with_orchestrator(&state.orchestrator, move |o| o.status(&id)).await??;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::Cancel { id } => {
            let job =
                with_orchestrator(&state.orchestrator, move |o| o.request_cancel(&id)).await??;
            println!("{}: {}", job.id, job.message);
            Ok(())
        }
    };

    db::connection::close_pool(&state.db);
    result
}

async fn run(state: Arc<AppState>, kind: JobKind, destinations: Vec<String>) -> anyhow::Result<()> {
    let mut request = JobRequest::new(kind);
    request.destinations = destinations;
    let job = with_orchestrator(&state.orchestrator, move |o| o.start(request)).await??;
    tracing::info!(job_id = %job.id, kind = kind.as_str(), "Backup started");

    let cancel = state.cancel.clone();
    let job = tokio::select! {
        job = drive_to_end(&state.orchestrator, &job.id) => job?,
        _ = shutdown_signal(cancel) => {
            let id = job.id.clone();
            let job = with_orchestrator(&state.orchestrator, move |o| o.cancel(&id)).await??;
            tracing::warn!(job_id = %job.id, "Backup interrupted");
            job
        }
    };

    match job.phase {
        JobPhase::Completed => {
            tracing::info!(
                job_id = %job.id,
                size = job.result_size.unwrap_or(0),
                uploaded_to = ?job.uploaded_to,
                "{}",
                job.message
            );
            for issue in &job.errors {
                tracing::warn!("{}", issue.describe());
            }
            Ok(())
        }
        phase => {
            for issue in &job.critical_errors {
                tracing::error!("{}", issue.describe());
            }
            anyhow::bail!("backup {} ended as {:?}: {}", job.id, phase, job.message)
        }
    }
}

async fn serve(state: Arc<AppState>, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(state.config.port);

    // Jobs left running by a previous process
    let active = with_orchestrator(&state.orchestrator, |o| o.active_jobs()).await??;
    for job in active {
        tracing::info!(job_id = %job.id, phase = ?job.phase, "Resuming backup job");
        spawn_drive(state.clone(), job.id).await;
    }

    let stall_check = Duration::from_secs(state.config.engine.orchestrator.stall_after_secs.max(10) / 2);
    start_stall_watcher(state.clone(), stall_check);

    let app = routes::create_router(state.clone());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.cancel.clone()))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
