use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::{fs, net::TcpListener, sync::mpsc};
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use models::job::JobOutcome;
use services::{transcoder::FfmpegEngine, upload_service::UploadService};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting media-ingest with config: {:?}", cfg);

    // --- Ensure data directories exist ---
    for dir in cfg.data_dirs() {
        if !fs::try_exists(dir).await? {
            fs::create_dir_all(dir).await?;
            tracing::info!("Created directory at {}", dir.display());
        }
    }

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url).await?;

    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }
    db::run_migrations(&db).await?;

    // --- Initialize the upload pipeline ---
    let engine = Arc::new(FfmpegEngine::new(
        cfg.ffmpeg_bin.clone(),
        cfg.transcode_timeout(),
    ));
    let (service, outcomes) = UploadService::new(&cfg, db.clone(), engine);
    tokio::spawn(report_outcomes(outcomes));
    service.spawn_sweeper(cfg.sweep_interval(), cfg.session_ttl());

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_chunk_bytes).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Drain transcode outcomes. Rendition persistence would hook in here.
async fn report_outcomes(mut outcomes: mpsc::UnboundedReceiver<JobOutcome>) {
    while let Some(outcome) = outcomes.recv().await {
        match &outcome.result {
            Ok(path) => tracing::info!(
                session_id = %outcome.session_id,
                profile = %outcome.profile,
                job_id = %outcome.job_id,
                "rendition ready at {}",
                path.display()
            ),
            Err(message) => tracing::warn!(
                session_id = %outcome.session_id,
                profile = %outcome.profile,
                job_id = %outcome.job_id,
                "rendition failed: {}",
                message
            ),
        }
    }
}
