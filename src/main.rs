mod api;
mod config;
mod error;
mod input_store;
mod models;
mod queue;
mod registry;
mod service;
mod tools;
mod workspace;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use config::Config;
use service::JobService;
use tools::ToolDispatch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Multipart framing allowance on top of the aggregate upload limit.
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jobs: Arc<JobService>,
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.jobs.limits.max_total_bytes() + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/api/limits", get(api::limits))
        // POST takes a tool slug, GET a job id.
        .route("/api/jobs/{key}", get(api::job_status).post(api::create_job))
        .route("/api/jobs/{key}/download", get(api::download_job))
        .route("/api/tools/{tool}", post(api::run_tool))
        .layer(DefaultBodyLimit::max(
            usize::try_from(body_limit).unwrap_or(usize::MAX),
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pdf_workbench_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    workspace::ensure_root(&config.jobs.job_root).await?;
    workspace::ensure_root(&config.jobs.tmp_root).await?;

    let (jobs, workers) = JobService::start(config.jobs.clone(), Arc::new(ToolDispatch));
    let app = build_router(AppState {
        config: config.clone(),
        jobs,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        job_root = %config.jobs.job_root.display(),
        "pdf-workbench-api listening on {}",
        config.bind_addr
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    workers.stop().await;
    info!("pdf-workbench-api stopped");
    Ok(())
}
