mod handlers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use goera_common::config::{env_or, env_parse};
use goera_judge::config::DEFAULT_CONFIG_PATH;
use goera_judge::{DockerRuntime, HostToolchain, Judge, JudgeConfig};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub struct AppState {
    pub judge: Judge,
    pub port: u16,
    /// Held for the whole of one judging run: a worker judges one submission at a time
    pub gate: Mutex<()>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let port: u16 = env_parse("GOERA_WORKER_PORT", 8081)?;
    let host = env_or("GOERA_WORKER_HOST", "127.0.0.1");

    info!(port, "Goera worker booting...");

    let config_path = PathBuf::from(env_or("GOERA_JUDGE_CONFIG", DEFAULT_CONFIG_PATH));
    let config = JudgeConfig::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), "Failed to load judge config: {:#}", e);
        e
    })?;

    info!(
        compiler = %config.toolchain.command,
        compile_timeout_ms = config.toolchain.compile_timeout_ms,
        "Toolchain configured"
    );

    // Without a reachable container runtime this worker cannot judge anything
    let runtime = DockerRuntime::connect()?;
    runtime.ping().await.map_err(|e| {
        error!("Docker is not reachable: {:#}", e);
        e
    })?;
    info!("Connected to Docker");

    let toolchain = HostToolchain::new(config.toolchain.clone());
    let judge = Judge::new(Arc::new(runtime), Arc::new(toolchain), config);

    let state = Arc::new(AppState {
        judge,
        port,
        gate: Mutex::new(()),
    });

    let app = Router::new()
        .route("/run", post(handlers::run_submission))
        .route("/health", get(handlers::health_check))
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind worker to {}", addr))?;

    info!(addr = %addr, "Worker ready to judge");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Worker server error")?;

    info!("Worker shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM (what the supervisor sends)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Received shutdown signal");
}
