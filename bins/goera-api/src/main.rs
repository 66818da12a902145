mod config;
mod dispatcher;
mod handlers;
mod metrics;
mod pool;
mod routes;
mod sink;
mod state_store;
mod supervisor;
mod worker_client;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::ApiConfig;
use crate::dispatcher::Dispatcher;
use crate::sink::HttpResultSink;
use crate::state_store::{StateGuard, StateStore};
use crate::supervisor::{ProcessManager, WorkerCommand};
use crate::worker_client::HttpWorkerClient;

const KILL_GRACE: Duration = Duration::from_secs(5);

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub supervisor: ProcessManager,
    pub worker_client: Arc<HttpWorkerClient>,
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
        .init();

    info!("Goera dispatcher booting...");

    let config = ApiConfig::from_env()?;
    if config.api_key.is_none() {
        warn!("INTERNAL_API_KEY is not set, verdicts are reported unauthenticated");
    }

    let store = StateStore::new(&config.state_dir);
    let _state_guard = StateGuard::new(store.clone());

    let command = WorkerCommand::new(&config.worker_bin).env("GOERA_WORKER_HOST", &config.worker_host);
    let supervisor = ProcessManager::new(
        command,
        config.base_port,
        config.listen_port(),
        store,
        KILL_GRACE,
    );

    let orphans = supervisor.recover_orphans();
    if orphans > 0 {
        warn!(orphans, "Terminated workers left by a previous run");
    }

    let worker_client = Arc::new(HttpWorkerClient::new(config.worker_host.clone()));
    let sink = HttpResultSink::new(
        &config.result_sink_url,
        config.api_key.clone(),
        config.report_timeout,
    )?;
    info!(url = %config.result_sink_url, "Result sink configured");

    let dispatcher = Dispatcher::new(
        Arc::new(supervisor.clone()),
        worker_client.clone(),
        Arc::new(sink),
    );

    let state = Arc::new(AppState {
        dispatcher,
        supervisor: supervisor.clone(),
        worker_client,
    });

    let app = Router::new()
        .merge(routes::routes())
        .with_state(state.clone());

    // Bind before spawning workers so a taken address does not leave children behind
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

    for _ in 0..config.initial_workers {
        if let Err(e) = pool::start_worker(&state, None) {
            error!(error = %e, "Failed to start worker");
        }
    }

    info!(
        addr = %config.listen_addr,
        workers = config.initial_workers,
        "HTTP server listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let stopped = supervisor.kill_all().await;
    info!(stopped, "Workers stopped");

    served.context("Server error")?;
    info!("Dispatcher shutdown complete");
    Ok(())
}

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

    warn!("Received shutdown signal, stopping workers");
}
