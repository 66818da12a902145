// Bringing workers into service: spawn, wait for health, then offer work
use std::sync::Arc;
use std::time::Duration;

use goera_common::types::{WorkerRecord, WorkerState};
use tracing::{info, warn};

use crate::supervisor::SupervisorError;
use crate::AppState;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawn a worker and promote it to `running` once `/health` answers.
///
/// Returns as soon as the process is started; the readiness probe runs in
/// the background and pumps the dispatcher queue when the worker comes up.
/// A worker that never becomes healthy is killed.
pub fn start_worker(
    state: &Arc<AppState>,
    port: Option<u16>,
) -> Result<WorkerRecord, SupervisorError> {
    let record = state.supervisor.spawn(port)?;
    let state = state.clone();
    let (port, pid) = (record.port, record.pid);

    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if state.supervisor.state_of(port, pid) != Some(WorkerState::Starting) {
                // exited or was killed while starting
                return;
            }
            if state.worker_client.healthy(port).await {
                if state.supervisor.mark_running(port, pid) {
                    info!(port, pid, "Worker ready");
                    state.dispatcher.pump();
                }
                return;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        warn!(port, pid, timeout_secs = READY_TIMEOUT.as_secs(), "Worker never became healthy");
        if state.supervisor.state_of(port, pid).is_some() {
            if let Err(e) = state.supervisor.kill(port).await {
                warn!(port, error = %e, "Failed to remove unhealthy worker");
            }
        }
    });

    Ok(record)
}
