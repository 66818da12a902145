/// Worker Process Manager
///
/// **Core Responsibility:**
/// Own the pool of `goera-worker` child processes, one per port.
///
/// **Lifecycle of a worker:**
/// - `spawn` starts the process with `GOERA_WORKER_PORT` set and records it as
///   `starting`; `mark_running` flips it once the worker answers its health check
/// - a reaper task per child waits for exit; an unrequested exit marks the
///   record `stopped` (it stays listed until killed)
/// - `kill` removes the record, sends SIGTERM and escalates to SIGKILL after
///   the grace period
///
/// Every topology change is persisted through `StateStore`.
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use goera_common::types::{WorkerRecord, WorkerState};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatcher::WorkerPool;
use crate::state_store::StateStore;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("port {0} is already registered")]
    PortTaken(u16),
    #[error("port {0} is reserved")]
    PortReserved(u16),
    #[error("no worker registered on port {0}")]
    UnknownWorker(u16),
    #[error("no free port available")]
    PortsExhausted,
    #[error("failed to spawn worker on port {port}: {source}")]
    Spawn {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// How to launch one worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

struct Entry {
    record: WorkerRecord,
    kill_tx: Option<oneshot::Sender<()>>,
    reaper: Option<JoinHandle<()>>,
}

struct Inner {
    command: WorkerCommand,
    base_port: u16,
    /// Never handed to a worker (e.g. the dispatcher's own listener)
    reserved: BTreeSet<u16>,
    kill_grace: Duration,
    store: StateStore,
    workers: Mutex<BTreeMap<u16, Entry>>,
}

impl Inner {
    fn snapshot(workers: &BTreeMap<u16, Entry>) -> Vec<WorkerRecord> {
        workers.values().map(|e| e.record.clone()).collect()
    }

    fn persist(&self, records: &[WorkerRecord]) {
        if let Err(e) = self.store.save(records) {
            warn!("Failed to persist worker state: {:#}", e);
        }
    }

    /// Reaper callback for a process that exited without being asked to
    fn mark_stopped(&self, port: u16, pid: u32) {
        let snapshot = {
            let mut workers = self.workers.lock();
            match workers.get_mut(&port) {
                Some(entry) if entry.record.pid == pid => {
                    entry.record.state = WorkerState::Stopped;
                    entry.kill_tx = None;
                }
                _ => return,
            }
            Self::snapshot(&workers)
        };
        self.persist(&snapshot);
    }
}

/// Lowest unreserved port above every registered one, or from `base` for an empty pool
fn next_port(
    workers: &BTreeMap<u16, Entry>,
    base: u16,
    reserved: &BTreeSet<u16>,
) -> Result<u16, SupervisorError> {
    let mut port = match workers.keys().next_back() {
        Some(&highest) if highest >= base => {
            highest.checked_add(1).ok_or(SupervisorError::PortsExhausted)?
        }
        _ => base,
    };
    while reserved.contains(&port) {
        port = port.checked_add(1).ok_or(SupervisorError::PortsExhausted)?;
    }
    Ok(port)
}

fn pid_alive(pid: u32) -> bool {
    pid != 0 && signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

async fn terminate(child: &mut Child, pid: u32, grace: Duration) {
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM not delivered");
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(pid, grace_ms = grace.as_millis() as u64, "Worker ignored SIGTERM, killing");
        if let Err(e) = child.kill().await {
            error!(pid, error = %e, "Failed to kill worker");
        }
    }
}

async fn reap(
    inner: Arc<Inner>,
    port: u16,
    pid: u32,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => warn!(port, pid, status = %status, "Worker exited"),
                Err(e) => error!(port, pid, error = %e, "Failed to wait for worker"),
            }
            inner.mark_stopped(port, pid);
        }
        _ = kill_rx => {
            terminate(&mut child, pid, inner.kill_grace).await;
            info!(port, pid, "Worker terminated");
        }
    }
}

#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

impl ProcessManager {
    pub fn new(
        command: WorkerCommand,
        base_port: u16,
        reserved: impl IntoIterator<Item = u16>,
        store: StateStore,
        kill_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                command,
                base_port,
                reserved: reserved.into_iter().collect(),
                kill_grace,
                store,
                workers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Terminate processes recorded by a previous supervisor that never
    /// cleaned up, then forget its state. Returns how many were signalled.
    pub fn recover_orphans(&self) -> usize {
        let records = match self.inner.store.load() {
            Ok(records) => records,
            Err(e) => {
                warn!("Ignoring unreadable worker state: {:#}", e);
                Vec::new()
            }
        };

        let mut signalled = 0;
        for record in records.iter().filter(|r| r.state != WorkerState::Stopped) {
            if !pid_alive(record.pid) {
                continue;
            }
            warn!(port = record.port, pid = record.pid, "Terminating orphaned worker");
            match signal::kill(Pid::from_raw(record.pid as i32), Signal::SIGTERM) {
                Ok(()) => signalled += 1,
                Err(e) => warn!(pid = record.pid, error = %e, "Failed to signal orphan"),
            }
        }

        if let Err(e) = self.inner.store.clear() {
            warn!("Failed to clear stale worker state: {:#}", e);
        }
        signalled
    }

    /// Launch a worker on `port`, or on the next free port when `None`
    pub fn spawn(&self, port: Option<u16>) -> Result<WorkerRecord, SupervisorError> {
        let inner = &self.inner;
        let mut workers = inner.workers.lock();

        let port = match port {
            Some(port) if inner.reserved.contains(&port) => {
                return Err(SupervisorError::PortReserved(port))
            }
            Some(port) => match workers.get(&port) {
                Some(entry) if entry.record.state != WorkerState::Stopped => {
                    return Err(SupervisorError::PortTaken(port))
                }
                _ => port,
            },
            None => next_port(&workers, inner.base_port, &inner.reserved)?,
        };

        let child = Command::new(&inner.command.program)
            .args(&inner.command.args)
            .envs(inner.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("GOERA_WORKER_PORT", port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn { port, source })?;

        let pid = child.id().unwrap_or_default();
        let record = WorkerRecord {
            port,
            pid,
            state: WorkerState::Starting,
            started_at: Utc::now(),
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let reaper = tokio::spawn(reap(inner.clone(), port, pid, child, kill_rx));

        workers.insert(
            port,
            Entry {
                record: record.clone(),
                kill_tx: Some(kill_tx),
                reaper: Some(reaper),
            },
        );
        let snapshot = Inner::snapshot(&workers);
        drop(workers);

        inner.persist(&snapshot);
        info!(port, pid, "Worker spawned");
        Ok(record)
    }

    /// Promote a starting worker once it is ready to accept work
    pub fn mark_running(&self, port: u16, pid: u32) -> bool {
        let snapshot = {
            let mut workers = self.inner.workers.lock();
            match workers.get_mut(&port) {
                Some(entry)
                    if entry.record.pid == pid && entry.record.state == WorkerState::Starting =>
                {
                    entry.record.state = WorkerState::Running;
                }
                _ => return false,
            }
            Inner::snapshot(&workers)
        };
        self.inner.persist(&snapshot);
        true
    }

    /// Current state of the worker with this port and pid, if still registered
    pub fn state_of(&self, port: u16, pid: u32) -> Option<WorkerState> {
        self.inner
            .workers
            .lock()
            .get(&port)
            .filter(|entry| entry.record.pid == pid)
            .map(|entry| entry.record.state)
    }

    /// Unregister and terminate; resolves once the process is gone
    pub async fn kill(&self, port: u16) -> Result<WorkerRecord, SupervisorError> {
        let (entry, snapshot) = {
            let mut workers = self.inner.workers.lock();
            let entry = workers
                .remove(&port)
                .ok_or(SupervisorError::UnknownWorker(port))?;
            (entry, Inner::snapshot(&workers))
        };
        self.inner.persist(&snapshot);

        let Entry {
            mut record,
            kill_tx,
            reaper,
        } = entry;

        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        if let Some(reaper) = reaper {
            let bound = self.inner.kill_grace + Duration::from_secs(1);
            if tokio::time::timeout(bound, reaper).await.is_err() {
                warn!(port, "Worker reaper did not finish in time");
            }
        }

        record.state = WorkerState::Stopped;
        info!(port, pid = record.pid, "Worker removed");
        Ok(record)
    }

    /// Terminate every worker and delete the persisted state
    pub async fn kill_all(&self) -> usize {
        let ports: Vec<u16> = self.inner.workers.lock().keys().copied().collect();
        let mut stopped = 0;
        for port in ports {
            if self.kill(port).await.is_ok() {
                stopped += 1;
            }
        }
        if let Err(e) = self.inner.store.clear() {
            warn!("Failed to clear worker state: {:#}", e);
        }
        stopped
    }

    pub fn list(&self) -> Vec<WorkerRecord> {
        Inner::snapshot(&self.inner.workers.lock())
    }
}

impl WorkerPool for ProcessManager {
    fn live_ports(&self) -> Vec<u16> {
        self.inner
            .workers
            .lock()
            .values()
            .filter(|e| e.record.state == WorkerState::Running)
            .map(|e| e.record.port)
            .collect()
    }

    fn records(&self) -> Vec<WorkerRecord> {
        self.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path, command: WorkerCommand) -> ProcessManager {
        ProcessManager::new(
            command,
            9100,
            [9150],
            StateStore::new(dir.join("state")),
            Duration::from_secs(2),
        )
    }

    fn sleeper() -> WorkerCommand {
        WorkerCommand {
            args: vec!["30".to_string()],
            ..WorkerCommand::new("sleep")
        }
    }

    async fn wait_for_state(pm: &ProcessManager, port: u16, state: WorkerState) -> bool {
        for _ in 0..100 {
            if pm.list().iter().any(|r| r.port == port && r.state == state) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_spawn_assigns_ports_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), sleeper());

        let first = pm.spawn(None).unwrap();
        let second = pm.spawn(None).unwrap();
        let explicit = pm.spawn(Some(9200)).unwrap();
        let after = pm.spawn(None).unwrap();

        assert_eq!(first.port, 9100);
        assert_eq!(second.port, 9101);
        assert_eq!(explicit.port, 9200);
        assert_eq!(after.port, 9201);
        assert_eq!(first.state, WorkerState::Starting);
        assert!(pid_alive(first.pid));

        let persisted = StateStore::new(dir.path().join("state")).load().unwrap();
        assert_eq!(persisted.len(), 4);

        assert_eq!(pm.kill_all().await, 4);
        assert!(!pid_alive(first.pid));
        assert!(pm.list().is_empty());
        assert!(!dir.path().join("state").join("runners.json").exists());
    }

    #[tokio::test]
    async fn test_spawn_rejects_taken_port() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), sleeper());

        pm.spawn(Some(9300)).unwrap();
        assert!(matches!(pm.spawn(Some(9300)), Err(SupervisorError::PortTaken(9300))));

        pm.kill_all().await;
    }

    #[tokio::test]
    async fn test_reserved_port_is_skipped_and_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pm = ProcessManager::new(
            sleeper(),
            9500,
            [9501],
            StateStore::new(dir.path().join("state")),
            Duration::from_secs(2),
        );

        assert_eq!(pm.spawn(None).unwrap().port, 9500);
        assert_eq!(pm.spawn(None).unwrap().port, 9502);
        assert!(matches!(pm.spawn(Some(9501)), Err(SupervisorError::PortReserved(9501))));
        assert!(pm.list().iter().all(|r| r.port != 9501));

        pm.kill_all().await;
    }

    #[tokio::test]
    async fn test_only_running_workers_are_live() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), sleeper());

        let record = pm.spawn(None).unwrap();
        assert!(pm.live_ports().is_empty());

        assert!(pm.mark_running(record.port, record.pid));
        assert!(!pm.mark_running(record.port, record.pid));
        assert_eq!(pm.live_ports(), vec![record.port]);
        assert_eq!(pm.state_of(record.port, record.pid), Some(WorkerState::Running));

        pm.kill_all().await;
    }

    #[tokio::test]
    async fn test_kill_terminates_and_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), sleeper());

        let record = pm.spawn(None).unwrap();
        let killed = pm.kill(record.port).await.unwrap();

        assert_eq!(killed.state, WorkerState::Stopped);
        assert!(!pid_alive(record.pid));
        assert!(pm.list().is_empty());
        assert!(matches!(
            pm.kill(record.port).await,
            Err(SupervisorError::UnknownWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_crashed_worker_marked_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), WorkerCommand {
            args: vec!["-c".to_string(), "exit 3".to_string()],
            ..WorkerCommand::new("sh")
        });

        let record = pm.spawn(None).unwrap();
        assert!(wait_for_state(&pm, record.port, WorkerState::Stopped).await);
        assert!(pm.live_ports().is_empty());

        // a stopped slot can be reused
        let replacement = pm.spawn(Some(record.port)).unwrap();
        assert_ne!(replacement.pid, record.pid);
        pm.kill_all().await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), WorkerCommand::new("/nonexistent/goera-worker"));

        assert!(matches!(pm.spawn(None), Err(SupervisorError::Spawn { port: 9100, .. })));
        assert!(pm.list().is_empty());
    }

    #[tokio::test]
    async fn test_recover_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));

        let mut orphan = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        store
            .save(&[WorkerRecord {
                port: 9400,
                pid: orphan.id(),
                state: WorkerState::Running,
                started_at: Utc::now(),
            }])
            .unwrap();

        let pm = manager(dir.path(), sleeper());
        assert_eq!(pm.recover_orphans(), 1);

        let status = orphan.wait().unwrap();
        assert!(!status.success());
        assert!(store.load().unwrap().is_empty());
    }
}
