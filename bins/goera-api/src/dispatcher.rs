/// Submission Dispatcher
///
/// **Core Responsibility:**
/// Hand each submission to exactly one idle worker, queue the rest in FIFO
/// order, and forward every verdict to the result sink.
///
/// **Invariants:**
/// - At most one submission in flight per worker. The busy set below is the
///   only authority on this; workers are never asked whether they are busy.
/// - Queue and busy set change together under one lock, and that lock is
///   never held across a judging call or a report.
/// - A worker is released before its verdict is reported, so a slow or
///   failing sink never holds a worker hostage.
/// - Infrastructure failures become `RuntimeError` verdicts here; the sink
///   never sees a transport error.
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use goera_common::types::{Submission, Verdict, VerdictReport, WorkerRecord, WorkerStatus};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::metrics;
use crate::sink::ResultSink;
use crate::worker_client::WorkerClient;

/// Read-only view of the worker pool
pub trait WorkerPool: Send + Sync {
    /// Ports of workers able to take a submission right now
    fn live_ports(&self) -> Vec<u16>;

    fn records(&self) -> Vec<WorkerRecord>;
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<Submission>,
    busy: HashSet<u16>,
}

struct Inner {
    state: Mutex<DispatchState>,
    pool: Arc<dyn WorkerPool>,
    client: Arc<dyn WorkerClient>,
    sink: Arc<dyn ResultSink>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<dyn WorkerPool>,
        client: Arc<dyn WorkerClient>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(DispatchState::default()),
                pool,
                client,
                sink,
            }),
        }
    }

    /// Accept a submission; returns immediately
    pub fn submit(&self, submission: Submission) {
        metrics::SUBMISSIONS_RECEIVED.inc();
        info!(
            submission_id = %submission.id,
            test_cases = submission.test_cases.len(),
            "Submission accepted"
        );

        let assignments = {
            let mut state = self.inner.state.lock();
            state.queue.push_back(submission);
            self.assign(&mut state)
        };
        self.launch_all(assignments);
    }

    /// Offer queued submissions to idle workers, e.g. after a worker came up
    pub fn pump(&self) {
        let assignments = {
            let mut state = self.inner.state.lock();
            self.assign(&mut state)
        };
        self.launch_all(assignments);
    }

    /// A worker finished its submission (successfully or not)
    pub fn on_worker_done(&self, port: u16) {
        let assignments = {
            let mut state = self.inner.state.lock();
            let live = self.inner.pool.live_ports().contains(&port);

            let assignments = if live {
                match state.queue.pop_front() {
                    // stays busy
                    Some(next) => vec![(port, next)],
                    None => {
                        state.busy.remove(&port);
                        Vec::new()
                    }
                }
            } else {
                warn!(port, "Worker gone after judging, releasing it");
                state.busy.remove(&port);
                self.assign(&mut state)
            };
            record_gauges(&state);
            assignments
        };
        self.launch_all(assignments);
    }

    /// Pair idle live workers with queue heads, marking them busy
    fn assign(&self, state: &mut DispatchState) -> Vec<(u16, Submission)> {
        let mut assignments = Vec::new();
        for port in self.inner.pool.live_ports() {
            if state.queue.is_empty() {
                break;
            }
            if state.busy.contains(&port) {
                continue;
            }
            if let Some(submission) = state.queue.pop_front() {
                state.busy.insert(port);
                assignments.push((port, submission));
            }
        }
        record_gauges(state);
        assignments
    }

    fn launch_all(&self, assignments: Vec<(u16, Submission)>) {
        for (port, submission) in assignments {
            self.launch(port, submission);
        }
    }

    fn launch(&self, port: u16, submission: Submission) {
        let dispatcher = self.clone();
        info!(submission_id = %submission.id, port, "Dispatching submission");

        tokio::spawn(async move {
            let inner = &dispatcher.inner;
            // a panicking client must still release the worker below
            let client = inner.client.clone();
            let job = submission.clone();
            let call = tokio::spawn(async move { client.run(port, &job).await }).await;

            let mut report = match call {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    error!(submission_id = %submission.id, port, error = %e, "Worker call failed");
                    VerdictReport {
                        submission_id: submission.id.clone(),
                        status: Verdict::RuntimeError,
                        output: format!("Judging failed on worker {}: {:#}", port, e),
                    }
                }
                Err(e) => {
                    error!(submission_id = %submission.id, port, error = %e, "Worker call panicked");
                    VerdictReport {
                        submission_id: submission.id.clone(),
                        status: Verdict::RuntimeError,
                        output: format!("Judging failed on worker {}: {}", port, e),
                    }
                }
            };
            report.submission_id = submission.id.clone();
            metrics::VERDICTS
                .with_label_values(&[report.status.as_str()])
                .inc();

            dispatcher.on_worker_done(port);

            match inner.sink.report(&report).await {
                Ok(()) => info!(
                    submission_id = %report.submission_id,
                    verdict = %report.status,
                    "Verdict reported"
                ),
                Err(e) => {
                    metrics::REPORT_FAILURES.inc();
                    error!(
                        submission_id = %report.submission_id,
                        verdict = %report.status,
                        error = %e,
                        "Failed to report verdict"
                    );
                }
            }
        });
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn busy_count(&self) -> usize {
        self.inner.state.lock().busy.len()
    }

    /// Worker records together with their busy flags
    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        let records = self.inner.pool.records();
        let state = self.inner.state.lock();
        records
            .into_iter()
            .map(|record| WorkerStatus {
                busy: state.busy.contains(&record.port),
                record,
            })
            .collect()
    }
}

fn record_gauges(state: &DispatchState) {
    metrics::QUEUE_DEPTH.set(state.queue.len() as i64);
    metrics::BUSY_WORKERS.set(state.busy.len() as i64);
}
