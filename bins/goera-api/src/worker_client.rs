// HTTP client for goera-worker processes
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use goera_common::types::{Submission, VerdictReport};
use reqwest::StatusCode;
use tracing::debug;

/// Image pull/build and compilation happen before the first test case
const BASE_ALLOWANCE: Duration = Duration::from_secs(120);

/// Per test case on top of its time limit: container create, start and teardown
const PER_CASE_OVERHEAD: Duration = Duration::from_secs(15);

/// Ceiling for `run_timeout` whatever the limits and case count
const MAX_RUN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);

#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Judge `submission` on the worker listening on `port`
    async fn run(&self, port: u16, submission: &Submission) -> Result<VerdictReport>;
}

/// Upper bound for one synchronous `/run` call
pub fn run_timeout(submission: &Submission) -> Duration {
    let per_case = submission.limits.time_limit.saturating_add(PER_CASE_OVERHEAD);
    let cases = u32::try_from(submission.test_cases.len()).unwrap_or(u32::MAX);
    per_case
        .checked_mul(cases)
        .and_then(|total| total.checked_add(BASE_ALLOWANCE))
        .map_or(MAX_RUN_TIMEOUT, |total| total.min(MAX_RUN_TIMEOUT))
}

pub struct HttpWorkerClient {
    client: reqwest::Client,
    host: String,
}

impl HttpWorkerClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into(),
        }
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, path)
    }

    /// True once the worker answers `GET /health`
    pub async fn healthy(&self, port: u16) -> bool {
        match self
            .client
            .get(self.url(port, "/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(port, error = %e, "Health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn run(&self, port: u16, submission: &Submission) -> Result<VerdictReport> {
        let url = self.url(port, "/run");
        let response = self
            .client
            .post(&url)
            .timeout(run_timeout(submission))
            .json(&submission.to_request())
            .send()
            .await
            .with_context(|| format!("Worker on port {} did not answer", port))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            bail!("Worker on port {} rejected the submission: {}", port, body);
        }
        if !status.is_success() {
            bail!("Worker on port {} returned {}", port, status);
        }

        response
            .json::<VerdictReport>()
            .await
            .with_context(|| format!("Worker on port {} sent an unreadable verdict", port))
    }
}
