// HTTP route handlers for a Goera worker

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use goera_common::types::{Submission, SubmitRequest, Verdict, VerdictReport};
use tracing::{error, info, warn};

use crate::AppState;

/// POST /run - Judge one submission synchronously
pub async fn run_submission(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> impl IntoResponse {
    let submission = match Submission::try_from(request) {
        Ok(submission) => submission,
        Err(e) => {
            warn!(error = %e, "Rejected run request");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let _busy = state.gate.lock().await;

    info!(
        submission_id = %submission.id,
        test_cases = submission.test_cases.len(),
        source_size = submission.source_code.len(),
        image = %submission.sandbox_image,
        "Received submission"
    );

    let start = Instant::now();
    let report = match state.judge.judge(&submission).await {
        Ok(report) => report.into_report(&submission.id),
        Err(e) => {
            error!(submission_id = %submission.id, error = %e, "Judging failed on infrastructure error");
            VerdictReport {
                submission_id: submission.id.clone(),
                status: Verdict::RuntimeError,
                output: format!("Internal error while judging: {:#}", e),
            }
        }
    };

    info!(
        submission_id = %submission.id,
        verdict = %report.status,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Submission judged"
    );

    (StatusCode::OK, Json(report)).into_response()
}

/// GET /health - Liveness plus whether a submission is being judged
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let busy = state.gate.try_lock().is_err();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "port": state.port,
            "busy": busy,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use goera_common::limits::Scalar;
    use goera_judge::runtime::{SandboxIo, SandboxSpec};
    use goera_judge::toolchain::CompileOutput;
    use goera_judge::{Judge, JudgeConfig, SandboxRuntime, Toolchain};
    use tokio::sync::Mutex;

    /// Container runtime whose daemon is unreachable
    struct UnreachableRuntime;

    #[async_trait]
    impl SandboxRuntime for UnreachableRuntime {
        async fn image_exists(&self, _image: &str) -> Result<bool> {
            bail!("Cannot connect to the Docker daemon")
        }

        async fn build_image(&self, _image: &str, _dockerfile: &str) -> Result<()> {
            bail!("Cannot connect to the Docker daemon")
        }

        async fn create(&self, _spec: &SandboxSpec) -> Result<String> {
            bail!("Cannot connect to the Docker daemon")
        }

        async fn attach(&self, _id: &str) -> Result<SandboxIo> {
            bail!("Cannot connect to the Docker daemon")
        }

        async fn start(&self, _id: &str) -> Result<()> {
            bail!("Cannot connect to the Docker daemon")
        }

        async fn wait(&self, _id: &str) -> Result<i64> {
            bail!("Cannot connect to the Docker daemon")
        }

        async fn stop(&self, _id: &str, _grace: Duration) -> Result<()> {
            bail!("Cannot connect to the Docker daemon")
        }

        async fn remove(&self, _id: &str) -> Result<()> {
            bail!("Cannot connect to the Docker daemon")
        }
    }

    struct NoCompiler;

    #[async_trait]
    impl Toolchain for NoCompiler {
        fn source_file_name(&self) -> &str {
            "main.go"
        }

        async fn compile(&self, _source: &Path, _output: &Path) -> Result<CompileOutput> {
            bail!("compiler must not run when the image check fails")
        }
    }

    fn state() -> Arc<AppState> {
        Arc::new(AppState {
            judge: Judge::new(
                Arc::new(UnreachableRuntime),
                Arc::new(NoCompiler),
                JudgeConfig::default(),
            ),
            port: 8081,
            gate: Mutex::new(()),
        })
    }

    fn request(id: &str) -> SubmitRequest {
        SubmitRequest {
            submission_id: Scalar::Text(id.to_string()),
            source_code: "package main".to_string(),
            test_cases: Vec::new(),
            time_limit: None,
            memory_limit: None,
            cpu_count: None,
            docker_image: None,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_infrastructure_failure_is_runtime_error() {
        let state = state();
        let response = run_submission(State(state.clone()), Json(request("31")))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let report: VerdictReport = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(report.submission_id, "31");
        assert_eq!(report.status, Verdict::RuntimeError);
        assert!(report.output.starts_with("Internal error while judging"));
        assert!(report.output.contains("Cannot connect to the Docker daemon"));

        // the gate is released for the next submission
        assert!(state.gate.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_request_is_bad_request() {
        let response = run_submission(State(state()), Json(request("")))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "missing submissionId");
    }

    #[tokio::test]
    async fn test_health_reports_idle_worker() {
        let response = health_check(State(state())).await.into_response();
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["port"], 8081);
        assert_eq!(body["busy"], false);
    }
}
