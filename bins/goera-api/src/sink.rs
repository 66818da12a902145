// Result Sink: delivers verdicts to the web backend
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use goera_common::config::API_KEY_HEADER;
use goera_common::types::VerdictReport;
use reqwest::Url;
use tracing::debug;

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Deliver one verdict. Single attempt; the caller only logs failures.
    async fn report(&self, report: &VerdictReport) -> Result<()>;
}

/// POSTs `{submissionId, status, output}` to `{base}/internalapi/judge/{id}`
pub struct HttpResultSink {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpResultSink {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build result sink HTTP client")?;
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid result sink URL '{}'", base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("Result sink URL '{}' cannot carry a path", base_url);
        }
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// The id always lands in a single percent-encoded path segment
    fn endpoint(&self, submission_id: &str) -> Result<Url> {
        if matches!(submission_id, "" | "." | "..") {
            bail!("Submission id '{}' cannot be used in a sink path", submission_id);
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Result sink URL '{}' cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(["internalapi", "judge", submission_id]);
        Ok(url)
    }
}

#[async_trait]
impl ResultSink for HttpResultSink {
    async fn report(&self, report: &VerdictReport) -> Result<()> {
        let url = self.endpoint(&report.submission_id)?;
        debug!(url = %url, verdict = %report.status, "Posting verdict");

        let mut request = self.client.post(url.clone()).json(report);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        request
            .send()
            .await
            .with_context(|| format!("Failed to reach result sink at {}", url))?
            .error_for_status()
            .context("Result sink rejected the verdict")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use goera_common::types::Verdict;
    use parking_lot::Mutex;

    type Seen = Arc<Mutex<Vec<(Option<String>, VerdictReport)>>>;

    async fn receive(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(report): Json<VerdictReport>,
    ) -> StatusCode {
        let key = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let authorized = key.as_deref() == Some("secret");
        seen.lock().push((key, report));
        if authorized {
            StatusCode::OK
        } else {
            StatusCode::UNAUTHORIZED
        }
    }

    async fn serve(seen: Seen) -> String {
        let app = Router::new()
            .route("/internalapi/judge/:id", post(receive))
            .with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn report() -> VerdictReport {
        VerdictReport {
            submission_id: "77".to_string(),
            status: Verdict::WrongAnswer,
            output: "Overall Result: WrongAnswer\n".to_string(),
        }
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let sink = HttpResultSink::new("http://backend:5000/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            sink.endpoint("9").unwrap().as_str(),
            "http://backend:5000/internalapi/judge/9"
        );

        let nested = HttpResultSink::new("http://backend:5000/api/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            nested.endpoint("9").unwrap().as_str(),
            "http://backend:5000/api/internalapi/judge/9"
        );
    }

    #[test]
    fn test_endpoint_encodes_submission_id() {
        let sink = HttpResultSink::new("http://backend:5000", None, Duration::from_secs(1)).unwrap();

        let url = sink.endpoint("../../admin/users?x=1").unwrap();
        assert!(url.path().starts_with("/internalapi/judge/"));
        assert_eq!(url.query(), None);
        assert_eq!(url.path_segments().unwrap().count(), 3);

        assert!(sink.endpoint("..").is_err());
        assert!(sink.endpoint("").is_err());
    }

    #[test]
    fn test_invalid_base_url_is_error() {
        assert!(HttpResultSink::new("backend:5000", None, Duration::from_secs(1)).is_err());
        assert!(HttpResultSink::new("not a url", None, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_report_sends_key_and_payload() {
        let seen: Seen = Arc::default();
        let base = serve(seen.clone()).await;

        let sink = HttpResultSink::new(&base, Some("secret".to_string()), Duration::from_secs(5)).unwrap();
        sink.report(&report()).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.as_deref(), Some("secret"));
        assert_eq!(seen[0].1, report());
    }

    #[tokio::test]
    async fn test_rejection_is_error() {
        let seen: Seen = Arc::default();
        let base = serve(seen.clone()).await;

        let sink = HttpResultSink::new(&base, None, Duration::from_secs(5)).unwrap();
        assert!(sink.report(&report()).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_sink_is_error() {
        let sink = HttpResultSink::new("http://127.0.0.1:1", None, Duration::from_millis(500)).unwrap();
        assert!(sink.report(&report()).await.is_err());
    }
}
