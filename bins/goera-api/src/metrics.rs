// Prometheus metrics for the dispatcher
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

// Metric names and help strings are constant, so registration only fails on a
// duplicate name, which is a programming error.
lazy_static! {
    pub static ref SUBMISSIONS_RECEIVED: IntCounter = register_int_counter!(
        "goera_submissions_received_total",
        "Submissions accepted by the dispatcher"
    )
    .expect("register goera_submissions_received_total");
    pub static ref VERDICTS: IntCounterVec = register_int_counter_vec!(
        "goera_verdicts_total",
        "Verdicts produced, by status",
        &["status"]
    )
    .expect("register goera_verdicts_total");
    pub static ref REPORT_FAILURES: IntCounter = register_int_counter!(
        "goera_report_failures_total",
        "Verdicts that could not be delivered to the result sink"
    )
    .expect("register goera_report_failures_total");
    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "goera_queue_depth",
        "Submissions waiting for a free worker"
    )
    .expect("register goera_queue_depth");
    pub static ref BUSY_WORKERS: IntGauge = register_int_gauge!(
        "goera_busy_workers",
        "Workers currently judging a submission"
    )
    .expect("register goera_busy_workers");
}

/// Text exposition of every registered metric
pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        SUBMISSIONS_RECEIVED.inc();
        VERDICTS.with_label_values(&["Accepted"]).inc();

        let text = render().unwrap();
        assert!(text.contains("goera_submissions_received_total"));
        assert!(text.contains("goera_verdicts_total{status=\"Accepted\"}"));
    }
}
