// CLI commands for judging locally and driving a Goera dispatcher
use anyhow::{bail, Context, Result};
use goera_common::limits::Scalar;
use goera_common::types::{Submission, SubmitRequest, TestCase, WorkerRecord, WorkerStatus};
use goera_judge::{Judge, JudgeConfig};
use std::fs;
use std::path::Path;

/// Resource flags of `goera-cli judge`, parsed the same way as inbound JSON
pub struct LimitArgs {
    pub time_limit: String,
    pub memory_limit: String,
    pub cpus: String,
    pub image: String,
}

/// Test cases from a JSON array; an empty (or whitespace-only) file has none
pub fn parse_cases(content: &str) -> Result<Vec<TestCase>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(content).context("Test case file must be a JSON array of {input, expectedOutput}")
}

fn build_submission(source_code: String, cases: Vec<TestCase>, limits: LimitArgs) -> Result<Submission> {
    let request = SubmitRequest {
        submission_id: Scalar::Text("local".to_string()),
        source_code,
        test_cases: cases,
        time_limit: Some(Scalar::Text(limits.time_limit)),
        memory_limit: Some(Scalar::Text(limits.memory_limit)),
        cpu_count: Some(Scalar::Text(limits.cpus)),
        docker_image: Some(limits.image),
    };
    Ok(Submission::try_from(request)?)
}

fn load_judge(config_path: &Path) -> Result<Judge> {
    let config = JudgeConfig::load_or_default(config_path)?;
    Judge::with_docker(config).context("Failed to connect to Docker. Is it installed and running?")
}

/// Compile and judge a local source file
pub async fn judge_local(source: &Path, cases: &Path, limits: LimitArgs, config_path: &Path) -> Result<()> {
    let source_code = fs::read_to_string(source)
        .with_context(|| format!("Failed to read source file {}", source.display()))?;
    let cases_content = fs::read_to_string(cases)
        .with_context(|| format!("Failed to read test case file {}", cases.display()))?;

    let test_cases = parse_cases(&cases_content)?;
    let submission = build_submission(source_code, test_cases, limits)?;

    println!("⚖️  Judging {} against {} test case(s)", source.display(), submission.test_cases.len());
    println!("🐳 Image: {}", submission.sandbox_image);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    let judge = load_judge(config_path)?;
    let report = judge.judge(&submission).await?;

    print!("{}", report.log);
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if report.verdict.is_accepted() {
        println!("✅ {} ({} test case(s) run)", report.verdict, report.cases_run);
    } else {
        println!("❌ {} ({} test case(s) run)", report.verdict, report.cases_run);
    }

    Ok(())
}

/// Make sure the sandbox image exists locally
pub async fn build_image(image: &str, config_path: &Path) -> Result<()> {
    println!("🐳 Checking sandbox image: {}", image);

    let judge = load_judge(config_path)?;
    if judge.ensure_image(image).await? {
        println!("✅ Built image {}", image);
    } else {
        println!("✅ Image {} already present", image);
    }
    Ok(())
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<serde_json::Value>().await {
        Ok(body) => match body.get("error").and_then(|e| e.as_str()) {
            Some(message) => format!("{}: {}", status, message),
            None => format!("{}: {}", status, body),
        },
        Err(_) => status.to_string(),
    }
}

/// POST a submission file to the dispatcher
pub async fn submit(file: &Path, base_url: &str) -> Result<()> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let request: SubmitRequest = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse submission {}", file.display()))?;

    let response = reqwest::Client::new()
        .post(endpoint(base_url, "/submit"))
        .json(&request)
        .send()
        .await
        .with_context(|| format!("Failed to reach dispatcher at {}", base_url))?;

    if !response.status().is_success() {
        bail!("Submission rejected ({})", error_body(response).await);
    }

    let body: serde_json::Value = response.json().await?;
    println!(
        "📨 Submission {} queued",
        body["submissionId"].as_str().unwrap_or("?")
    );
    Ok(())
}

pub async fn list_workers(base_url: &str) -> Result<()> {
    let response = reqwest::get(endpoint(base_url, "/workers"))
        .await
        .with_context(|| format!("Failed to reach dispatcher at {}", base_url))?;
    if !response.status().is_success() {
        bail!("Failed to list workers ({})", error_body(response).await);
    }
    let workers: Vec<WorkerStatus> = response.json().await?;

    if workers.is_empty() {
        println!("No workers running.");
        println!("\n💡 Start one with: goera-cli workers spawn");
        return Ok(());
    }

    println!("📋 Workers:\n");
    println!("{:<8} {:<10} {:<10} {:<6} {:<25}", "PORT", "PID", "STATE", "BUSY", "STARTED");
    println!("{}", "─".repeat(62));
    for worker in &workers {
        let record = &worker.record;
        println!(
            "{:<8} {:<10} {:<10} {:<6} {:<25}",
            record.port,
            record.pid,
            format!("{:?}", record.state).to_lowercase(),
            if worker.busy { "yes" } else { "no" },
            record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    println!("\n✅ Total: {} worker(s)", workers.len());
    Ok(())
}

pub async fn spawn_worker(base_url: &str, port: Option<u16>) -> Result<()> {
    let body = match port {
        Some(port) => serde_json::json!({ "port": port }),
        None => serde_json::json!({}),
    };
    let response = reqwest::Client::new()
        .post(endpoint(base_url, "/workers"))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach dispatcher at {}", base_url))?;
    if !response.status().is_success() {
        bail!("Failed to spawn worker ({})", error_body(response).await);
    }

    let record: WorkerRecord = response.json().await?;
    println!("🚀 Worker starting on port {} (pid {})", record.port, record.pid);
    Ok(())
}

pub async fn kill_workers(base_url: &str, port: Option<u16>, all: bool) -> Result<()> {
    let client = reqwest::Client::new();

    let path = match (port, all) {
        (_, true) => "/workers".to_string(),
        (Some(port), false) => format!("/workers/{}", port),
        (None, false) => bail!("Pass --port or --all"),
    };

    let response = client
        .delete(endpoint(base_url, &path))
        .send()
        .await
        .with_context(|| format!("Failed to reach dispatcher at {}", base_url))?;
    if !response.status().is_success() {
        bail!("Failed to stop worker ({})", error_body(response).await);
    }

    if all {
        let body: serde_json::Value = response.json().await?;
        println!("🛑 Stopped {} worker(s)", body["stopped"]);
    } else if let Some(port) = port {
        println!("🛑 Worker on port {} stopped", port);
    }
    Ok(())
}
