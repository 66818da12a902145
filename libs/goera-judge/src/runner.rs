/// Judge - compile once, run every test case, stop at the first failure
///
/// **Contract:**
/// `judge(submission) → (Verdict, log)`. Compile errors, crashes and
/// exceeded limits are verdicts. `Err` is reserved for infrastructure
/// failures (container runtime unreachable, temp files cannot be written,
/// compiler cannot be started).
///
/// **Artifacts:**
/// Source and executable live in a per-submission temp directory that is
/// removed when judging returns, on every path.
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use goera_common::types::{ResourceEnvelope, Submission, Verdict, VerdictReport};
use tracing::{debug, info, warn};

use crate::config::JudgeConfig;
use crate::docker::DockerRuntime;
use crate::engine::{CaseSpec, SandboxEngine};
use crate::evaluator;
use crate::runtime::SandboxRuntime;
use crate::toolchain::{CompileStatus, HostToolchain, Toolchain};

/// File name of the compiled program inside the workspace
const EXECUTABLE_NAME: &str = "program_to_run";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeReport {
    pub verdict: Verdict,
    pub log: String,
    /// Test cases actually executed (fail-fast stops early)
    pub cases_run: usize,
}

impl JudgeReport {
    pub fn into_report(self, submission_id: &str) -> VerdictReport {
        VerdictReport {
            submission_id: submission_id.to_string(),
            status: self.verdict,
            output: self.log,
        }
    }
}

/// Append-only per-submission log returned to the submitter
#[derive(Default)]
struct JudgeLog {
    text: String,
}

impl JudgeLog {
    fn line(&mut self, line: impl AsRef<str>) {
        let line = line.as_ref();
        debug!(target: "goera_judge::log", "{}", line);
        self.text.push_str(line);
        self.text.push('\n');
    }

    fn finish(mut self, verdict: Verdict, cases_run: usize) -> JudgeReport {
        self.line(format!("Overall Result: {}", verdict));
        JudgeReport {
            verdict,
            log: self.text,
            cases_run,
        }
    }
}

fn describe_limits(limits: &ResourceEnvelope) -> String {
    let memory = if limits.memory_limited() {
        format!("{} MB", limits.memory_limit_mb)
    } else {
        "unlimited".to_string()
    };
    let cpu = if limits.cpu_quota > 0.0 {
        format!("{} cores", limits.cpu_quota)
    } else {
        "unlimited".to_string()
    };
    format!(
        "Limits: time {}ms, memory {}, cpu {}",
        limits.time_limit.as_millis(),
        memory,
        cpu
    )
}

pub struct Judge {
    runtime: Arc<dyn SandboxRuntime>,
    toolchain: Arc<dyn Toolchain>,
    engine: SandboxEngine,
    dockerfile: String,
}

impl Judge {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        toolchain: Arc<dyn Toolchain>,
        config: JudgeConfig,
    ) -> Self {
        let dockerfile = config.sandbox.dockerfile.clone();
        let engine = SandboxEngine::new(runtime.clone(), config.sandbox);
        Self {
            runtime,
            toolchain,
            engine,
            dockerfile,
        }
    }

    /// Production wiring: Docker runtime plus the configured host compiler
    pub fn with_docker(config: JudgeConfig) -> Result<Self> {
        let runtime = Arc::new(DockerRuntime::connect()?);
        let toolchain = Arc::new(HostToolchain::new(config.toolchain.clone()));
        Ok(Self::new(runtime, toolchain, config))
    }

    /// Build the execution image from the embedded Dockerfile if it is missing.
    /// Returns true when a build was needed.
    pub async fn ensure_image(&self, image: &str) -> Result<bool> {
        if self.runtime.image_exists(image).await? {
            return Ok(false);
        }
        self.runtime.build_image(image, &self.dockerfile).await?;
        Ok(true)
    }

    #[tracing::instrument(skip(self, submission), fields(submission_id = %submission.id))]
    pub async fn judge(&self, submission: &Submission) -> Result<JudgeReport> {
        let mut log = JudgeLog::default();
        log.line(format!("Loaded {} test cases", submission.test_cases.len()));

        let image = &submission.sandbox_image;
        if self
            .runtime
            .image_exists(image)
            .await
            .context("Failed to check sandbox image")?
        {
            log.line(format!("Image {} ready", image));
        } else {
            if let Err(e) = self.runtime.build_image(image, &self.dockerfile).await {
                warn!(image = %image, error = %e, "Sandbox image build failed");
                log.line(format!("Failed to build image {}: {:#}", image, e));
                return Ok(log.finish(Verdict::CompileError, 0));
            }
            log.line(format!("Built image {}", image));
        }

        let workspace = tempfile::Builder::new()
            .prefix("goera-")
            .tempdir()
            .context("Failed to create submission workspace")?;
        let source = workspace.path().join(self.toolchain.source_file_name());
        let executable = workspace.path().join(EXECUTABLE_NAME);

        tokio::fs::write(&source, &submission.source_code)
            .await
            .with_context(|| format!("Failed to write source to {}", source.display()))?;

        if let Some(report) = self.compile(&source, &executable, &mut log).await? {
            return Ok(report);
        }

        log.line(describe_limits(&submission.limits));

        let case = CaseSpec {
            image: &submission.sandbox_image,
            executable: &executable,
            limits: &submission.limits,
        };
        let memory_limited = submission.limits.memory_limited();
        let max_output = self.engine.config().max_output_bytes;

        let mut verdict = Verdict::Accepted;
        let mut cases_run = 0;

        for (index, test_case) in submission.test_cases.iter().enumerate() {
            log.line(format!("Test case {}:", index + 1));
            log.line(format!("  Input: {}", test_case.input));

            let run = self.engine.run_case(&case, &test_case.input).await;
            let outcome = evaluator::evaluate(&run, test_case, memory_limited);
            cases_run += 1;

            log.line(format!("  Expected: {}", test_case.expected_output));
            log.line(format!("  Actual: {}", outcome.actual_output));
            if let Some(diagnostic) = &outcome.diagnostic {
                log.line(format!("  Error: {}", diagnostic));
            }
            if run.truncated {
                log.line(format!("  Note: output truncated at {} bytes", max_output));
            }
            log.line(format!("  Result: {}", outcome.verdict));

            if !outcome.verdict.is_accepted() {
                verdict = outcome.verdict;
                break;
            }
        }

        info!(
            verdict = %verdict,
            cases_run,
            total = submission.test_cases.len(),
            "Judging complete"
        );
        Ok(log.finish(verdict, cases_run))
    }

    /// `Some(report)` when compilation failed and judging must stop here
    async fn compile(
        &self,
        source: &Path,
        executable: &Path,
        log: &mut JudgeLog,
    ) -> Result<Option<JudgeReport>> {
        let output = self
            .toolchain
            .compile(source, executable)
            .await
            .context("Failed to run compiler")?;

        let failure = match &output.status {
            CompileStatus::Success if !executable.exists() => {
                Some("compiler exited successfully but produced no executable".to_string())
            }
            CompileStatus::Success => None,
            CompileStatus::Failed { code: Some(code) } => {
                Some(format!("compiler exited with code {}", code))
            }
            CompileStatus::Failed { code: None } => Some("compiler was terminated".to_string()),
            CompileStatus::TimedOut => Some("compilation timed out".to_string()),
        };

        match failure {
            None => {
                log.line("Compilation succeeded");
                if !output.log.trim().is_empty() {
                    log.line(output.log.trim_end());
                }
                Ok(None)
            }
            Some(reason) => {
                info!(reason = %reason, "Compilation failed");
                log.line(format!("Compilation failed: {}", reason));
                if !output.log.trim().is_empty() {
                    log.line(output.log.trim_end());
                }
                let log = std::mem::take(log);
                Ok(Some(log.finish(Verdict::CompileError, 0)))
            }
        }
    }
}
