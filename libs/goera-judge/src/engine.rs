/// Sandbox Engine - One Container per Test Case
///
/// **Core Responsibility:**
/// Run a compiled executable against one test input inside a fresh,
/// resource-limited container and capture its raw result.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (create, attach, start, feed, wait, tear down)
/// - Engine does NOT decide verdicts; `evaluator` does
/// - Engine never returns an error: runtime failures are reported in
///   `SandboxRun::infra_error` so the caller can still produce a verdict
///
/// **Lifecycle:**
/// `Created → Attached → Started → {Exited | TimedOut | StartFailed}`.
/// Every terminal state runs teardown (stop with grace, then forced remove)
/// under its own cleanup timeout. A drop guard force-removes the container
/// if the future is cancelled before teardown finishes.
///
/// **Concurrency inside a test case:**
/// stdin writer task, output reader task and the exit wait run together.
/// Output is finalized only after the reader has finished or hit the drain
/// timeout and the writer has finished or hit the stdin-close timeout.
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::StreamExt;
use goera_common::types::ResourceEnvelope;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::evaluator::SandboxRun;
use crate::runtime::{BindMount, OutputChunk, SandboxIo, SandboxRuntime, SandboxSpec};

/// What to run for one test case
#[derive(Debug, Clone, Copy)]
pub struct CaseSpec<'a> {
    pub image: &'a str,
    /// Host path of the compiled executable
    pub executable: &'a Path,
    pub limits: &'a ResourceEnvelope,
}

/// Force-removes the container on drop unless teardown already completed
struct TeardownGuard {
    runtime: Arc<dyn SandboxRuntime>,
    container_id: String,
    armed: bool,
}

impl TeardownGuard {
    fn new(runtime: Arc<dyn SandboxRuntime>, container_id: String) -> Self {
        Self {
            runtime,
            container_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Drop cannot await; hand the removal to the runtime
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.container_id, "No runtime available to remove container");
            return;
        };
        let runtime = self.runtime.clone();
        let container_id = self.container_id.clone();
        handle.spawn(async move {
            if let Err(e) = runtime.remove(&container_id).await {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

/// stdout/stderr buffers shared with the reader task
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Captured {
    fn new(limit: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: OutputChunk) {
        let (buf, data) = match chunk {
            OutputChunk::Stdout(data) => (&mut self.stdout, data),
            OutputChunk::Stderr(data) => (&mut self.stderr, data),
        };
        let room = self.limit.saturating_sub(buf.len());
        if data.len() > room {
            buf.extend_from_slice(&data[..room]);
            self.truncated = true;
        } else {
            buf.extend_from_slice(&data);
        }
    }
}

/// Program input as written to stdin: always newline-terminated
fn stdin_payload(input: &str) -> Vec<u8> {
    let mut payload = input.as_bytes().to_vec();
    if !input.ends_with('\n') {
        payload.push(b'\n');
    }
    payload
}

fn infra_failure(err: anyhow::Error) -> SandboxRun {
    SandboxRun {
        infra_error: Some(format!("{:#}", err)),
        ..Default::default()
    }
}

pub struct SandboxEngine {
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
}

impl SandboxEngine {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SandboxConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Container definition for one test case (the sandbox contract)
    pub fn sandbox_spec(&self, case: &CaseSpec<'_>) -> SandboxSpec {
        SandboxSpec {
            name: format!("goera-{}", uuid::Uuid::new_v4()),
            image: case.image.to_string(),
            command: vec![self.config.executable_path.clone()],
            user: self.config.user.clone(),
            working_dir: self.config.working_dir.clone(),
            mounts: vec![BindMount {
                source: case.executable.to_path_buf(),
                target: self.config.executable_path.clone(),
                read_only: true,
            }],
            network_disabled: true,
            security_opts: vec!["no-new-privileges".to_string()],
            memory_bytes: case.limits.memory_limit_bytes(),
            nano_cpus: case.limits.nano_cpus(),
        }
    }

    /// Execute one test case and tear its container down
    #[tracing::instrument(skip(self, case, input), fields(image = %case.image))]
    pub async fn run_case(&self, case: &CaseSpec<'_>, input: &str) -> SandboxRun {
        let spec = self.sandbox_spec(case);

        let container_id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Sandbox creation failed");
                return infra_failure(e);
            }
        };
        debug!(container_id = %container_id, name = %spec.name, "Sandbox created");

        let mut guard = TeardownGuard::new(self.runtime.clone(), container_id.clone());

        let run = self.drive(&container_id, input, case.limits.time_limit).await;

        if self.teardown(&container_id).await {
            guard.disarm();
        }

        info!(
            container_id = %container_id,
            exit_code = ?run.exit_code,
            timed_out = run.timed_out,
            execution_time_ms = run.execution_time_ms,
            "Test case finished"
        );
        run
    }

    async fn drive(&self, container_id: &str, input: &str, time_limit: Duration) -> SandboxRun {
        let SandboxIo {
            input: mut stdin,
            output,
        } = match self.runtime.attach(container_id).await {
            Ok(io) => io,
            Err(e) => {
                warn!(container_id, error = %e, "Sandbox attach failed");
                return infra_failure(e);
            }
        };

        if let Err(e) = self.runtime.start(container_id).await {
            warn!(container_id, error = %e, "Sandbox start failed");
            return infra_failure(e);
        }
        let started = Instant::now();

        let payload = stdin_payload(input);
        let mut writer = tokio::spawn(async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        });

        let captured = Arc::new(Mutex::new(Captured::new(self.config.max_output_bytes)));
        let sink = captured.clone();
        let mut reader = tokio::spawn(async move {
            let mut output = output;
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(chunk) => sink.lock().push(chunk),
                    Err(e) => {
                        warn!(error = %e, "Output stream failed");
                        break;
                    }
                }
            }
        });

        let mut run = SandboxRun::default();
        let bound = time_limit + self.config.start_grace();
        match tokio::time::timeout(bound, self.runtime.wait(container_id)).await {
            Ok(Ok(code)) => run.exit_code = Some(code),
            Ok(Err(e)) => {
                warn!(container_id, error = %e, "Waiting for sandbox failed");
                run.infra_error = Some(format!("{:#}", e));
            }
            Err(_) => {
                run.timed_out = true;
                let grace = Duration::from_secs(self.config.timeout_stop_grace_secs.max(0) as u64);
                let stop = self.runtime.stop(container_id, grace);
                match tokio::time::timeout(self.config.cleanup_timeout(), stop).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(container_id, error = %e, "Failed to stop timed out sandbox"),
                    Err(_) => warn!(container_id, "Stopping timed out sandbox did not finish in time"),
                }
            }
        }
        run.execution_time_ms = started.elapsed().as_millis() as u64;

        // exit does not guarantee the output stream has been drained yet
        if tokio::time::timeout(self.config.output_drain(), &mut reader)
            .await
            .is_err()
        {
            warn!(container_id, "Output did not drain in time");
            reader.abort();
        }

        match tokio::time::timeout(self.config.stdin_close(), &mut writer).await {
            Ok(Ok(Ok(()))) => {}
            // the program may exit without reading all of its input
            Ok(Ok(Err(e))) => debug!(container_id, error = %e, "stdin closed early"),
            Ok(Err(e)) => warn!(container_id, error = %e, "stdin writer task failed"),
            Err(_) => {
                warn!(container_id, "stdin writer did not finish in time");
                writer.abort();
            }
        }

        let captured = captured.lock();
        run.stdout = String::from_utf8_lossy(&captured.stdout).into_owned();
        run.stderr = String::from_utf8_lossy(&captured.stderr).into_owned();
        run.truncated = captured.truncated;
        run
    }

    /// Stop then force-remove; true when the container is confirmed gone
    async fn teardown(&self, container_id: &str) -> bool {
        let grace = Duration::from_secs(self.config.stop_grace_secs.max(0) as u64);
        let runtime = &self.runtime;

        let cleanup = async {
            if let Err(e) = runtime.stop(container_id, grace).await {
                warn!(container_id, error = %e, "Failed to stop sandbox");
            }
            runtime.remove(container_id).await
        };

        match tokio::time::timeout(self.config.cleanup_timeout(), cleanup).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(container_id, error = %e, "Failed to remove sandbox");
                false
            }
            Err(_) => {
                warn!(container_id, "Sandbox cleanup timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdin_payload_newline() {
        assert_eq!(stdin_payload("1 2"), b"1 2\n");
        assert_eq!(stdin_payload("1 2\n"), b"1 2\n");
        assert_eq!(stdin_payload(""), b"\n");
    }

    #[test]
    fn test_captured_caps_each_stream() {
        let mut captured = Captured::new(4);
        captured.push(OutputChunk::Stdout(b"abc".to_vec()));
        captured.push(OutputChunk::Stdout(b"def".to_vec()));
        captured.push(OutputChunk::Stderr(b"xy".to_vec()));

        assert_eq!(captured.stdout, b"abcd");
        assert_eq!(captured.stderr, b"xy");
        assert!(captured.truncated);
    }
}
