// Host-side compilation of submitted source
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ToolchainConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileStatus {
    Success,
    Failed { code: Option<i32> },
    TimedOut,
}

/// Result of one compiler invocation; `log` holds stdout followed by stderr
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub status: CompileStatus,
    pub log: String,
}

#[async_trait]
pub trait Toolchain: Send + Sync {
    /// File name the source must be written under before compiling
    fn source_file_name(&self) -> &str;

    /// Compile `source` into `output`.
    ///
    /// A compiler that runs and rejects the program is `Ok` with a
    /// non-success status; `Err` means the compiler could not be run at all.
    async fn compile(&self, source: &Path, output: &Path) -> Result<CompileOutput>;
}

/// Runs the configured compiler as a child process on the worker host
pub struct HostToolchain {
    config: ToolchainConfig,
}

impl HostToolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    fn render_args(&self, source: &Path, output: &Path) -> Vec<String> {
        let source = source.to_string_lossy();
        let output = output.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{source}", &source).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl Toolchain for HostToolchain {
    fn source_file_name(&self) -> &str {
        &self.config.source_file
    }

    async fn compile(&self, source: &Path, output: &Path) -> Result<CompileOutput> {
        let args = self.render_args(source, output);
        debug!(command = %self.config.command, ?args, "Invoking compiler");

        let mut command = Command::new(&self.config.command);
        command
            .args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = source.parent() {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .with_context(|| format!("Failed to run compiler '{}'", self.config.command))?;

        let timeout = self.config.compile_timeout();
        let result = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to collect compiler output")?,
            Err(_) => {
                // dropping the future kills the child
                warn!(timeout_ms = timeout.as_millis() as u64, "Compilation timed out");
                return Ok(CompileOutput {
                    status: CompileStatus::TimedOut,
                    log: format!("compilation timed out after {}ms", timeout.as_millis()),
                });
            }
        };

        let mut log = String::from_utf8_lossy(&result.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&result.stderr));

        let status = if result.status.success() {
            CompileStatus::Success
        } else {
            CompileStatus::Failed {
                code: result.status.code(),
            }
        };

        Ok(CompileOutput { status, log })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn shell_toolchain(script: &str, timeout_ms: u64) -> HostToolchain {
        HostToolchain::new(ToolchainConfig {
            name: "sh".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            source_file: "main.go".to_string(),
            env: HashMap::from([("GREETING".to_string(), "hi".to_string())]),
            compile_timeout_ms: timeout_ms,
        })
    }

    #[test]
    fn test_placeholders_substituted() {
        let toolchain = HostToolchain::new(ToolchainConfig::default());
        let args = toolchain.render_args(Path::new("/tmp/x/main.go"), Path::new("/tmp/x/exe"));
        assert_eq!(args, vec!["build", "-o", "/tmp/x/exe", "/tmp/x/main.go"]);
    }

    #[tokio::test]
    async fn test_compile_success_collects_log() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = shell_toolchain("echo $GREETING; echo warn >&2", 5_000);
        let out = toolchain
            .compile(&dir.path().join("main.go"), &dir.path().join("exe"))
            .await
            .unwrap();

        assert_eq!(out.status, CompileStatus::Success);
        assert_eq!(out.log, "hi\nwarn\n");
    }

    #[tokio::test]
    async fn test_compile_failure_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = shell_toolchain("echo 'undefined: x' >&2; exit 2", 5_000);
        let out = toolchain
            .compile(&dir.path().join("main.go"), &dir.path().join("exe"))
            .await
            .unwrap();

        assert_eq!(out.status, CompileStatus::Failed { code: Some(2) });
        assert!(out.log.contains("undefined: x"));
    }

    #[tokio::test]
    async fn test_compile_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = shell_toolchain("sleep 5", 100);
        let out = toolchain
            .compile(&dir.path().join("main.go"), &dir.path().join("exe"))
            .await
            .unwrap();

        assert_eq!(out.status, CompileStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_missing_compiler_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = HostToolchain::new(ToolchainConfig {
            command: "definitely-not-a-compiler-goera".to_string(),
            ..ToolchainConfig::default()
        });
        assert!(toolchain
            .compile(&dir.path().join("main.go"), &dir.path().join("exe"))
            .await
            .is_err());
    }
}
