// Runner configuration for Goera workers
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default location of the runner configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/judge.json";

/// Minimal execution image: non-root account, no extra tooling
pub const DEFAULT_DOCKERFILE: &str = "\
FROM alpine:3.20
RUN addgroup -S appgroup && adduser -S appuser -G appgroup
RUN mkdir /app && chown appuser:appgroup /app
WORKDIR /app
USER appuser
";

/// Host compiler invocation.
///
/// `args` may contain the `{source}` and `{output}` placeholders, replaced
/// with the temporary source file and the executable to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub source_file: String,
    pub env: HashMap<String, String>,
    pub compile_timeout_ms: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            name: "go".to_string(),
            command: "go".to_string(),
            args: vec![
                "build".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
                "{source}".to_string(),
            ],
            source_file: "main.go".to_string(),
            // static binary, the sandbox image carries no libc to link against
            env: HashMap::from([("CGO_ENABLED".to_string(), "0".to_string())]),
            compile_timeout_ms: 30_000,
        }
    }
}

impl ToolchainConfig {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }
}

/// Sandbox contract and the secondary timeouts around one test case
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub executable_path: String,
    pub user: String,
    pub working_dir: String,
    /// Extra allowance on top of the time limit for container start overhead
    pub start_grace_ms: u64,
    pub output_drain_ms: u64,
    pub stdin_close_ms: u64,
    pub stop_grace_secs: i64,
    pub timeout_stop_grace_secs: i64,
    pub cleanup_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub dockerfile: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            executable_path: "/app/program_to_run".to_string(),
            user: "appuser".to_string(),
            working_dir: "/app".to_string(),
            start_grace_ms: 1_000,
            output_drain_ms: 2_000,
            stdin_close_ms: 2_000,
            stop_grace_secs: 5,
            timeout_stop_grace_secs: 1,
            cleanup_timeout_ms: 10_000,
            max_output_bytes: 16 * 1024 * 1024,
            dockerfile: DEFAULT_DOCKERFILE.to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }

    pub fn stdin_close(&self) -> Duration {
        Duration::from_millis(self.stdin_close_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub toolchain: ToolchainConfig,
    pub sandbox: SandboxConfig,
}

impl JudgeConfig {
    /// Load runner configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Judge config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: JudgeConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        if config.toolchain.command.trim().is_empty() {
            bail!("toolchain.command must not be empty");
        }
        if !config.sandbox.executable_path.starts_with('/') {
            bail!(
                "sandbox.executable_path must be absolute, got '{}'",
                config.sandbox.executable_path
            );
        }

        Ok(config)
    }

    /// Load from `path` when it exists, otherwise fall back to built-in defaults.
    ///
    /// A file that exists but does not parse is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(path = %path.display(), "Judge config not found, using defaults");
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_describe_go_toolchain() {
        let config = JudgeConfig::default();
        assert_eq!(config.toolchain.command, "go");
        assert_eq!(config.toolchain.compile_timeout(), Duration::from_secs(30));
        assert_eq!(config.toolchain.env.get("CGO_ENABLED").map(String::as_str), Some("0"));
        assert_eq!(config.sandbox.executable_path, "/app/program_to_run");
        assert!(config.sandbox.dockerfile.contains("USER appuser"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sandbox": {{"start_grace_ms": 250}}}}"#).unwrap();

        let config = JudgeConfig::load(file.path()).unwrap();
        assert_eq!(config.sandbox.start_grace(), Duration::from_millis(250));
        assert_eq!(config.sandbox.user, "appuser");
        assert_eq!(config.toolchain.source_file, "main.go");
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = JudgeConfig::load_or_default(Path::new("/nonexistent/judge.json")).unwrap();
        assert_eq!(config.sandbox.cleanup_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/judge.json");
        let config = JudgeConfig::load(&path).unwrap();
        assert_eq!(config.toolchain.args, JudgeConfig::default().toolchain.args);
        assert_eq!(config.sandbox.max_output_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_relative_executable_path_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sandbox": {{"executable_path": "program"}}}}"#).unwrap();
        assert!(JudgeConfig::load(file.path()).is_err());
    }
}
