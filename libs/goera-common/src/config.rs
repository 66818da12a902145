// Shared defaults and environment helpers used by every Goera binary
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Time limit per test case when the submission does not carry one
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(2);

/// Memory ceiling per test case in MB (0 means unlimited)
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 64;

/// Fractional cores per test case
pub const DEFAULT_CPU_COUNT: f64 = 1.0;

/// Sandbox image used (and built on demand) when the submission names none
pub const DEFAULT_SANDBOX_IMAGE: &str = "go-judge-runner:latest";

/// Safety limits to keep pathological payloads away from the compiler and Docker
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB
pub const MAX_TIME_LIMIT: Duration = Duration::from_secs(5 * 60);

/// Header carrying the shared secret on calls into the web backend
pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: String, value: String },
}

/// Read an environment variable, falling back to `default` when unset
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an environment variable.
///
/// Unset or empty variables yield `default`; a value that does not parse is
/// an error rather than a silent fallback.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            value.trim().parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            })
        }
        _ => Ok(default),
    }
}
