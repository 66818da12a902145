/// Resource envelope parsing.
///
/// The web backend sends limits loosely typed: `timeLimit` as a duration
/// string such as `"500ms"` or `"1.5s"`, `memoryLimit` and `cpuCount` as
/// either strings or JSON numbers. Everything is normalized here before a
/// `Submission` is built.
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LimitError {
    #[error("missing submissionId")]
    MissingSubmissionId,
    #[error("invalid timeLimit format: '{0}'")]
    InvalidTimeLimit(String),
    #[error("timeLimit exceeds maximum of {max_ms}ms")]
    TimeLimitTooLarge { max_ms: u128 },
    #[error("invalid memoryLimit format: '{0}'")]
    InvalidMemoryLimit(String),
    #[error("invalid cpuCount format: '{0}'")]
    InvalidCpuCount(String),
    #[error("source code exceeds maximum size of {max} bytes")]
    SourceTooLarge { max: usize },
    #[error("input of test case {index} exceeds maximum size of {max} bytes")]
    InputTooLarge { index: usize, max: usize },
}

/// A JSON scalar that may arrive either as a number or as a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Integer(u64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Integer(n) => write!(f, "{}", n),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// Parse a duration such as `"2s"`, `"500ms"`, `"1.5s"` or `"1m30s"`.
///
/// Supported units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. A bare number is
/// taken as milliseconds.
pub fn parse_duration(text: &str) -> Result<Duration, LimitError> {
    let invalid = || LimitError::InvalidTimeLimit(text.to_string());
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    if let Ok(ms) = trimmed.parse::<f64>() {
        if !ms.is_finite() || ms < 0.0 {
            return Err(invalid());
        }
        return Ok(nanos_to_duration(ms * 1e6));
    }

    // accumulate in nanoseconds so "1500ms" and "1.5s" land on the same value
    let mut total = 0f64;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += value * nanos_per_unit;
    }

    if !total.is_finite() || total > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(nanos_to_duration(total))
}

fn nanos_to_duration(nanos: f64) -> Duration {
    Duration::from_nanos(nanos.round() as u64)
}

/// Time limit from a string or a bare millisecond count
pub fn parse_time_limit(value: &Scalar) -> Result<Duration, LimitError> {
    match value {
        Scalar::Integer(ms) => Ok(Duration::from_millis(*ms)),
        Scalar::Float(ms) if ms.is_finite() && *ms >= 0.0 => Ok(nanos_to_duration(ms * 1e6)),
        Scalar::Float(_) => Err(LimitError::InvalidTimeLimit(value.to_string())),
        Scalar::Text(s) => parse_duration(s),
    }
}

/// Memory ceiling in whole MB; 0 means unlimited
pub fn parse_memory_limit(value: &Scalar) -> Result<u64, LimitError> {
    let invalid = || LimitError::InvalidMemoryLimit(value.to_string());
    match value {
        Scalar::Integer(mb) => Ok(*mb),
        Scalar::Float(mb) if mb.is_finite() && *mb >= 0.0 && mb.fract() == 0.0 => Ok(*mb as u64),
        Scalar::Float(_) => Err(invalid()),
        Scalar::Text(s) => s.trim().parse().map_err(|_| invalid()),
    }
}

/// CPU quota in fractional cores; 0 means unlimited
pub fn parse_cpu_count(value: &Scalar) -> Result<f64, LimitError> {
    let invalid = || LimitError::InvalidCpuCount(value.to_string());
    let cores = match value {
        Scalar::Integer(n) => *n as f64,
        Scalar::Float(x) => *x,
        Scalar::Text(s) => s.trim().parse().map_err(|_| invalid())?,
    };
    if !cores.is_finite() || cores < 0.0 {
        return Err(invalid());
    }
    Ok(cores)
}
