use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{
    DEFAULT_CPU_COUNT, DEFAULT_MEMORY_LIMIT_MB, DEFAULT_SANDBOX_IMAGE, DEFAULT_TIME_LIMIT,
    MAX_SOURCE_CODE_BYTES, MAX_TEST_INPUT_BYTES, MAX_TIME_LIMIT,
};
use crate::limits::{self, LimitError, Scalar};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    #[serde(rename = "expectedOutput")]
    pub expected_output: String,
}

/// Final classification of a test case or of a whole submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    CompileError,
    WrongAnswer,
    TimeLimit,
    MemoryLimit,
    RuntimeError,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "Accepted",
            Verdict::CompileError => "CompileError",
            Verdict::WrongAnswer => "WrongAnswer",
            Verdict::TimeLimit => "TimeLimit",
            Verdict::MemoryLimit => "MemoryLimit",
            Verdict::RuntimeError => "RuntimeError",
        }
    }

    pub fn is_accepted(&self) -> bool {
        *self == Verdict::Accepted
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submit payload as posted by the web backend (and forwarded to workers on `/run`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub submission_id: Scalar,
    pub source_code: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
}

/// The `{timeLimit, memoryLimitMB, cpuQuota}` triple bounding one submission
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceEnvelope {
    pub time_limit: Duration,
    /// 0 = unlimited
    pub memory_limit_mb: u64,
    /// Fractional cores, 0 = unlimited
    pub cpu_quota: f64,
}

impl ResourceEnvelope {
    pub fn memory_limited(&self) -> bool {
        self.memory_limit_mb > 0
    }

    pub fn memory_limit_bytes(&self) -> Option<i64> {
        self.memory_limited()
            .then(|| (self.memory_limit_mb as i64).saturating_mul(1024 * 1024))
    }

    pub fn nano_cpus(&self) -> Option<i64> {
        (self.cpu_quota > 0.0).then(|| (self.cpu_quota * 1_000_000_000.0) as i64)
    }
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self {
            time_limit: DEFAULT_TIME_LIMIT,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            cpu_quota: DEFAULT_CPU_COUNT,
        }
    }
}

/// Immutable input to judging. Built once on intake and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub id: String,
    pub source_code: String,
    pub test_cases: Vec<TestCase>,
    pub limits: ResourceEnvelope,
    pub sandbox_image: String,
}

impl Submission {
    /// Wire form used when handing the submission to a worker
    pub fn to_request(&self) -> SubmitRequest {
        SubmitRequest {
            submission_id: Scalar::Text(self.id.clone()),
            source_code: self.source_code.clone(),
            test_cases: self.test_cases.clone(),
            time_limit: Some(Scalar::Text(format!(
                "{}ns",
                self.limits.time_limit.as_nanos()
            ))),
            memory_limit: Some(Scalar::Integer(self.limits.memory_limit_mb)),
            cpu_count: Some(Scalar::Float(self.limits.cpu_quota)),
            docker_image: Some(self.sandbox_image.clone()),
        }
    }
}

impl TryFrom<SubmitRequest> for Submission {
    type Error = LimitError;

    fn try_from(request: SubmitRequest) -> Result<Self, Self::Error> {
        let id = request.submission_id.to_string();
        if id.trim().is_empty() {
            return Err(LimitError::MissingSubmissionId);
        }
        if request.source_code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(LimitError::SourceTooLarge {
                max: MAX_SOURCE_CODE_BYTES,
            });
        }
        if let Some(index) = request
            .test_cases
            .iter()
            .position(|tc| tc.input.len() > MAX_TEST_INPUT_BYTES)
        {
            return Err(LimitError::InputTooLarge {
                index: index + 1,
                max: MAX_TEST_INPUT_BYTES,
            });
        }

        let defaults = ResourceEnvelope::default();
        let limits = ResourceEnvelope {
            time_limit: match &request.time_limit {
                Some(value) => limits::parse_time_limit(value)?,
                None => defaults.time_limit,
            },
            memory_limit_mb: match &request.memory_limit {
                Some(value) => limits::parse_memory_limit(value)?,
                None => defaults.memory_limit_mb,
            },
            cpu_quota: match &request.cpu_count {
                Some(value) => limits::parse_cpu_count(value)?,
                None => defaults.cpu_quota,
            },
        };

        if limits.time_limit > MAX_TIME_LIMIT {
            return Err(LimitError::TimeLimitTooLarge {
                max_ms: MAX_TIME_LIMIT.as_millis(),
            });
        }

        let sandbox_image = request
            .docker_image
            .filter(|image| !image.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SANDBOX_IMAGE.to_string());

        Ok(Submission {
            id,
            source_code: request.source_code,
            test_cases: request.test_cases,
            limits,
            sandbox_image,
        })
    }
}

/// `{submissionId, status, output}`: the worker's `/run` reply and the
/// payload reported to the result sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictReport {
    pub submission_id: String,
    pub status: Verdict,
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
    Stopped,
}

/// One supervised worker process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub port: u16,
    pub pid: u32,
    pub state: WorkerState,
    #[serde(rename = "startTime")]
    pub started_at: DateTime<Utc>,
}

/// A worker record together with the dispatcher's busy flag for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub record: WorkerRecord,
    pub busy: bool,
}
