/// Verdict Classifier - Exit Status and Output Scoring
///
/// **Core Responsibility:**
/// Map the raw result of one sandboxed run to a Verdict.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about the compiler
/// - Pure function: (exit code, timeout flag, limits, outputs) → Verdict
///
/// **Classification Order:**
/// 1. Timed out → TimeLimit (partial output is kept but never compared)
/// 2. Exit 137 with a memory ceiling configured → MemoryLimit
/// 3. Exit 139 → RuntimeError (segmentation fault)
/// 4. Any other non-zero exit → RuntimeError
/// 5. Exit 0 → Accepted if normalized outputs match, else WrongAnswer
///
/// **Normalization Rules:**
/// - Trim leading and trailing whitespace: YES
/// - `\r\n` treated as `\n`: YES
/// - Case sensitivity: YES (exact match required)
/// - Floating-point tolerance: NO
use goera_common::types::{TestCase, Verdict};

/// SIGKILL; what the kernel OOM killer delivers
pub const EXIT_OOM_KILLED: i64 = 137;
/// SIGSEGV
pub const EXIT_SEGFAULT: i64 = 139;

/// Raw result of one test case, produced by `SandboxEngine`
#[derive(Debug, Clone, Default)]
pub struct SandboxRun {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the container never reported an exit status
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    /// Runtime failure (attach/start/wait) that prevented a clean run
    pub infra_error: Option<String>,
    /// Captured output hit the configured cap and was cut short
    pub truncated: bool,
    pub execution_time_ms: u64,
}

/// Per-test-case outcome consumed by the runner to decide whether to continue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub verdict: Verdict,
    pub actual_output: String,
    pub diagnostic: Option<String>,
}

/// Trim surrounding whitespace and fold Windows line endings
pub fn normalize_output(output: &str) -> String {
    output.trim().replace("\r\n", "\n")
}

pub fn classify(
    exit_code: Option<i64>,
    timed_out: bool,
    memory_limit_configured: bool,
    actual_output: &str,
    expected_output: &str,
) -> Verdict {
    if timed_out {
        return Verdict::TimeLimit;
    }
    match exit_code {
        Some(0) => {
            if normalize_output(actual_output) == normalize_output(expected_output) {
                Verdict::Accepted
            } else {
                Verdict::WrongAnswer
            }
        }
        Some(EXIT_OOM_KILLED) if memory_limit_configured => Verdict::MemoryLimit,
        _ => Verdict::RuntimeError,
    }
}

/// Classify a run and attach the diagnostic shown to the submitter
pub fn evaluate(run: &SandboxRun, test_case: &TestCase, memory_limit_configured: bool) -> ExecutionOutcome {
    if let Some(cause) = &run.infra_error {
        if !run.timed_out {
            return ExecutionOutcome {
                verdict: Verdict::RuntimeError,
                actual_output: run.stdout.clone(),
                diagnostic: Some(format!("sandbox failure: {}", cause)),
            };
        }
    }

    let verdict = classify(
        run.exit_code,
        run.timed_out,
        memory_limit_configured,
        &run.stdout,
        &test_case.expected_output,
    );

    let diagnostic = match verdict {
        Verdict::Accepted => None,
        Verdict::WrongAnswer => Some("output does not match".to_string()),
        Verdict::TimeLimit => Some(format!(
            "time limit exceeded after {}ms",
            run.execution_time_ms
        )),
        Verdict::MemoryLimit => Some("memory limit exceeded (killed with exit code 137)".to_string()),
        Verdict::RuntimeError => Some(runtime_error_diagnostic(run)),
        Verdict::CompileError => None,
    };

    ExecutionOutcome {
        verdict,
        actual_output: run.stdout.clone(),
        diagnostic,
    }
}

fn runtime_error_diagnostic(run: &SandboxRun) -> String {
    let mut message = match run.exit_code {
        Some(EXIT_SEGFAULT) => "segmentation fault (exit code 139)".to_string(),
        Some(code) => format!("exit code {}", code),
        None => "no exit status".to_string(),
    };
    let stderr = run.stderr.trim();
    if !stderr.is_empty() {
        message.push_str(": ");
        message.push_str(stderr);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(expected: &str) -> TestCase {
        TestCase {
            input: String::new(),
            expected_output: expected.to_string(),
        }
    }

    fn exited(code: i64, stdout: &str, stderr: &str) -> SandboxRun {
        SandboxRun {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(code),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("  hello  "), "hello");
        assert_eq!(normalize_output("\nhello\n"), "hello");
        assert_eq!(normalize_output("a\r\nb\r\n"), "a\nb");
        assert_eq!(normalize_output("  hello world  "), "hello world");
    }

    #[test]
    fn test_trailing_newline_variants_accepted() {
        for actual in ["3\n", "3", "3\r\n"] {
            assert_eq!(classify(Some(0), false, true, actual, "3"), Verdict::Accepted, "{:?}", actual);
        }
    }

    #[test]
    fn test_case_sensitive_comparison() {
        assert_eq!(classify(Some(0), false, true, "Hello", "hello"), Verdict::WrongAnswer);
    }

    #[test]
    fn test_timeout_wins_over_exit_code() {
        assert_eq!(classify(Some(0), true, true, "3", "3"), Verdict::TimeLimit);
        assert_eq!(classify(None, true, false, "", "3"), Verdict::TimeLimit);
    }

    #[test]
    fn test_oom_only_with_memory_limit() {
        assert_eq!(classify(Some(137), false, true, "", "3"), Verdict::MemoryLimit);
        assert_eq!(classify(Some(137), false, false, "", "3"), Verdict::RuntimeError);
    }

    #[test]
    fn test_nonzero_exit_is_runtime_error() {
        assert_eq!(classify(Some(1), false, true, "3", "3"), Verdict::RuntimeError);
        assert_eq!(classify(Some(139), false, true, "", "3"), Verdict::RuntimeError);
        assert_eq!(classify(None, false, true, "3", "3"), Verdict::RuntimeError);
    }

    #[test]
    fn test_evaluate_wrong_answer_keeps_actual() {
        let outcome = evaluate(&exited(0, "300\n", ""), &case("301"), true);
        assert_eq!(outcome.verdict, Verdict::WrongAnswer);
        assert_eq!(outcome.actual_output, "300\n");
        assert_eq!(outcome.diagnostic.as_deref(), Some("output does not match"));
    }

    #[test]
    fn test_evaluate_runtime_error_includes_stderr() {
        let outcome = evaluate(&exited(2, "", "panic: index out of range\n"), &case("3"), true);
        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert_eq!(
            outcome.diagnostic.as_deref(),
            Some("exit code 2: panic: index out of range")
        );
    }

    #[test]
    fn test_evaluate_segfault_diagnostic() {
        let outcome = evaluate(&exited(139, "", ""), &case("3"), true);
        assert!(outcome.diagnostic.unwrap().contains("segmentation fault"));
    }

    #[test]
    fn test_evaluate_infra_error() {
        let run = SandboxRun {
            infra_error: Some("attach failed".to_string()),
            ..Default::default()
        };
        let outcome = evaluate(&run, &case("3"), true);
        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert_eq!(outcome.diagnostic.as_deref(), Some("sandbox failure: attach failed"));
    }

    #[test]
    fn test_evaluate_accepted_has_no_diagnostic() {
        let outcome = evaluate(&exited(0, "3\n", ""), &case("3"), true);
        assert_eq!(outcome.verdict, Verdict::Accepted);
        assert!(outcome.diagnostic.is_none());
    }
}
