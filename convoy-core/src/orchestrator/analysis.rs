//! Failure analysis for agent runs
//!
//! Classifies the combined output and error text of a failed run, in
//! priority order: configured critical patterns (environmental, counted by
//! the circuit breaker), test-only signals, rate limits, then a best-effort
//! extraction of the last error-looking line.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::CriticalPattern;
use crate::features::FailureKind;

const REASON_MAX_CHARS: usize = 200;

/// Classification of a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzedKind {
    Environment,
    TestOnly,
    RateLimit,
    Implementation,
    Unknown,
}

/// Result of analyzing a failed run
#[derive(Debug, Clone)]
pub struct FailureAnalysis {
    pub reason: String,
    pub kind: AnalyzedKind,
    pub is_critical: bool,
    /// Label of the critical pattern that matched
    pub label: Option<String>,
}

impl FailureAnalysis {
    /// The kind written to the feature store
    ///
    /// Rate limits are transient and never persisted: the feature stays
    /// open and is rescheduled.
    pub fn persisted_kind(&self) -> FailureKind {
        match self.kind {
            AnalyzedKind::Environment => FailureKind::Environment,
            AnalyzedKind::TestOnly => FailureKind::TestOnly,
            AnalyzedKind::Implementation => FailureKind::Implementation,
            AnalyzedKind::RateLimit | AnalyzedKind::Unknown => FailureKind::Unknown,
        }
    }
}

/// Classify the combined output and error text of a failed run
pub fn analyze_failure(text: &str, critical_patterns: &[CriticalPattern]) -> FailureAnalysis {
    for cp in critical_patterns {
        match Regex::new(&cp.pattern) {
            Ok(re) => {
                if re.is_match(text) {
                    return FailureAnalysis {
                        reason: cp.label.clone(),
                        kind: AnalyzedKind::Environment,
                        is_critical: true,
                        label: Some(cp.label.clone()),
                    };
                }
            }
            Err(e) => {
                tracing::warn!(pattern = %cp.pattern, "skipping invalid critical pattern: {}", e);
            }
        }
    }

    if test_only_re().is_match(text) {
        return FailureAnalysis {
            reason: "tests or verification failed".to_string(),
            kind: AnalyzedKind::TestOnly,
            is_critical: false,
            label: None,
        };
    }

    if rate_limit_re().is_match(text) {
        return FailureAnalysis {
            reason: "agent was rate-limited".to_string(),
            kind: AnalyzedKind::RateLimit,
            is_critical: false,
            label: None,
        };
    }

    if let Some(line) = last_error_line(text) {
        return FailureAnalysis {
            reason: truncate(&line, REASON_MAX_CHARS),
            kind: AnalyzedKind::Implementation,
            is_critical: false,
            label: None,
        };
    }

    FailureAnalysis {
        reason: "agent failed without a recognizable error".to_string(),
        kind: AnalyzedKind::Unknown,
        is_critical: false,
        label: None,
    }
}

fn test_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(\btests? failed\b|assertion (failed|error)|expected\s+.{0,120}\s+to\s+(equal|be|contain|match|deep)|verification could ?n[o']t complete)",
        )
        .expect("test-only regex")
    })
}

fn rate_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(rate.?limit|too many requests|\b429\b|\bquota\b|usage limit|usage exceeded|resource.?exhausted|overloaded)",
        )
        .expect("rate-limit regex")
    })
}

fn error_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(error|fail|fatal|exception|cannot|unable)").expect("error-line regex")
    })
}

/// Last line containing an error-like token
fn last_error_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && error_line_re().is_match(line))
        .map(str::to_string)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn econnrefused_pattern() -> Vec<CriticalPattern> {
        vec![CriticalPattern {
            pattern: "ECONNREFUSED".to_string(),
            label: "database unreachable".to_string(),
        }]
    }

    #[test]
    fn test_critical_pattern_is_environment() {
        let analysis = analyze_failure(
            "connect ECONNREFUSED 127.0.0.1:5432",
            &econnrefused_pattern(),
        );
        assert_eq!(analysis.kind, AnalyzedKind::Environment);
        assert!(analysis.is_critical);
        assert_eq!(analysis.reason, "database unreachable");
        assert_eq!(analysis.persisted_kind(), FailureKind::Environment);
    }

    #[test]
    fn test_assertion_is_test_only() {
        let analysis = analyze_failure("AssertionError: expected 1 to equal 2", &[]);
        assert_eq!(analysis.kind, AnalyzedKind::TestOnly);
        assert!(!analysis.is_critical);
        assert_eq!(analysis.persisted_kind(), FailureKind::TestOnly);
    }

    #[test]
    fn test_429_is_rate_limit() {
        let analysis = analyze_failure("HTTP 429 Too Many Requests", &[]);
        assert_eq!(analysis.kind, AnalyzedKind::RateLimit);
        // Never written to the feature file as a failure kind
        assert_eq!(analysis.persisted_kind(), FailureKind::Unknown);
    }

    #[test]
    fn test_type_error_is_implementation() {
        let analysis = analyze_failure(
            "building...\nTypeError: undefined is not a function\n",
            &[],
        );
        assert_eq!(analysis.kind, AnalyzedKind::Implementation);
        assert!(!analysis.is_critical);
        assert_eq!(analysis.reason, "TypeError: undefined is not a function");
    }

    #[test]
    fn test_critical_beats_test_only() {
        let analysis = analyze_failure(
            "tests failed after ECONNREFUSED from postgres",
            &econnrefused_pattern(),
        );
        assert_eq!(analysis.kind, AnalyzedKind::Environment);
    }

    #[test]
    fn test_last_error_line_wins() {
        let text = "Error: first problem\nall good here\nfatal: second problem\ntrailing info";
        let analysis = analyze_failure(text, &[]);
        assert_eq!(analysis.reason, "fatal: second problem");
    }

    #[test]
    fn test_reason_truncated_to_200() {
        let text = format!("Error: {}", "x".repeat(500));
        let analysis = analyze_failure(&text, &[]);
        assert_eq!(analysis.reason.chars().count(), 200);
    }

    #[test]
    fn test_no_signal_is_unknown() {
        let analysis = analyze_failure("the process simply ended", &[]);
        assert_eq!(analysis.kind, AnalyzedKind::Unknown);
        assert_eq!(analysis.persisted_kind(), FailureKind::Unknown);
    }

    #[test]
    fn test_invalid_critical_pattern_skipped() {
        let patterns = vec![CriticalPattern {
            pattern: "(unclosed".to_string(),
            label: "broken".to_string(),
        }];
        let analysis = analyze_failure("Error: something", &patterns);
        assert_eq!(analysis.kind, AnalyzedKind::Implementation);
    }
}
