//! Heuristic policies used by the agent loop
//!
//! Both are keyword matchers behind traits, so a structured signal can
//! replace them without touching the loop.

/// How a tool failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a backoff
    Transient,
    /// Retrying will not help
    Permanent,
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error_text: &str) -> ErrorClass;

    fn is_retryable(&self, error_text: &str) -> bool {
        self.classify(error_text) == ErrorClass::Transient
    }
}

/// Keyword-based classifier.
///
/// Permanent keywords (permission, auth, validation) win over transient ones;
/// anything unrecognized is permanent.
#[derive(Debug, Clone)]
pub struct KeywordErrorClassifier {
    transient: Vec<String>,
    permanent: Vec<String>,
}

impl Default for KeywordErrorClassifier {
    fn default() -> Self {
        let transient = [
            "timeout",
            "timed out",
            "rate limit",
            "too many requests",
            "429",
            "503",
            "502",
            "temporarily",
            "temporary",
            "unavailable",
            "connection reset",
            "connection refused",
            "connection closed",
            "network",
            "econnreset",
            "econnrefused",
            "etimedout",
            "try again",
        ];
        let permanent = [
            "permission denied",
            "forbidden",
            "unauthorized",
            "authentication",
            "invalid api key",
            "401",
            "403",
            "invalid param",
            "invalid argument",
            "validation",
            "not found",
            "unknown tool",
        ];
        Self {
            transient: transient.iter().map(|s| s.to_string()).collect(),
            permanent: permanent.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ErrorClassifier for KeywordErrorClassifier {
    fn classify(&self, error_text: &str) -> ErrorClass {
        let text = error_text.to_lowercase();
        if self.permanent.iter().any(|k| text.contains(k)) {
            return ErrorClass::Permanent;
        }
        if self.transient.iter().any(|k| text.contains(k)) {
            return ErrorClass::Transient;
        }
        ErrorClass::Permanent
    }
}

pub trait CompletionDetector: Send + Sync {
    /// Whether `text` reads like the agent declaring the task finished
    fn looks_complete(&self, text: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct HeuristicCompletionDetector {
    phrases: Vec<String>,
}

impl Default for HeuristicCompletionDetector {
    fn default() -> Self {
        let phrases = [
            "i have completed",
            "i've completed",
            "task is complete",
            "task has been completed",
            "successfully completed",
            "all done",
            "i have finished",
            "i've finished",
            "here is the summary",
            "here's a summary",
            "in summary",
        ];
        Self {
            phrases: phrases.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CompletionDetector for HeuristicCompletionDetector {
    fn looks_complete(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.phrases.iter().any(|p| text.contains(p))
    }
}
