use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A single validation or parsing finding, tagged with the rule code that
/// produced it (e.g. `BAL_EQ`, `CUR_FMT`) so callers can match on stable
/// identifiers rather than message text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub code: &'static str,
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    pub fn new(code: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Issue {
            code,
            severity,
            message: message.into(),
        }
    }

    pub fn info(code: &'static str, message: impl Into<String>) -> Self {
        Issue::new(code, Severity::Info, message)
    }

    pub fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Issue::new(code, Severity::Warning, message)
    }

    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Issue::new(code, Severity::Error, message)
    }
}
