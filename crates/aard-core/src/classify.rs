use aard_types::{ErrorCategory, ErrorKind, ErrorSeverity};

#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub pattern: Option<String>,
}

/// Fingerprint table mapping error text to (category, severity). First
/// match wins; anything unmatched lands in `unknown/medium`.
pub struct ClassificationTable {
    patterns: Vec<(&'static str, ErrorCategory, ErrorSeverity)>,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        Self {
            patterns: vec![
                ("sandbox", ErrorCategory::Logic, ErrorSeverity::Critical),
                ("timed out", ErrorCategory::Timeout, ErrorSeverity::High),
                ("timeout", ErrorCategory::Timeout, ErrorSeverity::High),
                (
                    "connection refused",
                    ErrorCategory::Environment,
                    ErrorSeverity::High,
                ),
                (
                    "unavailable",
                    ErrorCategory::Environment,
                    ErrorSeverity::High,
                ),
                (
                    "dns error",
                    ErrorCategory::Environment,
                    ErrorSeverity::High,
                ),
                ("quota", ErrorCategory::Resource, ErrorSeverity::High),
                (
                    "out of memory",
                    ErrorCategory::Resource,
                    ErrorSeverity::High,
                ),
                (
                    "not registered",
                    ErrorCategory::Dependency,
                    ErrorSeverity::Medium,
                ),
                (
                    "dependency",
                    ErrorCategory::Dependency,
                    ErrorSeverity::Medium,
                ),
                (
                    "schema",
                    ErrorCategory::Validation,
                    ErrorSeverity::Medium,
                ),
                (
                    "validation",
                    ErrorCategory::Validation,
                    ErrorSeverity::Medium,
                ),
                (
                    "invalid",
                    ErrorCategory::Validation,
                    ErrorSeverity::Medium,
                ),
                ("denied", ErrorCategory::Logic, ErrorSeverity::Medium),
                ("permission", ErrorCategory::Logic, ErrorSeverity::Medium),
            ],
        }
    }
}

impl ClassificationTable {
    pub fn classify(&self, error_text: &str) -> Classified {
        let haystack = error_text.to_lowercase();
        for (needle, category, severity) in &self.patterns {
            if haystack.contains(needle) {
                return Classified {
                    category: *category,
                    severity: *severity,
                    pattern: Some((*needle).to_string()),
                };
            }
        }
        Classified {
            category: ErrorCategory::Unknown,
            severity: ErrorSeverity::Medium,
            pattern: None,
        }
    }

    /// Typed errors carry their own mapping; the table only refines free
    /// text.
    pub fn classify_kind(&self, kind: &ErrorKind) -> Classified {
        Classified {
            category: kind.category(),
            severity: kind.severity(),
            pattern: None,
        }
    }
}

/// Parses the configured replan threshold; anything unrecognized falls
/// back to `high`.
pub fn severity_threshold(raw: &str) -> ErrorSeverity {
    match raw {
        "critical" => ErrorSeverity::Critical,
        "medium" => ErrorSeverity::Medium,
        _ => ErrorSeverity::High,
    }
}

pub fn should_replan(classified: &Classified, threshold: ErrorSeverity) -> bool {
    if classified.severity == ErrorSeverity::Critical {
        return true;
    }
    classified.severity >= threshold
}
