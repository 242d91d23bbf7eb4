use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Environment,
    Dependency,
    Validation,
    Logic,
    Timeout,
    Resource,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

/// Operational error taxonomy. Every kind maps to a (category, severity)
/// pair and a stable reason code recorded on events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("no active prompt for {0}")]
    PromptNotFound(String),
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("model call timed out")]
    ModelTimeout,
    #[error("tool `{tool}` denied for agent `{agent}`")]
    ToolDenied { agent: String, tool: String },
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("dependency not ready: {0}")]
    DependencyNotReady(String),
    #[error("quota exceeded for {resource}")]
    QuotaExceeded { resource: String },
    #[error("approval rejected")]
    ApprovalRejected,
    #[error("approval timed out")]
    ApprovalTimeout,
    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),
    #[error("cancelled")]
    Cancelled,
    #[error("plan is not ready for execution: {0}")]
    PlanNotReady(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::InvalidRequest(_)
            | ErrorKind::ValidationFailed(_)
            | ErrorKind::InvalidTransition { .. }
            | ErrorKind::PlanNotReady(_) => ErrorCategory::Validation,
            ErrorKind::PromptNotFound(_) | ErrorKind::DependencyNotReady(_) => {
                ErrorCategory::Dependency
            }
            ErrorKind::ModelUnavailable(_) => ErrorCategory::Environment,
            ErrorKind::ModelTimeout | ErrorKind::ApprovalTimeout => ErrorCategory::Timeout,
            ErrorKind::ToolDenied { .. } | ErrorKind::SandboxViolation(_) => ErrorCategory::Logic,
            ErrorKind::QuotaExceeded { .. } => ErrorCategory::Resource,
            ErrorKind::ApprovalRejected | ErrorKind::Cancelled => ErrorCategory::Logic,
            ErrorKind::CheckpointCorrupt(_) | ErrorKind::Internal(_) => ErrorCategory::Unknown,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ErrorKind::InvalidRequest(_) | ErrorKind::ValidationFailed(_) => ErrorSeverity::Medium,
            ErrorKind::InvalidTransition { .. } | ErrorKind::PlanNotReady(_) => {
                ErrorSeverity::Medium
            }
            ErrorKind::PromptNotFound(_) => ErrorSeverity::High,
            ErrorKind::ModelUnavailable(_) => ErrorSeverity::High,
            ErrorKind::ModelTimeout => ErrorSeverity::High,
            ErrorKind::ToolDenied { .. } => ErrorSeverity::Medium,
            ErrorKind::SandboxViolation(_) => ErrorSeverity::Critical,
            ErrorKind::DependencyNotReady(_) => ErrorSeverity::Medium,
            ErrorKind::QuotaExceeded { .. } => ErrorSeverity::High,
            ErrorKind::ApprovalRejected | ErrorKind::ApprovalTimeout => ErrorSeverity::Medium,
            ErrorKind::CheckpointCorrupt(_) => ErrorSeverity::Critical,
            ErrorKind::Cancelled => ErrorSeverity::Low,
            ErrorKind::Internal(_) => ErrorSeverity::High,
        }
    }

    pub fn reason_code(&self) -> String {
        match self {
            ErrorKind::InvalidRequest(_) => "invalid_request".to_string(),
            ErrorKind::InvalidTransition { .. } => "invalid_transition".to_string(),
            ErrorKind::PromptNotFound(_) => "prompt_not_found".to_string(),
            ErrorKind::ModelUnavailable(_) => "model_unavailable".to_string(),
            ErrorKind::ModelTimeout => "model_timeout".to_string(),
            ErrorKind::ToolDenied { .. } => "tool_denied".to_string(),
            ErrorKind::SandboxViolation(_) => "sandbox_violation".to_string(),
            ErrorKind::ValidationFailed(_) => "validation_failed".to_string(),
            ErrorKind::DependencyNotReady(_) => "dependency_not_ready".to_string(),
            ErrorKind::QuotaExceeded { resource } => format!("quota_exceeded_{resource}"),
            ErrorKind::ApprovalRejected => "human_rejected".to_string(),
            ErrorKind::ApprovalTimeout => "approval_timeout".to_string(),
            ErrorKind::CheckpointCorrupt(_) => "checkpoint_corrupt".to_string(),
            ErrorKind::Cancelled => "cancelled".to_string(),
            ErrorKind::PlanNotReady(_) => "plan_not_ready".to_string(),
            ErrorKind::Internal(_) => "internal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_from_low_to_critical() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(ErrorSeverity::High > ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium > ErrorSeverity::Low);
    }

    #[test]
    fn quota_reason_code_names_the_resource() {
        let err = ErrorKind::QuotaExceeded {
            resource: "llm_requests".to_string(),
        };
        assert_eq!(err.reason_code(), "quota_exceeded_llm_requests");
        assert_eq!(err.category(), ErrorCategory::Resource);
    }

    #[test]
    fn model_unavailable_classifies_environment_high() {
        let err = ErrorKind::ModelUnavailable("connection refused".to_string());
        assert_eq!(err.category(), ErrorCategory::Environment);
        assert_eq!(err.severity(), ErrorSeverity::High);
    }
}
