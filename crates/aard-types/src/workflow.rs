use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The seven canonical pipeline stages. Every persisted event carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Interpretation,
    ValidatorA,
    Routing,
    Planning,
    ValidatorB,
    Execution,
    Reflection,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Interpretation => "interpretation",
            Stage::ValidatorA => "validator_a",
            Stage::Routing => "routing",
            Stage::Planning => "planning",
            Stage::ValidatorB => "validator_b",
            Stage::Execution => "execution",
            Stage::Reflection => "reflection",
        }
    }

    pub const ALL: [Stage; 7] = [
        Stage::Interpretation,
        Stage::ValidatorA,
        Stage::Routing,
        Stage::Planning,
        Stage::ValidatorB,
        Stage::Execution,
        Stage::Reflection,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Initialized,
    Parsing,
    Planning,
    ApprovalPending,
    Approved,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Initialized => "INITIALIZED",
            WorkflowState::Parsing => "PARSING",
            WorkflowState::Planning => "PLANNING",
            WorkflowState::ApprovalPending => "APPROVAL_PENDING",
            WorkflowState::Approved => "APPROVED",
            WorkflowState::Executing => "EXECUTING",
            WorkflowState::Paused => "PAUSED",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Cancelled => "CANCELLED",
            WorkflowState::Retrying => "RETRYING",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }
}

/// One workflow per user request. Owned by the pipeline for its lifetime;
/// events reference it by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub current_stage: Stage,
    pub current_state: WorkflowState,
    pub original_request: String,
    pub autonomy_level: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Workflow {
    pub fn new(original_request: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            workflow_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            user_id: None,
            current_stage: Stage::Interpretation,
            current_state: WorkflowState::Initialized,
            original_request: original_request.into(),
            autonomy_level: 2,
            created_at: Utc::now(),
            terminated_at: None,
            last_reason_code: None,
            summary: None,
        }
    }
}
