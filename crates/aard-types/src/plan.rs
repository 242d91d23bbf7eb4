use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    PendingApproval,
    Approved,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Deprecated,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Completed
                | PlanStatus::Failed
                | PlanStatus::Cancelled
                | PlanStatus::Deprecated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Blocked,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Action,
    Decision,
    Validation,
    FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub validation_schema: Value,
}

/// Uniform invocation result shared by every dispatch target (agent, tool,
/// function, model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub output: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub description: String,
    pub kind: StepKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub approval_required: bool,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(description: impl Into<String>, kind: StepKind) -> Self {
        Self {
            step_id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            kind,
            dependencies: Vec::new(),
            function_call: None,
            agent_id: None,
            tool_id: None,
            inputs: Value::Null,
            approval_required: false,
            status: StepStatus::Pending,
            result: None,
            attempts: 0,
            started_at: None,
            ended_at: None,
        }
    }
}

/// A hypothesis of execution: an ordered list of steps whose `dependencies`
/// edges form a DAG. Replans reference their predecessor via
/// `parent_plan_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub task_id: String,
    pub version: u32,
    pub goal: String,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    pub status: PlanStatus,
    #[serde(default)]
    pub current_step_index: usize,
    pub autonomy_level: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_plan_id: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
}

impl Plan {
    pub fn new(task_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            plan_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            version: 1,
            goal: goal.into(),
            strategy: String::new(),
            steps: Vec::new(),
            status: PlanStatus::Draft,
            current_step_index: 0,
            autonomy_level: 2,
            created_at: Utc::now(),
            approved_at: None,
            parent_plan_id: None,
            attempt_count: 0,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Allowed plan lifecycle edges; terminal states are sinks.
    pub fn can_transition(from: PlanStatus, to: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (from, to),
            (Draft, PendingApproval)
                | (Draft, Deprecated)
                | (PendingApproval, Approved)
                | (PendingApproval, Failed)
                | (Approved, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Cancelled)
        )
    }
}
