use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Prompt,
    Rule,
    Human,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Warn,
    Error,
}

/// Immutable observability record. Appended on every transition or decision,
/// never mutated afterwards. `sequence` is assigned by the journal and is the
/// ordering tiebreak within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
    pub workflow_id: String,
    pub session_id: String,
    pub stage: Stage,
    pub component_role: String,
    pub component_name: String,
    pub decision_source: DecisionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<u32>,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    pub input_summary: String,
    pub output_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl ExecutionEvent {
    pub fn new(
        workflow_id: impl Into<String>,
        session_id: impl Into<String>,
        stage: Stage,
        component_role: impl Into<String>,
        component_name: impl Into<String>,
        decision_source: DecisionSource,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            sequence: 0,
            workflow_id: workflow_id.into(),
            session_id: session_id.into(),
            stage,
            component_role: component_role.into(),
            component_name: component_name.into(),
            decision_source,
            prompt_id: None,
            prompt_version: None,
            status: EventStatus::Ok,
            parent_event_id: None,
            input_summary: String::new(),
            output_summary: String::new(),
            reason_code: None,
            metadata: Value::Null,
        }
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_summaries(
        mut self,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        self.input_summary = input.into();
        self.output_summary = output.into();
        self
    }

    pub fn with_reason(mut self, reason_code: impl Into<String>) -> Self {
        self.reason_code = Some(reason_code.into());
        self
    }

    pub fn with_prompt(mut self, prompt_id: impl Into<String>, version: u32) -> Self {
        self.prompt_id = Some(prompt_id.into());
        self.prompt_version = Some(version);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}
