use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;

use aard_types::{
    DecisionSource, ErrorKind, EventStatus, ExecutionEvent, InterpretationBias, OutcomeCategory,
    Plan, Stage, Workflow, WorkflowState,
};

use crate::{ModelCall, ModelGateway, RuntimeContext};

/// Proposed interpretation rules, decaying over time. Reflection appends
/// here; nothing in the pipeline consumes a bias without a human or a
/// later interpretation pass choosing to.
#[derive(Clone, Default)]
pub struct BiasStore {
    inner: Arc<RwLock<Vec<InterpretationBias>>>,
}

impl BiasStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, bias: InterpretationBias) {
        self.inner.write().await.push(bias);
    }

    pub async fn list(&self) -> Vec<InterpretationBias> {
        self.inner.read().await.clone()
    }

    /// Biases whose decayed confidence still clears the floor.
    pub async fn effective(&self, min_confidence: f64) -> Vec<InterpretationBias> {
        let now = Utc::now();
        self.inner
            .read()
            .await
            .iter()
            .filter(|b| b.confidence_at(now) >= min_confidence)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ReflectionReport {
    pub category: OutcomeCategory,
    pub summary: String,
    pub biases_recorded: usize,
}

/// Post-terminal analysis. Reads the event trail, optionally consults the
/// reflection-stage prompt, and records interpretation biases. It never
/// rewrites plans or events.
pub struct ReflectionSink;

impl ReflectionSink {
    pub async fn run(
        ctx: &RuntimeContext,
        workflow: &Workflow,
        plan: Option<&Plan>,
    ) -> ReflectionReport {
        let events = ctx
            .handles
            .journal
            .by_workflow(&ctx.workflow_id, None, None)
            .await;
        let error_count = events
            .iter()
            .filter(|e| e.status == EventStatus::Error)
            .count();
        let category = Self::categorize(workflow, plan, error_count);

        let mut summary = format!(
            "workflow {} ended {} after {} events ({} errors)",
            workflow.workflow_id,
            workflow.current_state.as_str(),
            events.len(),
            error_count
        );
        let mut decision_source = DecisionSource::Rule;

        // The reflection prompt is optional; without one the rule-based
        // categorization stands on its own.
        let call = ModelCall::new(
            Stage::Reflection,
            "reflection",
            json!({
                "request": workflow.original_request,
                "outcome": category.as_str(),
                "errors": error_count,
                "replans": plan.map(|p| p.attempt_count).unwrap_or(0),
            })
            .to_string(),
        );
        match ModelGateway::invoke(ctx, call).await {
            Ok(outcome) => {
                decision_source = DecisionSource::Prompt;
                summary = outcome.text;
            }
            Err(ErrorKind::PromptNotFound(_)) => {}
            Err(error) => {
                tracing::debug!(target: "aard.reflection", %error, "reflection model call skipped");
            }
        }

        let mut biases_recorded = 0;
        if category == OutcomeCategory::SemanticMismatch {
            ctx.handles
                .biases
                .add(InterpretationBias::new(
                    format!("request resembling: {}", workflow.original_request),
                    "ask for clarification before planning",
                    0.4,
                    "reflection",
                ))
                .await;
            biases_recorded += 1;
        }
        if let Some(plan) = plan {
            if plan.attempt_count > 0 && workflow.current_state == WorkflowState::Completed {
                ctx.handles
                    .biases
                    .add(InterpretationBias::new(
                        format!("task type: {}", plan.goal),
                        "prefer smaller, independently verifiable steps",
                        0.3,
                        "reflection",
                    ))
                    .await;
                biases_recorded += 1;
            }
        }

        ctx.emit(
            ExecutionEvent::new(
                &ctx.workflow_id,
                &ctx.session_id,
                Stage::Reflection,
                "reflection",
                "reflection_sink",
                decision_source,
            )
            .with_summaries(&workflow.original_request, &summary)
            .with_metadata(json!({
                "kind": "reflection.completed",
                "category": category.as_str(),
                "biases_recorded": biases_recorded,
            })),
        )
        .await;

        ReflectionReport {
            category,
            summary,
            biases_recorded,
        }
    }

    fn categorize(
        workflow: &Workflow,
        plan: Option<&Plan>,
        error_count: usize,
    ) -> OutcomeCategory {
        match workflow.current_state {
            WorkflowState::Completed => {
                let replanned = plan.map(|p| p.attempt_count > 0).unwrap_or(false);
                let produced_output = plan
                    .map(|p| p.steps.iter().any(|s| s.result.is_some()))
                    .unwrap_or(true);
                if !produced_output {
                    OutcomeCategory::GoalDrift
                } else if error_count > 0 || replanned {
                    OutcomeCategory::PartialSuccess
                } else {
                    OutcomeCategory::Success
                }
            }
            WorkflowState::Failed => match workflow.last_reason_code.as_deref() {
                Some("human_required") | Some("validation_failed") | Some("human_rejected") => {
                    OutcomeCategory::SemanticMismatch
                }
                _ => OutcomeCategory::ExecutionFailure,
            },
            _ => OutcomeCategory::ExecutionFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use aard_journal::EventFilter;

    fn terminal_workflow(state: WorkflowState, reason: Option<&str>) -> Workflow {
        let mut workflow = Workflow::new("What is 2+2?", "session-test");
        workflow.workflow_id = "wf-test".to_string();
        workflow.current_state = state;
        workflow.last_reason_code = reason.map(str::to_string);
        workflow
    }

    #[tokio::test]
    async fn clean_completion_is_success_and_emits_one_reflection_event() {
        let handles = testutil::handles();
        let ctx = testutil::context(handles);
        let workflow = terminal_workflow(WorkflowState::Completed, None);

        let report = ReflectionSink::run(&ctx, &workflow, None).await;
        assert_eq!(report.category, OutcomeCategory::Success);

        let reflections = ctx
            .handles
            .journal
            .recent(
                &EventFilter {
                    stage: Some(Stage::Reflection),
                    ..EventFilter::default()
                },
                10,
            )
            .await;
        assert_eq!(reflections.len(), 1);
        assert_eq!(reflections[0].decision_source, DecisionSource::Rule);
    }

    #[tokio::test]
    async fn human_required_failure_records_a_bias() {
        let handles = testutil::handles();
        let ctx = testutil::context(handles);
        let workflow = terminal_workflow(WorkflowState::Failed, Some("human_required"));

        let report = ReflectionSink::run(&ctx, &workflow, None).await;
        assert_eq!(report.category, OutcomeCategory::SemanticMismatch);
        assert_eq!(report.biases_recorded, 1);
        assert_eq!(ctx.handles.biases.list().await.len(), 1);
    }

    #[tokio::test]
    async fn reflection_prompt_is_used_when_present() {
        let handles = testutil::handles();
        testutil::seed_prompt(&handles, Stage::Reflection, "reflection", "You reflect.").await;
        let ctx = testutil::context(handles);
        let workflow = terminal_workflow(WorkflowState::Completed, None);

        let _ = ReflectionSink::run(&ctx, &workflow, None).await;
        let reflections = ctx
            .handles
            .journal
            .recent(
                &EventFilter {
                    stage: Some(Stage::Reflection),
                    ..EventFilter::default()
                },
                10,
            )
            .await;
        // model.request + model.response + reflection.completed
        assert_eq!(reflections.len(), 3);
        assert_eq!(
            reflections.last().expect("event").decision_source,
            DecisionSource::Prompt
        );
    }

    #[tokio::test]
    async fn bias_confidence_floor_filters_decayed_entries() {
        let store = BiasStore::new();
        let mut fresh = InterpretationBias::new("a", "b", 0.9, "test");
        fresh.half_life_s = 3600;
        let mut stale = InterpretationBias::new("c", "d", 0.9, "test");
        stale.half_life_s = 1;
        stale.created_at = Utc::now() - chrono::Duration::seconds(60);
        store.add(fresh).await;
        store.add(stale).await;

        let effective = store.effective(0.5).await;
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].condition, "a");
    }
}
