use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Map, Value};

use aard_governor::{bounded, Bounded, QuotaResource};
use aard_types::{
    ApprovalRequest, ApprovalStatus, DecisionSource, ErrorKind, EventStatus, ExecutionEvent, Plan,
    PlanStatus, Stage, Step, StepResult, StepStatus,
};

use crate::{
    assess_step_risk, classify::should_replan, compute_trust, severity_threshold,
    tools::validate_parameters, Classified, ClassificationTable, GateDecision, ModelCall,
    ModelGateway, RuntimeContext,
};

#[derive(Debug)]
pub enum ExecutionVerdict {
    Completed {
        outputs: Value,
    },
    Replan {
        classified: Classified,
        failure: String,
        failed_step_id: String,
    },
    Failed {
        kind: ErrorKind,
        step_id: Option<String>,
    },
    AwaitingApproval {
        request: ApprovalRequest,
        step_id: String,
    },
    Paused,
    Cancelled,
}

struct StepFailure {
    kind: Option<ErrorKind>,
    message: String,
}

impl StepFailure {
    fn from_kind(kind: ErrorKind) -> Self {
        let message = kind.to_string();
        Self {
            kind: Some(kind),
            message,
        }
    }

    fn from_text(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }
}

/// Drives one approved plan to a verdict: dependency-ordered dispatch with
/// a checkpoint before every step, approval gating per step, rollback on
/// failure, and the replan decision.
pub struct PlanExecutor;

impl PlanExecutor {
    pub async fn execute(ctx: &RuntimeContext, plan: &mut Plan) -> ExecutionVerdict {
        if !matches!(plan.status, PlanStatus::Approved | PlanStatus::Executing) {
            let kind = ErrorKind::PlanNotReady(format!("plan status is {:?}", plan.status));
            Self::emit_step_event(ctx, plan, None, "plan.rejected", EventStatus::Error, &kind.to_string(), Some(kind.reason_code())).await;
            return ExecutionVerdict::Failed {
                kind,
                step_id: None,
            };
        }
        plan.status = PlanStatus::Executing;

        // Accumulated context, keyed by step id. Survives resume because it
        // is rebuilt from succeeded step results.
        let mut outputs = Map::new();
        for step in &plan.steps {
            if step.status == StepStatus::Succeeded {
                if let Some(result) = &step.result {
                    outputs.insert(step.step_id.clone(), result.output.clone());
                }
            }
        }

        let table = ClassificationTable::default();
        let replan_threshold = severity_threshold(&ctx.core.replan.on_severity_threshold);

        loop {
            if ctx.cancel.is_cancelled() {
                Self::skip_remaining(ctx, plan).await;
                plan.status = PlanStatus::Cancelled;
                return ExecutionVerdict::Cancelled;
            }
            if ctx.is_paused() {
                return ExecutionVerdict::Paused;
            }

            let Some(step_id) = Self::next_ready(ctx, plan).await else {
                let all_done = plan
                    .steps
                    .iter()
                    .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped));
                if all_done {
                    plan.status = PlanStatus::Completed;
                    return ExecutionVerdict::Completed {
                        outputs: Value::Object(outputs),
                    };
                }
                let kind =
                    ErrorKind::Internal("no runnable step but plan is not finished".to_string());
                plan.status = PlanStatus::Failed;
                return ExecutionVerdict::Failed {
                    kind,
                    step_id: None,
                };
            };

            if let Some(index) = plan.steps.iter().position(|s| s.step_id == step_id) {
                plan.current_step_index = index;
            }

            // Checkpoint before anything about the step can change state.
            let snapshot = serde_json::to_value(&*plan).unwrap_or(Value::Null);
            ctx.handles
                .checkpoints
                .create("plan", &plan.plan_id, snapshot, &format!("pre_step:{step_id}"))
                .await;

            // Step-level approval gate.
            if let Some(verdict) = Self::gate_step(ctx, plan, &step_id).await {
                return verdict;
            }

            let started = Instant::now();
            if let Some(step) = plan.step_mut(&step_id) {
                step.status = StepStatus::Running;
                step.started_at = Some(Utc::now());
                step.attempts += 1;
            }
            Self::emit_step_event(ctx, plan, Some(&step_id), "plan.step.started", EventStatus::Ok, "", None)
                .await;

            let Some(step_snapshot) = plan.step(&step_id).cloned() else {
                plan.status = PlanStatus::Failed;
                return ExecutionVerdict::Failed {
                    kind: ErrorKind::Internal(format!("step `{step_id}` vanished from plan")),
                    step_id: Some(step_id),
                };
            };
            let dispatch = Self::dispatch(ctx, &step_snapshot, &outputs).await;
            let elapsed_s = started.elapsed().as_secs();
            ctx.handles
                .governor
                .record(QuotaResource::ExecutionTimeS, elapsed_s)
                .await;

            match dispatch {
                Ok(output) => {
                    outputs.insert(step_id.clone(), output.clone());
                    if let Some(step) = plan.step_mut(&step_id) {
                        step.status = StepStatus::Succeeded;
                        step.ended_at = Some(Utc::now());
                        step.result = Some(StepResult {
                            status: StepStatus::Succeeded,
                            output,
                            metadata: json!({"elapsed_ms": started.elapsed().as_millis() as u64}),
                            error: None,
                        });
                    }
                    Self::emit_step_event(
                        ctx,
                        plan,
                        Some(&step_id),
                        "plan.step.succeeded",
                        EventStatus::Ok,
                        "",
                        None,
                    )
                    .await;
                }
                Err(failure) => {
                    let classified = match &failure.kind {
                        Some(kind) => table.classify_kind(kind),
                        None => table.classify(&failure.message),
                    };
                    if let Some(step) = plan.step_mut(&step_id) {
                        step.status = StepStatus::Failed;
                        step.ended_at = Some(Utc::now());
                        step.result = Some(StepResult {
                            status: StepStatus::Failed,
                            output: Value::Null,
                            metadata: json!({
                                "category": classified.category,
                                "severity": classified.severity,
                            }),
                            error: Some(failure.message.clone()),
                        });
                    }
                    let reason = failure
                        .kind
                        .as_ref()
                        .map(|k| k.reason_code())
                        .unwrap_or_else(|| "step_failed".to_string());
                    Self::emit_step_event(
                        ctx,
                        plan,
                        Some(&step_id),
                        "plan.step.failed",
                        EventStatus::Error,
                        &failure.message,
                        Some(reason),
                    )
                    .await;

                    // Roll the plan back to its pre-step snapshot before the
                    // retry-or-replan decision.
                    match ctx.handles.checkpoints.rollback("plan", &plan.plan_id).await {
                        Ok(restored) => {
                            if let Ok(previous) = serde_json::from_value::<Plan>(restored) {
                                *plan = previous;
                            }
                        }
                        Err(kind) => {
                            plan.status = PlanStatus::Failed;
                            return ExecutionVerdict::Failed {
                                kind,
                                step_id: Some(step_id),
                            };
                        }
                    }

                    if should_replan(&classified, replan_threshold) {
                        plan.status = PlanStatus::Failed;
                        return ExecutionVerdict::Replan {
                            classified,
                            failure: failure.message,
                            failed_step_id: step_id,
                        };
                    }

                    if let Some(step) = plan.step_mut(&step_id) {
                        step.status = StepStatus::Failed;
                    }
                    Self::skip_remaining(ctx, plan).await;
                    plan.status = PlanStatus::Failed;
                    let kind = failure
                        .kind
                        .unwrap_or_else(|| ErrorKind::Internal(failure.message));
                    return ExecutionVerdict::Failed {
                        kind,
                        step_id: Some(step_id),
                    };
                }
            }
        }
    }

    /// Next step whose dependencies are all succeeded, in insertion order.
    /// Steps downstream of a failure are skipped on the way.
    async fn next_ready(ctx: &RuntimeContext, plan: &mut Plan) -> Option<String> {
        let mut skipped = Vec::new();
        let mut ready = None;
        for index in 0..plan.steps.len() {
            if !matches!(
                plan.steps[index].status,
                StepStatus::Pending | StepStatus::Blocked
            ) {
                continue;
            }
            let step_id = plan.steps[index].step_id.clone();
            let dependencies = plan.steps[index].dependencies.clone();
            let dep_statuses = dependencies
                .iter()
                .map(|d| plan.step(d).map(|s| s.status))
                .collect::<Vec<_>>();
            if dep_statuses
                .iter()
                .any(|s| matches!(s, Some(StepStatus::Failed) | Some(StepStatus::Skipped) | None))
            {
                plan.steps[index].status = StepStatus::Skipped;
                skipped.push(step_id);
                continue;
            }
            if dep_statuses
                .iter()
                .all(|s| matches!(s, Some(StepStatus::Succeeded)))
            {
                if ready.is_none() {
                    ready = Some(step_id);
                }
            } else {
                plan.steps[index].status = StepStatus::Blocked;
            }
        }
        for step_id in skipped {
            Self::emit_step_event(
                ctx,
                plan,
                Some(&step_id),
                "plan.step.skipped",
                EventStatus::Warn,
                "upstream failure",
                None,
            )
            .await;
        }
        ready
    }

    /// Returns a verdict when the step cannot run yet (or at all) because
    /// of its approval gate.
    async fn gate_step(
        ctx: &RuntimeContext,
        plan: &mut Plan,
        step_id: &str,
    ) -> Option<ExecutionVerdict> {
        let Some(step) = plan.step(step_id).cloned() else {
            return None;
        };
        if !step.approval_required {
            return None;
        }

        if let Some(existing) = ctx
            .handles
            .approvals
            .find_for_step(&plan.plan_id, step_id)
            .await
        {
            return match existing.status {
                ApprovalStatus::Approved => None,
                ApprovalStatus::Pending => Some(ExecutionVerdict::AwaitingApproval {
                    request: existing,
                    step_id: step_id.to_string(),
                }),
                ApprovalStatus::Rejected | ApprovalStatus::Timeout => {
                    let kind = if existing.status == ApprovalStatus::Rejected {
                        ErrorKind::ApprovalRejected
                    } else {
                        ErrorKind::ApprovalTimeout
                    };
                    if let Some(step) = plan.step_mut(step_id) {
                        step.status = StepStatus::Failed;
                    }
                    Self::skip_remaining(ctx, plan).await;
                    plan.status = PlanStatus::Failed;
                    Some(ExecutionVerdict::Failed {
                        kind,
                        step_id: Some(step_id.to_string()),
                    })
                }
            };
        }

        let agent_record = match &step.agent_id {
            Some(agent_id) => ctx.handles.capabilities.get(agent_id).await,
            None => None,
        };
        let trust = compute_trust(agent_record.as_ref(), Utc::now());
        let risk = assess_step_risk(&step, &ctx.core.approval);
        match ctx
            .handles
            .approvals
            .evaluate(
                &ctx.workflow_id,
                plan,
                Some(step_id),
                risk,
                trust,
                &ctx.core.approval,
            )
            .await
        {
            GateDecision::AutoApproved => {
                ctx.emit(
                    ExecutionEvent::new(
                        &ctx.workflow_id,
                        &ctx.session_id,
                        Stage::Execution,
                        "execution",
                        "approval_gate",
                        DecisionSource::Auto,
                    )
                    .with_summaries(&step.description, "step auto-approved")
                    .with_metadata(json!({"kind": "plan.step.auto_approved", "step_id": step_id})),
                )
                .await;
                None
            }
            GateDecision::Pending(request) => {
                ctx.emit(
                    ExecutionEvent::new(
                        &ctx.workflow_id,
                        &ctx.session_id,
                        Stage::Execution,
                        "execution",
                        "approval_gate",
                        DecisionSource::Rule,
                    )
                    .with_status(EventStatus::Warn)
                    .with_summaries(&step.description, &request.recommendation)
                    .with_metadata(json!({
                        "kind": "approval.requested",
                        "request_id": request.request_id,
                        "step_id": step_id,
                    })),
                )
                .await;
                Some(ExecutionVerdict::AwaitingApproval {
                    request,
                    step_id: step_id.to_string(),
                })
            }
        }
    }

    /// Tagged dispatch over the capability set. Every arm produces the same
    /// shape: an output value or a failure.
    async fn dispatch(
        ctx: &RuntimeContext,
        step: &Step,
        outputs: &Map<String, Value>,
    ) -> Result<Value, StepFailure> {
        if let Some(call) = &step.function_call {
            if let Err(reason) = validate_parameters(&call.parameters, &call.validation_schema) {
                return Err(StepFailure::from_kind(ErrorKind::ValidationFailed(reason)));
            }
            if ctx.handles.tools.has(&call.name).await {
                return Self::run_tool(ctx, &call.name, call.parameters.clone()).await;
            }
            let payload = json!({
                "function": call.name,
                "parameters": call.parameters,
                "context": outputs,
            })
            .to_string();
            return Self::run_model(ctx, step, payload).await;
        }

        if let Some(agent_id) = &step.agent_id {
            let record = ctx
                .handles
                .capabilities
                .dispatchable(agent_id)
                .await
                .map_err(StepFailure::from_kind)?;
            let payload = json!({
                "step": step.description,
                "inputs": step.inputs,
                "context": outputs,
            })
            .to_string();
            let mut call = ModelCall::new(
                Stage::Execution,
                format!("agent_{}", record.name),
                payload,
            );
            call.agent_id = Some(record.id.clone());
            let started = Instant::now();
            let result = ModelGateway::invoke(ctx, call).await;
            ctx.handles
                .capabilities
                .record_execution(
                    &record.id,
                    result.is_ok(),
                    started.elapsed().as_millis() as u64,
                )
                .await;
            return result
                .map(|outcome| json!({"text": outcome.text}))
                .map_err(StepFailure::from_kind);
        }

        if let Some(tool_id) = &step.tool_id {
            let record = ctx
                .handles
                .capabilities
                .dispatchable(tool_id)
                .await
                .map_err(StepFailure::from_kind)?;
            let actor = step.agent_id.as_deref().unwrap_or("executor");
            ctx.handles
                .capabilities
                .can_use(actor, tool_id)
                .await
                .map_err(StepFailure::from_kind)?;
            let started = Instant::now();
            let result = Self::run_tool(ctx, &record.name, step.inputs.clone()).await;
            ctx.handles
                .capabilities
                .record_execution(
                    &record.id,
                    result.is_ok(),
                    started.elapsed().as_millis() as u64,
                )
                .await;
            return result;
        }

        let payload = json!({
            "step": step.description,
            "inputs": step.inputs,
            "context": outputs,
        })
        .to_string();
        Self::run_model(ctx, step, payload).await
    }

    async fn run_model(
        ctx: &RuntimeContext,
        _step: &Step,
        payload: String,
    ) -> Result<Value, StepFailure> {
        ModelGateway::invoke(ctx, ModelCall::new(Stage::Execution, "execution", payload))
            .await
            .map(|outcome| json!({"text": outcome.text}))
            .map_err(StepFailure::from_kind)
    }

    async fn run_tool(
        ctx: &RuntimeContext,
        name: &str,
        args: Value,
    ) -> Result<Value, StepFailure> {
        ctx.handles
            .governor
            .admit(QuotaResource::ToolCalls, 1)
            .await
            .map_err(StepFailure::from_kind)?;
        let timeout = Duration::from_secs(ctx.core.step.timeout_s);
        match bounded(
            timeout,
            &ctx.cancel,
            ctx.handles.tools.invoke(name, args, ctx.cancel.clone()),
        )
        .await
        {
            Bounded::Completed(Ok(output)) => Ok(output),
            Bounded::Completed(Err(error)) => Err(StepFailure::from_text(error.to_string())),
            Bounded::TimedOut => Err(StepFailure::from_kind(ErrorKind::ModelTimeout)),
            Bounded::Cancelled => Err(StepFailure::from_kind(ErrorKind::Cancelled)),
        }
    }

    async fn skip_remaining(ctx: &RuntimeContext, plan: &mut Plan) {
        let mut skipped = Vec::new();
        for step in &mut plan.steps {
            if matches!(step.status, StepStatus::Pending | StepStatus::Blocked) {
                step.status = StepStatus::Skipped;
                skipped.push(step.step_id.clone());
            }
        }
        for step_id in skipped {
            Self::emit_step_event(
                ctx,
                plan,
                Some(&step_id),
                "plan.step.skipped",
                EventStatus::Warn,
                "plan did not finish",
                None,
            )
            .await;
        }
    }

    async fn emit_step_event(
        ctx: &RuntimeContext,
        plan: &Plan,
        step_id: Option<&str>,
        kind: &str,
        status: EventStatus,
        detail: &str,
        reason_code: Option<String>,
    ) {
        let description = step_id
            .and_then(|id| plan.step(id))
            .map(|s| s.description.clone())
            .unwrap_or_else(|| plan.goal.clone());
        let mut event = ExecutionEvent::new(
            &ctx.workflow_id,
            &ctx.session_id,
            Stage::Execution,
            "execution",
            "plan_executor",
            DecisionSource::Rule,
        )
        .with_status(status)
        .with_summaries(description, detail)
        .with_metadata(json!({
            "kind": kind,
            "plan_id": plan.plan_id,
            "step_id": step_id,
        }));
        if let Some(reason) = reason_code {
            event = event.with_reason(reason);
        }
        ctx.emit(event).await;
    }
}
