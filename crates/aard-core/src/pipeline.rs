use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use aard_governor::{bounded, Bounded};
use aard_types::{
    ApprovalRequest, DecisionSource, ErrorKind, EventStatus, ExecutionEvent, Plan, PlanStatus,
    Stage, StepStatus, Workflow, WorkflowState,
};

use crate::{
    assess_risk, compute_trust, fallback_interpretation, heuristic_route, parse_interpretation,
    stages, validate_interpretation, validate_plan, CoreHandles, ExecutionVerdict, GateDecision,
    Interpretation, ModelCall, ModelGateway, PlanExecutor, ReflectionSink, RequestOptions,
    RoutingDecision, RuntimeContext,
};

/// Allowed workflow edges. Terminal states are sinks; anything else is
/// reached only through this table or a governor-forced transition.
pub fn allowed_transition(from: WorkflowState, to: WorkflowState) -> bool {
    use WorkflowState::*;
    matches!(
        (from, to),
        (Initialized, Parsing)
            | (Parsing, Planning)
            | (Parsing, Failed)
            | (Parsing, Cancelled)
            | (Planning, ApprovalPending)
            | (Planning, Approved)
            | (Planning, Failed)
            | (Planning, Cancelled)
            | (ApprovalPending, Approved)
            | (ApprovalPending, Failed)
            | (ApprovalPending, Cancelled)
            | (Approved, Executing)
            | (Executing, Completed)
            | (Executing, Failed)
            | (Executing, Paused)
            | (Executing, Retrying)
            | (Paused, Executing)
            | (Paused, Cancelled)
            | (Retrying, Planning)
    )
}

fn stage_for_state(state: WorkflowState, current: Stage) -> Stage {
    match state {
        WorkflowState::Parsing => Stage::Interpretation,
        WorkflowState::Planning => Stage::Planning,
        // the approval gate sits between plan validation and execution
        WorkflowState::ApprovalPending | WorkflowState::Approved => Stage::ValidatorB,
        WorkflowState::Executing
        | WorkflowState::Paused
        | WorkflowState::Retrying => Stage::Execution,
        _ => current,
    }
}

enum SettleOutcome {
    Finished,
    Replan { failure: String },
}

/// Owns every workflow for its lifetime: the state machine, the stage
/// driver, and the approval/resume/cancel surface.
#[derive(Clone)]
pub struct WorkflowService {
    handles: CoreHandles,
    workflows: Arc<RwLock<HashMap<String, Workflow>>>,
    plans: Arc<RwLock<HashMap<String, Plan>>>,
    workflow_plans: Arc<RwLock<HashMap<String, String>>>,
    pause_flags: Arc<RwLock<HashMap<String, Arc<AtomicBool>>>>,
    options: Arc<RwLock<HashMap<String, RequestOptions>>>,
}

impl WorkflowService {
    pub fn new(handles: CoreHandles) -> Self {
        Self {
            handles,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            plans: Arc::new(RwLock::new(HashMap::new())),
            workflow_plans: Arc::new(RwLock::new(HashMap::new())),
            pause_flags: Arc::new(RwLock::new(HashMap::new())),
            options: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn handles(&self) -> &CoreHandles {
        &self.handles
    }

    /// Creates the workflow and returns it; `run` drives it afterwards.
    pub async fn start(
        &self,
        text: &str,
        session_id: Option<String>,
        options: RequestOptions,
    ) -> Result<Workflow, ErrorKind> {
        if text.trim().is_empty() {
            return Err(ErrorKind::InvalidRequest("request text is empty".to_string()));
        }
        let core = self.handles.config.core().await;
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut workflow = Workflow::new(text, session_id);
        workflow.autonomy_level = options
            .autonomy_level
            .unwrap_or(core.approval.autonomy_default)
            .min(4);

        self.handles
            .governor
            .cancellations
            .create(&workflow.workflow_id)
            .await;
        self.pause_flags
            .write()
            .await
            .insert(workflow.workflow_id.clone(), Arc::new(AtomicBool::new(false)));
        self.options
            .write()
            .await
            .insert(workflow.workflow_id.clone(), options);
        self.workflows
            .write()
            .await
            .insert(workflow.workflow_id.clone(), workflow.clone());

        let ctx = self.context_for(&workflow).await;
        ctx.emit(
            ExecutionEvent::new(
                &workflow.workflow_id,
                &workflow.session_id,
                Stage::Interpretation,
                "pipeline",
                "workflow_service",
                DecisionSource::Rule,
            )
            .with_summaries(text, "workflow created")
            .with_metadata(json!({
                "kind": "workflow.created",
                "state": workflow.current_state,
                "autonomy_level": workflow.autonomy_level,
            })),
        )
        .await;

        Ok(workflow)
    }

    pub async fn get(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    pub async fn get_plan(&self, plan_id: &str) -> Option<Plan> {
        self.plans.read().await.get(plan_id).cloned()
    }

    pub async fn plan_for_workflow(&self, workflow_id: &str) -> Option<Plan> {
        let plan_id = self
            .workflow_plans
            .read()
            .await
            .get(workflow_id)
            .cloned()?;
        self.get_plan(&plan_id).await
    }

    pub async fn history(&self, workflow_id: &str) -> Vec<ExecutionEvent> {
        self.handles.journal.by_workflow(workflow_id, None, None).await
    }

    async fn context_for(&self, workflow: &Workflow) -> RuntimeContext {
        let core = self.handles.config.core().await;
        let cancel = self
            .handles
            .governor
            .cancellations
            .create(&workflow.workflow_id)
            .await;
        let options = self
            .options
            .read()
            .await
            .get(&workflow.workflow_id)
            .cloned()
            .unwrap_or_default();
        let flag = self
            .pause_flags
            .read()
            .await
            .get(&workflow.workflow_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        RuntimeContext::new(
            workflow.workflow_id.clone(),
            workflow.session_id.clone(),
            options,
            core,
            cancel,
            self.handles.clone(),
        )
        .with_pause_flag(flag)
    }

    /// Validated transition. Disallowed edges change nothing and leave an
    /// error event behind; forced transitions are reserved for the governor
    /// surface (timeout, cancellation) and must carry a reason.
    pub async fn advance(
        &self,
        ctx: &RuntimeContext,
        to: WorkflowState,
        stage_override: Option<Stage>,
        decision_source: DecisionSource,
        reason_code: Option<String>,
        forced: bool,
    ) -> Result<Workflow, ErrorKind> {
        let mut workflows = self.workflows.write().await;
        let Some(workflow) = workflows.get_mut(&ctx.workflow_id) else {
            return Err(ErrorKind::InvalidRequest(format!(
                "unknown workflow `{}`",
                ctx.workflow_id
            )));
        };
        let from = workflow.current_state;

        if forced && reason_code.is_none() {
            return Err(ErrorKind::InvalidRequest(
                "forced transition requires a reason code".to_string(),
            ));
        }
        let allowed = allowed_transition(from, to)
            || (forced && !from.is_terminal() && matches!(to, WorkflowState::Failed | WorkflowState::Cancelled));
        if !allowed {
            let err = ErrorKind::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            };
            let event = ExecutionEvent::new(
                &ctx.workflow_id,
                &ctx.session_id,
                workflow.current_stage,
                "pipeline",
                "workflow_service",
                DecisionSource::Rule,
            )
            .with_status(EventStatus::Error)
            .with_summaries("", err.to_string())
            .with_reason(err.reason_code())
            .with_metadata(json!({"kind": "workflow.transition.rejected"}));
            drop(workflows);
            ctx.emit(event).await;
            return Err(err);
        }

        let stage = stage_override.unwrap_or_else(|| stage_for_state(to, workflow.current_stage));
        workflow.current_state = to;
        workflow.current_stage = stage;
        if to.is_terminal() {
            workflow.terminated_at = Some(Utc::now());
            workflow.last_reason_code = reason_code.clone();
        }
        let snapshot = workflow.clone();
        drop(workflows);

        let status = if to == WorkflowState::Cancelled {
            EventStatus::Warn
        } else {
            EventStatus::Ok
        };
        let mut event = ExecutionEvent::new(
            &ctx.workflow_id,
            &ctx.session_id,
            stage,
            "pipeline",
            "workflow_service",
            decision_source,
        )
        .with_status(status)
        .with_summaries("", format!("{} -> {}", from.as_str(), to.as_str()))
        .with_metadata(json!({
            "kind": "workflow.transition",
            "from": from,
            "to": to,
            "forced": forced,
        }));
        if let Some(reason) = reason_code {
            event = event.with_reason(reason);
        }
        ctx.emit(event).await;
        Ok(snapshot)
    }

    /// Drives a freshly-started workflow to a terminal state, an approval
    /// wait, or a pause.
    pub async fn run(&self, workflow_id: &str) {
        let Some(workflow) = self.get(workflow_id).await else {
            return;
        };
        let ctx = self.context_for(&workflow).await;

        if self
            .advance(&ctx, WorkflowState::Parsing, None, DecisionSource::Rule, None, false)
            .await
            .is_err()
        {
            return;
        }

        // interpretation
        let interpretation = match self.stage_interpretation(&ctx, &workflow).await {
            Ok(interpretation) => interpretation,
            Err(kind) => {
                self.fail(&ctx, kind, Stage::Interpretation).await;
                return;
            }
        };

        // validator_a
        if let Err(kind) = self.stage_validator_a(&ctx, &interpretation).await {
            self.fail_for_clarification(&ctx, kind).await;
            return;
        }

        // routing
        let route = self.stage_routing(&ctx, &interpretation).await;

        match route {
            RoutingDecision::SimpleQuestion => {
                self.run_direct_answer(&ctx, &workflow).await;
            }
            RoutingDecision::Plan => {
                self.plan_and_execute(&ctx, &workflow, &interpretation, None, None)
                    .await;
            }
        }
    }

    async fn stage_interpretation(
        &self,
        ctx: &RuntimeContext,
        workflow: &Workflow,
    ) -> Result<Interpretation, ErrorKind> {
        let rule = fallback_interpretation(&workflow.original_request);
        // Confidently classified requests do not spend a model call; only
        // ambiguous ones consult the interpretation prompt.
        let (interpretation, source) = if rule.task_type != "task" {
            (rule, DecisionSource::Rule)
        } else {
            let call = ModelCall::new(
                Stage::Interpretation,
                "interpretation",
                workflow.original_request.clone(),
            );
            match ModelGateway::invoke(ctx, call).await {
                Ok(outcome) => match parse_interpretation(&outcome.text) {
                    Some(parsed) => (parsed, DecisionSource::Prompt),
                    None => (rule, DecisionSource::Rule),
                },
                Err(ErrorKind::PromptNotFound(_)) => (rule, DecisionSource::Rule),
                Err(kind) => return Err(kind),
            }
        };

        ctx.emit(
            ExecutionEvent::new(
                &ctx.workflow_id,
                &ctx.session_id,
                Stage::Interpretation,
                "interpretation",
                "interpreter",
                source,
            )
            .with_summaries(&workflow.original_request, &interpretation.intent)
            .with_metadata(json!({
                "kind": "interpretation.completed",
                "task_type": interpretation.task_type,
                "confidence": interpretation.confidence,
            })),
        )
        .await;
        Ok(interpretation)
    }

    async fn stage_validator_a(
        &self,
        ctx: &RuntimeContext,
        interpretation: &Interpretation,
    ) -> Result<(), ErrorKind> {
        let result = validate_interpretation(interpretation);
        let (status, detail, reason) = match &result {
            Ok(()) => (EventStatus::Ok, "interpretation accepted".to_string(), None),
            Err(kind) => (EventStatus::Error, kind.to_string(), Some(kind.reason_code())),
        };
        let mut event = ExecutionEvent::new(
            &ctx.workflow_id,
            &ctx.session_id,
            Stage::ValidatorA,
            "interpretation_validator",
            "validator_a",
            DecisionSource::Rule,
        )
        .with_status(status)
        .with_summaries(&interpretation.intent, detail);
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        ctx.emit(event).await;
        result
    }

    async fn stage_routing(
        &self,
        ctx: &RuntimeContext,
        interpretation: &Interpretation,
    ) -> RoutingDecision {
        let route = heuristic_route(interpretation);
        ctx.emit(
            ExecutionEvent::new(
                &ctx.workflow_id,
                &ctx.session_id,
                Stage::Routing,
                "routing",
                "router",
                DecisionSource::Rule,
            )
            .with_summaries(&interpretation.intent, route.as_str())
            .with_metadata(json!({"kind": "routing.decided", "route": route.as_str()})),
        )
        .await;
        route
    }

    /// Simple-question fast path: no plan, one model call under the
    /// execution stage.
    async fn run_direct_answer(&self, ctx: &RuntimeContext, workflow: &Workflow) {
        for (state, stage) in [
            (WorkflowState::Planning, Stage::Routing),
            (WorkflowState::Approved, Stage::Routing),
            (WorkflowState::Executing, Stage::Execution),
        ] {
            if self
                .advance(ctx, state, Some(stage), DecisionSource::Rule, None, false)
                .await
                .is_err()
            {
                return;
            }
        }

        let call = ModelCall::new(
            Stage::Execution,
            "execution",
            workflow.original_request.clone(),
        );
        match ModelGateway::invoke(ctx, call).await {
            Ok(outcome) => {
                let _ = ctx
                    .handles
                    .memory
                    .put(
                        &format!("workflow:{}:result", ctx.workflow_id),
                        json!({"text": outcome.text}),
                        vec!["answer".to_string()],
                    )
                    .await;
                self.set_summary(&ctx.workflow_id, &outcome.text).await;
                let _ = self
                    .advance(ctx, WorkflowState::Completed, None, DecisionSource::Rule, None, false)
                    .await;
                self.reflect(ctx).await;
            }
            Err(kind) => {
                self.fail(ctx, kind, Stage::Execution).await;
            }
        }
    }

    /// Planning, validation, approval gating, execution, and the replan
    /// loop for plan-routed requests.
    async fn plan_and_execute(
        &self,
        ctx: &RuntimeContext,
        workflow: &Workflow,
        interpretation: &Interpretation,
        mut parent: Option<(String, u32)>,
        mut failure_context: Option<String>,
    ) {
        let core = &ctx.core;

        if parent.is_none()
            && self
                .advance(ctx, WorkflowState::Planning, None, DecisionSource::Rule, None, false)
                .await
                .is_err()
        {
            return;
        }

        loop {
            // planning
            let parent_ref = parent
                .as_ref()
                .map(|(plan_id, attempt)| (plan_id.as_str(), *attempt));
            let plan = match self
                .stage_planning(ctx, workflow, interpretation, parent_ref, failure_context.take())
                .await
            {
                Ok(plan) => plan,
                Err(kind) => {
                    self.fail(ctx, kind, Stage::Planning).await;
                    return;
                }
            };

            // validator_b
            if let Err(kind) = self.stage_validator_b(ctx, &plan).await {
                self.fail(ctx, kind, Stage::ValidatorB).await;
                return;
            }

            let mut plan = plan;
            self.store_plan(&ctx.workflow_id, &plan).await;

            // adaptive approval gate
            let trust = self.plan_trust(&plan).await;
            let risk = assess_risk(&plan, &core.approval);
            plan.status = PlanStatus::PendingApproval;
            match ctx
                .handles
                .approvals
                .evaluate(&ctx.workflow_id, &plan, None, risk, trust, &core.approval)
                .await
            {
                GateDecision::AutoApproved => {
                    plan.status = PlanStatus::Approved;
                    plan.approved_at = Some(Utc::now());
                    self.store_plan(&ctx.workflow_id, &plan).await;
                    ctx.emit(
                        ExecutionEvent::new(
                            &ctx.workflow_id,
                            &ctx.session_id,
                            Stage::ValidatorB,
                            "approval_gate",
                            "adaptive_approval",
                            DecisionSource::Auto,
                        )
                        .with_summaries(&plan.goal, "plan auto-approved")
                        .with_metadata(json!({
                            "kind": "plan.approved",
                            "plan_id": plan.plan_id,
                            "trust": trust,
                        })),
                    )
                    .await;
                    if self
                        .advance(ctx, WorkflowState::Approved, None, DecisionSource::Auto, None, false)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                GateDecision::Pending(request) => {
                    self.store_plan(&ctx.workflow_id, &plan).await;
                    ctx.emit(
                        ExecutionEvent::new(
                            &ctx.workflow_id,
                            &ctx.session_id,
                            Stage::ValidatorB,
                            "approval_gate",
                            "adaptive_approval",
                            DecisionSource::Rule,
                        )
                        .with_status(EventStatus::Warn)
                        .with_summaries(&plan.goal, &request.recommendation)
                        .with_metadata(json!({
                            "kind": "approval.requested",
                            "request_id": request.request_id,
                            "plan_id": plan.plan_id,
                        })),
                    )
                    .await;
                    let _ = self
                        .advance(
                            ctx,
                            WorkflowState::ApprovalPending,
                            None,
                            DecisionSource::Rule,
                            None,
                            false,
                        )
                        .await;
                    return;
                }
            }

            if self
                .advance(ctx, WorkflowState::Executing, None, DecisionSource::Rule, None, false)
                .await
                .is_err()
            {
                return;
            }

            match self.execute_and_settle(ctx, plan).await {
                SettleOutcome::Finished => return,
                SettleOutcome::Replan { failure } => {
                    let Some(previous) = self.plan_for_workflow(&ctx.workflow_id).await else {
                        self.fail(
                            ctx,
                            ErrorKind::Internal("replanning workflow lost its plan".to_string()),
                            Stage::Planning,
                        )
                        .await;
                        return;
                    };
                    parent = Some((previous.plan_id.clone(), previous.attempt_count + 1));
                    failure_context = Some(failure);
                }
            }
        }
    }

    async fn stage_planning(
        &self,
        ctx: &RuntimeContext,
        workflow: &Workflow,
        interpretation: &Interpretation,
        parent: Option<(&str, u32)>,
        failure_context: Option<String>,
    ) -> Result<Plan, ErrorKind> {
        let payload = json!({
            "request": workflow.original_request,
            "intent": interpretation.intent,
            "task_type": interpretation.task_type,
            "previous_failure": failure_context,
        })
        .to_string();
        let outcome =
            ModelGateway::invoke(ctx, ModelCall::new(Stage::Planning, "planning", payload)).await?;

        let Some(value) = stages::extract_json(&outcome.text) else {
            return Err(ErrorKind::ValidationFailed(
                "planning output is not JSON".to_string(),
            ));
        };
        let plan = stages::build_plan(
            &value,
            &ctx.workflow_id,
            &interpretation.intent,
            workflow.autonomy_level,
            parent,
        )?;

        ctx.emit(
            ExecutionEvent::new(
                &ctx.workflow_id,
                &ctx.session_id,
                Stage::Planning,
                "planning",
                "plan_builder",
                DecisionSource::Prompt,
            )
            .with_summaries(
                &workflow.original_request,
                format!("plan with {} step(s)", plan.steps.len()),
            )
            .with_metadata(json!({
                "kind": "plan.created",
                "plan_id": plan.plan_id,
                "parent_plan_id": plan.parent_plan_id,
                "attempt": plan.attempt_count,
            })),
        )
        .await;
        Ok(plan)
    }

    async fn stage_validator_b(&self, ctx: &RuntimeContext, plan: &Plan) -> Result<(), ErrorKind> {
        let result = validate_plan(plan, ctx.core.plan.max_steps);
        let (status, detail, reason) = match &result {
            Ok(()) => (EventStatus::Ok, "plan accepted".to_string(), None),
            Err(kind) => (EventStatus::Error, kind.to_string(), Some(kind.reason_code())),
        };
        let mut event = ExecutionEvent::new(
            &ctx.workflow_id,
            &ctx.session_id,
            Stage::ValidatorB,
            "execution_validator",
            "validator_b",
            DecisionSource::Rule,
        )
        .with_status(status)
        .with_summaries(&plan.goal, detail)
        .with_metadata(json!({"kind": "plan.validated", "plan_id": plan.plan_id}));
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        ctx.emit(event).await;
        result
    }

    /// Runs the executor under the plan clock and maps its verdict onto
    /// workflow transitions. `Replan` bubbles up to the planning loop.
    async fn execute_and_settle(&self, ctx: &RuntimeContext, mut plan: Plan) -> SettleOutcome {
        let core = &ctx.core;
        let plan_timeout = Duration::from_secs(core.plan.total_timeout_s.max(core.plan.timeout_s));

        let verdict = match bounded(
            plan_timeout,
            &ctx.cancel,
            PlanExecutor::execute(ctx, &mut plan),
        )
        .await
        {
            Bounded::Completed(verdict) => verdict,
            Bounded::TimedOut => {
                plan.status = PlanStatus::Failed;
                self.store_plan(&ctx.workflow_id, &plan).await;
                let _ = self
                    .advance(
                        ctx,
                        WorkflowState::Failed,
                        None,
                        DecisionSource::Rule,
                        Some("timeout".to_string()),
                        true,
                    )
                    .await;
                self.reflect(ctx).await;
                return SettleOutcome::Finished;
            }
            Bounded::Cancelled => ExecutionVerdict::Cancelled,
        };

        self.store_plan(&ctx.workflow_id, &plan).await;

        match verdict {
            ExecutionVerdict::Completed { outputs } => {
                let _ = ctx
                    .handles
                    .memory
                    .put(
                        &format!("workflow:{}:result", ctx.workflow_id),
                        outputs.clone(),
                        vec!["plan_result".to_string()],
                    )
                    .await;
                self.set_summary(&ctx.workflow_id, &summarize_outputs(&outputs))
                    .await;
                let _ = self
                    .advance(ctx, WorkflowState::Completed, None, DecisionSource::Rule, None, false)
                    .await;
                self.reflect(ctx).await;
                SettleOutcome::Finished
            }
            ExecutionVerdict::Replan {
                classified,
                failure,
                ..
            } => {
                let attempts = plan.attempt_count + 1;
                if attempts > ctx.core.replan.max_attempts {
                    let _ = self
                        .advance(
                            ctx,
                            WorkflowState::Failed,
                            None,
                            DecisionSource::Rule,
                            Some("human_required".to_string()),
                            false,
                        )
                        .await;
                    self.set_summary(
                        &ctx.workflow_id,
                        &format!("replan budget exhausted after: {failure}"),
                    )
                    .await;
                    self.reflect(ctx).await;
                    return SettleOutcome::Finished;
                }
                let _ = self
                    .advance(
                        ctx,
                        WorkflowState::Retrying,
                        Some(Stage::Execution),
                        DecisionSource::Rule,
                        Some(format!("{:?}", classified.category).to_lowercase()),
                        false,
                    )
                    .await;
                let _ = self
                    .advance(ctx, WorkflowState::Planning, None, DecisionSource::Rule, None, false)
                    .await;
                SettleOutcome::Replan { failure }
            }
            ExecutionVerdict::Failed { kind, .. } => {
                self.fail(ctx, kind, Stage::Execution).await;
                SettleOutcome::Finished
            }
            ExecutionVerdict::AwaitingApproval { .. } => {
                let _ = self
                    .advance(
                        ctx,
                        WorkflowState::Paused,
                        None,
                        DecisionSource::Rule,
                        Some("approval_required".to_string()),
                        false,
                    )
                    .await;
                SettleOutcome::Finished
            }
            ExecutionVerdict::Paused => {
                let _ = self
                    .advance(
                        ctx,
                        WorkflowState::Paused,
                        None,
                        DecisionSource::Human,
                        Some("paused".to_string()),
                        false,
                    )
                    .await;
                SettleOutcome::Finished
            }
            ExecutionVerdict::Cancelled => {
                let _ = self
                    .advance(
                        ctx,
                        WorkflowState::Cancelled,
                        None,
                        DecisionSource::Rule,
                        Some("cancelled".to_string()),
                        true,
                    )
                    .await;
                self.reflect(ctx).await;
                SettleOutcome::Finished
            }
        }
    }

    async fn plan_trust(&self, plan: &Plan) -> f64 {
        let agent_id = plan.steps.iter().find_map(|s| s.agent_id.clone());
        let record = match agent_id {
            Some(id) => self.handles.capabilities.get(&id).await,
            None => None,
        };
        compute_trust(record.as_ref(), Utc::now())
    }

    /// Human decision endpoint. Approval resumes the pipeline; rejection
    /// terminates it.
    pub async fn decide_approval(
        &self,
        request_id: &str,
        approve: bool,
        actor: &str,
        note: Option<String>,
    ) -> Result<ApprovalRequest, ErrorKind> {
        let request = self
            .handles
            .approvals
            .decide(request_id, approve, actor, note)
            .await?;
        let Some(workflow) = self.get(&request.workflow_id).await else {
            return Ok(request);
        };
        let ctx = self.context_for(&workflow).await;

        match (&request.step_id, approve) {
            (None, true) => {
                if workflow.current_state == WorkflowState::ApprovalPending {
                    if let Some(mut plan) = self.plan_for_workflow(&workflow.workflow_id).await {
                        plan.status = PlanStatus::Approved;
                        plan.approved_at = Some(Utc::now());
                        self.store_plan(&workflow.workflow_id, &plan).await;
                        ctx.emit(
                            ExecutionEvent::new(
                                &ctx.workflow_id,
                                &ctx.session_id,
                                Stage::ValidatorB,
                                "approval_gate",
                                "adaptive_approval",
                                DecisionSource::Human,
                            )
                            .with_summaries(&plan.goal, format!("approved by {actor}"))
                            .with_metadata(json!({
                                "kind": "plan.approved",
                                "plan_id": plan.plan_id,
                                "request_id": request.request_id,
                            })),
                        )
                        .await;
                        if self
                            .advance(
                                &ctx,
                                WorkflowState::Approved,
                                None,
                                DecisionSource::Human,
                                None,
                                false,
                            )
                            .await
                            .is_ok()
                        {
                            let service = self.clone();
                            let workflow_id = workflow.workflow_id.clone();
                            tokio::spawn(async move {
                                service.continue_from_approved(&workflow_id).await;
                            });
                        }
                    }
                }
            }
            (None, false) => {
                if workflow.current_state == WorkflowState::ApprovalPending {
                    self.fail(&ctx, ErrorKind::ApprovalRejected, Stage::ValidatorB)
                        .await;
                }
            }
            (Some(_), true) => {
                if workflow.current_state == WorkflowState::Paused {
                    if self
                        .advance(&ctx, WorkflowState::Executing, None, DecisionSource::Human, None, false)
                        .await
                        .is_ok()
                    {
                        let service = self.clone();
                        let workflow_id = workflow.workflow_id.clone();
                        tokio::spawn(async move {
                            service.continue_execution(&workflow_id).await;
                        });
                    }
                }
            }
            (Some(_), false) => {
                if workflow.current_state == WorkflowState::Paused {
                    let _ = self
                        .advance(
                            &ctx,
                            WorkflowState::Cancelled,
                            None,
                            DecisionSource::Human,
                            Some("human_rejected".to_string()),
                            false,
                        )
                        .await;
                    self.reflect(&ctx).await;
                }
            }
        }
        Ok(request)
    }

    /// Continuation after a plan-level approval: APPROVED -> EXECUTING and
    /// onwards, including any replan rounds.
    pub async fn continue_from_approved(&self, workflow_id: &str) {
        let Some(workflow) = self.get(workflow_id).await else {
            return;
        };
        if workflow.current_state != WorkflowState::Approved {
            return;
        }
        let Some(plan) = self.plan_for_workflow(workflow_id).await else {
            return;
        };
        let ctx = self.context_for(&workflow).await;
        if self
            .advance(&ctx, WorkflowState::Executing, None, DecisionSource::Rule, None, false)
            .await
            .is_err()
        {
            return;
        }
        if let SettleOutcome::Replan { failure } = self.execute_and_settle(&ctx, plan).await {
            let interpretation = fallback_interpretation(&workflow.original_request);
            let Some(previous) = self.plan_for_workflow(workflow_id).await else {
                return;
            };
            self.plan_and_execute(
                &ctx,
                &workflow,
                &interpretation,
                Some((previous.plan_id.clone(), previous.attempt_count + 1)),
                Some(failure),
            )
            .await;
        }
    }

    /// Continuation after a step-level approval or a resume from pause.
    pub async fn continue_execution(&self, workflow_id: &str) {
        let Some(workflow) = self.get(workflow_id).await else {
            return;
        };
        if workflow.current_state != WorkflowState::Executing {
            return;
        }
        let Some(plan) = self.plan_for_workflow(workflow_id).await else {
            return;
        };
        let ctx = self.context_for(&workflow).await;
        if let SettleOutcome::Replan { failure } = self.execute_and_settle(&ctx, plan).await {
            let interpretation = fallback_interpretation(&workflow.original_request);
            let Some(previous) = self.plan_for_workflow(workflow_id).await else {
                return;
            };
            self.plan_and_execute(
                &ctx,
                &workflow,
                &interpretation,
                Some((previous.plan_id.clone(), previous.attempt_count + 1)),
                Some(failure),
            )
            .await;
        }
    }

    pub async fn pause(&self, workflow_id: &str) -> Result<(), ErrorKind> {
        let Some(workflow) = self.get(workflow_id).await else {
            return Err(ErrorKind::InvalidRequest(format!(
                "unknown workflow `{workflow_id}`"
            )));
        };
        if workflow.current_state != WorkflowState::Executing {
            return Err(ErrorKind::InvalidTransition {
                from: workflow.current_state.as_str().to_string(),
                to: WorkflowState::Paused.as_str().to_string(),
            });
        }
        if let Some(flag) = self.pause_flags.read().await.get(workflow_id) {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn resume(&self, workflow_id: &str) -> Result<(), ErrorKind> {
        let Some(workflow) = self.get(workflow_id).await else {
            return Err(ErrorKind::InvalidRequest(format!(
                "unknown workflow `{workflow_id}`"
            )));
        };
        if workflow.current_state != WorkflowState::Paused {
            return Err(ErrorKind::InvalidTransition {
                from: workflow.current_state.as_str().to_string(),
                to: WorkflowState::Executing.as_str().to_string(),
            });
        }
        if let Some(flag) = self.pause_flags.read().await.get(workflow_id) {
            flag.store(false, std::sync::atomic::Ordering::SeqCst);
        }
        let ctx = self.context_for(&workflow).await;
        self.advance(&ctx, WorkflowState::Executing, None, DecisionSource::Human, None, false)
            .await?;
        let service = self.clone();
        let workflow_id = workflow_id.to_string();
        tokio::spawn(async move {
            service.continue_execution(&workflow_id).await;
        });
        Ok(())
    }

    /// Cooperative cancellation: signals the token; parked workflows
    /// (approval wait, pause) transition immediately, running ones at the
    /// executor's next check.
    pub async fn cancel(&self, workflow_id: &str) -> Result<Workflow, ErrorKind> {
        let Some(workflow) = self.get(workflow_id).await else {
            return Err(ErrorKind::InvalidRequest(format!(
                "unknown workflow `{workflow_id}`"
            )));
        };
        if workflow.current_state.is_terminal() {
            return Ok(workflow);
        }
        self.handles.governor.cancellations.cancel(workflow_id).await;

        if matches!(
            workflow.current_state,
            WorkflowState::ApprovalPending | WorkflowState::Paused | WorkflowState::Initialized
        ) {
            let ctx = self.context_for(&workflow).await;
            if let Some(mut plan) = self.plan_for_workflow(workflow_id).await {
                for step in &mut plan.steps {
                    if matches!(step.status, StepStatus::Pending | StepStatus::Blocked) {
                        step.status = StepStatus::Skipped;
                    }
                }
                plan.status = PlanStatus::Cancelled;
                self.store_plan(workflow_id, &plan).await;
            }
            let updated = self
                .advance(
                    &ctx,
                    WorkflowState::Cancelled,
                    None,
                    DecisionSource::Human,
                    Some("cancelled".to_string()),
                    true,
                )
                .await?;
            self.reflect(&ctx).await;
            return Ok(updated);
        }
        Ok(workflow)
    }

    /// Applies the approval timeout policy and settles affected workflows.
    pub async fn sweep_approvals(&self) {
        let core = self.handles.config.core().await;
        let expired = self
            .handles
            .approvals
            .expire_due(Utc::now(), &core.approval.timeout_policy)
            .await;
        for request in expired {
            let Some(workflow) = self.get(&request.workflow_id).await else {
                continue;
            };
            let ctx = self.context_for(&workflow).await;
            match request.status {
                aard_types::ApprovalStatus::Approved => {
                    // auto_approve policy: treat like a human approval
                    if workflow.current_state == WorkflowState::ApprovalPending {
                        if let Some(mut plan) = self.plan_for_workflow(&workflow.workflow_id).await
                        {
                            plan.status = PlanStatus::Approved;
                            plan.approved_at = Some(Utc::now());
                            self.store_plan(&workflow.workflow_id, &plan).await;
                            if self
                                .advance(
                                    &ctx,
                                    WorkflowState::Approved,
                                    None,
                                    DecisionSource::Auto,
                                    None,
                                    false,
                                )
                                .await
                                .is_ok()
                            {
                                let service = self.clone();
                                let workflow_id = workflow.workflow_id.clone();
                                tokio::spawn(async move {
                                    service.continue_from_approved(&workflow_id).await;
                                });
                            }
                        }
                    }
                }
                _ => {
                    if !workflow.current_state.is_terminal() {
                        self.fail(&ctx, ErrorKind::ApprovalTimeout, workflow.current_stage)
                            .await;
                    }
                }
            }
        }
    }

    async fn fail(&self, ctx: &RuntimeContext, kind: ErrorKind, stage: Stage) {
        if kind == ErrorKind::Cancelled {
            let _ = self
                .advance(
                    ctx,
                    WorkflowState::Cancelled,
                    Some(stage),
                    DecisionSource::Rule,
                    Some(kind.reason_code()),
                    true,
                )
                .await;
        } else {
            let _ = self
                .advance(
                    ctx,
                    WorkflowState::Failed,
                    Some(stage),
                    DecisionSource::Rule,
                    Some(kind.reason_code()),
                    false,
                )
                .await;
        }
        self.set_summary(&ctx.workflow_id, &kind.to_string()).await;
        self.reflect(ctx).await;
    }

    /// Interpretation rejected: the failure is surfaced ready for a
    /// clarification round, not as an internal error.
    async fn fail_for_clarification(&self, ctx: &RuntimeContext, kind: ErrorKind) {
        self.set_summary(
            &ctx.workflow_id,
            &format!("needs clarification: {kind}"),
        )
        .await;
        let _ = self
            .advance(
                ctx,
                WorkflowState::Failed,
                Some(Stage::ValidatorA),
                DecisionSource::Rule,
                Some("human_required".to_string()),
                false,
            )
            .await;
        self.reflect(ctx).await;
    }

    async fn reflect(&self, ctx: &RuntimeContext) {
        let Some(mut workflow) = self.get(&ctx.workflow_id).await else {
            return;
        };
        let plan = self.plan_for_workflow(&ctx.workflow_id).await;
        {
            let mut workflows = self.workflows.write().await;
            if let Some(stored) = workflows.get_mut(&ctx.workflow_id) {
                stored.current_stage = Stage::Reflection;
                workflow = stored.clone();
            }
        }
        ReflectionSink::run(ctx, &workflow, plan.as_ref()).await;
        self.handles.governor.cancellations.remove(&ctx.workflow_id).await;
    }

    async fn set_summary(&self, workflow_id: &str, summary: &str) {
        let mut workflows = self.workflows.write().await;
        if let Some(workflow) = workflows.get_mut(workflow_id) {
            workflow.summary = Some(summary.to_string());
        }
    }

    async fn store_plan(&self, workflow_id: &str, plan: &Plan) {
        self.plans
            .write()
            .await
            .insert(plan.plan_id.clone(), plan.clone());
        self.workflow_plans
            .write()
            .await
            .insert(workflow_id.to_string(), plan.plan_id.clone());
    }
}

fn summarize_outputs(outputs: &Value) -> String {
    match outputs {
        Value::Object(map) => {
            let mut parts = Vec::new();
            for (step_id, output) in map {
                let text = output
                    .get("text")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| output.to_string());
                parts.push(format!("{step_id}: {text}"));
            }
            parts.join("; ")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::ToolInvoker;
    use aard_providers::{
        CompletionRequest, CompletionResponse, HostedModel, ModelServer, ServerInfo,
    };
    use aard_types::{CapabilityKind, CapabilityRecord};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Returns scripted responses in order, echoing once the script runs
    /// dry.
    struct ScriptedServer {
        responses: Mutex<VecDeque<String>>,
    }

    impl ScriptedServer {
        fn new(responses: Vec<String>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl ModelServer for ScriptedServer {
        fn info(&self) -> ServerInfo {
            ServerInfo {
                id: "scripted".to_string(),
                name: "Scripted".to_string(),
                models: vec![HostedModel {
                    id: "scripted-1".to_string(),
                    server_id: "scripted".to_string(),
                    display_name: "Scripted".to_string(),
                    context_window: 8192,
                }],
            }
        }

        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> anyhow::Result<CompletionResponse> {
            let next = self.responses.lock().await.pop_front();
            Ok(CompletionResponse {
                text: next.unwrap_or_else(|| format!("Echo: {}", request.user)),
                usage: None,
            })
        }
    }

    struct FlakyTool {
        failed_once: AtomicBool,
    }

    #[async_trait]
    impl ToolInvoker for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn invoke(
            &self,
            _args: Value,
            _cancel: CancellationToken,
        ) -> anyhow::Result<Value> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                anyhow::bail!("upstream model timed out");
            }
            Ok(json!({"ok": true}))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl ToolInvoker for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        async fn invoke(
            &self,
            _args: Value,
            cancel: CancellationToken,
        ) -> anyhow::Result<Value> {
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(json!({"ok": true})),
            }
        }
    }

    async fn service_with_script(responses: Vec<String>) -> WorkflowService {
        let handles = testutil::handles();
        handles
            .servers
            .register(Arc::new(ScriptedServer::new(responses)))
            .await;
        testutil::seed_all_stage_prompts(&handles).await;
        WorkflowService::new(handles)
    }

    fn stage_trace(events: &[ExecutionEvent]) -> Vec<Stage> {
        let mut trace = Vec::new();
        for event in events {
            if trace.last() != Some(&event.stage) {
                trace.push(event.stage);
            }
        }
        trace
    }

    fn model_pairs_under_execution(events: &[ExecutionEvent]) -> usize {
        events
            .iter()
            .filter(|e| {
                e.stage == Stage::Execution
                    && e.metadata.get("kind").and_then(|k| k.as_str()) == Some("model.request")
            })
            .count()
    }

    #[tokio::test]
    async fn simple_question_skips_planning_and_answers() {
        let service = service_with_script(vec!["4".to_string()]).await;
        let workflow = service
            .start("What is 2+2?", None, RequestOptions::default())
            .await
            .expect("start");
        service.run(&workflow.workflow_id).await;

        let finished = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(finished.current_state, WorkflowState::Completed);
        assert_eq!(finished.summary.as_deref(), Some("4"));

        let events = service.history(&workflow.workflow_id).await;
        let trace = stage_trace(&events);
        assert_eq!(
            trace,
            vec![
                Stage::Interpretation,
                Stage::ValidatorA,
                Stage::Routing,
                Stage::Execution,
                Stage::Reflection,
            ]
        );
        assert_eq!(model_pairs_under_execution(&events), 1);
        // exactly one terminal transition
        let terminal = events
            .iter()
            .filter(|e| {
                e.metadata.get("kind").and_then(|k| k.as_str()) == Some("workflow.transition")
                    && matches!(
                        e.metadata.get("to").and_then(|v| v.as_str()),
                        Some("COMPLETED") | Some("FAILED") | Some("CANCELLED")
                    )
            })
            .count();
        assert_eq!(terminal, 1);
    }

    #[tokio::test]
    async fn code_generation_plans_and_auto_approves_at_level_two() {
        let plan_json = json!({
            "strategy": "generate then validate",
            "steps": [
                {"id": "gen", "description": "produce fibonacci function", "type": "function_call",
                 "function_call": {
                     "name": "code_generation",
                     "parameters": {"language": "python"},
                     "validation_schema": {"type": "object", "properties": {"language": {"type": "string"}}, "required": ["language"]}
                 }},
                {"description": "validate the generated code", "type": "validation", "dependencies": ["gen"]}
            ]
        });
        let service = service_with_script(vec![
            plan_json.to_string(),
            "def fibonacci(n): ...".to_string(),
            "looks correct".to_string(),
        ])
        .await;

        let workflow = service
            .start(
                "Write a Python function that returns the Fibonacci sequence up to n",
                None,
                RequestOptions {
                    autonomy_level: Some(2),
                    ..RequestOptions::default()
                },
            )
            .await
            .expect("start");
        service.run(&workflow.workflow_id).await;

        let finished = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(finished.current_state, WorkflowState::Completed);

        let plan = service
            .plan_for_workflow(&workflow.workflow_id)
            .await
            .expect("plan");
        assert_eq!(plan.status, PlanStatus::Completed);
        assert!(plan.approved_at.is_some());
        assert!(plan
            .steps
            .iter()
            .any(|s| s.function_call.as_ref().map(|c| c.name.as_str()) == Some("code_generation")));

        let events = service.history(&workflow.workflow_id).await;
        let auto_approved = events.iter().any(|e| {
            e.metadata.get("kind").and_then(|k| k.as_str()) == Some("plan.approved")
                && e.decision_source == DecisionSource::Auto
        });
        assert!(auto_approved);
    }

    #[tokio::test]
    async fn high_risk_plan_waits_for_human_at_level_one() {
        let plan_json = json!({
            "steps": [{"description": "delete all temp files"}]
        });
        let service = service_with_script(vec![plan_json.to_string()]).await;

        let workflow = service
            .start(
                "Write a script to delete all temp files",
                None,
                RequestOptions {
                    autonomy_level: Some(1),
                    ..RequestOptions::default()
                },
            )
            .await
            .expect("start");
        service.run(&workflow.workflow_id).await;

        let pending = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(pending.current_state, WorkflowState::ApprovalPending);

        let requests = service.handles().approvals.list_pending().await;
        assert_eq!(requests.len(), 1);
        // no step has run yet
        let plan = service
            .plan_for_workflow(&workflow.workflow_id)
            .await
            .expect("plan");
        assert!(plan.steps.iter().all(|s| s.attempts == 0));

        service
            .decide_approval(&requests[0].request_id, true, "operator", None)
            .await
            .expect("decide");
        // the continuation runs on a spawned task
        for _ in 0..100 {
            let state = service
                .get(&workflow.workflow_id)
                .await
                .expect("workflow")
                .current_state;
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let finished = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(finished.current_state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn rejected_plan_fails_with_human_rejected() {
        let plan_json = json!({
            "steps": [{"description": "delete all backups"}]
        });
        let service = service_with_script(vec![plan_json.to_string()]).await;
        let workflow = service
            .start(
                "Write a script to delete all backups",
                None,
                RequestOptions {
                    autonomy_level: Some(1),
                    ..RequestOptions::default()
                },
            )
            .await
            .expect("start");
        service.run(&workflow.workflow_id).await;

        let requests = service.handles().approvals.list_pending().await;
        service
            .decide_approval(&requests[0].request_id, false, "operator", None)
            .await
            .expect("decide");

        let finished = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(finished.current_state, WorkflowState::Failed);
        assert_eq!(finished.last_reason_code.as_deref(), Some("human_rejected"));
    }

    #[tokio::test]
    async fn step_failure_replans_once_then_succeeds() {
        let handles = testutil::handles();
        handles
            .tools
            .register(Arc::new(FlakyTool {
                failed_once: AtomicBool::new(false),
            }))
            .await;
        let tool_id = handles
            .capabilities
            .register(CapabilityRecord::new("flaky", CapabilityKind::Tool))
            .await;
        let plan_json = json!({
            "steps": [{"description": "call the flaky backend", "tool_id": tool_id}]
        })
        .to_string();
        handles
            .servers
            .register(Arc::new(ScriptedServer::new(vec![
                plan_json.clone(),
                plan_json,
            ])))
            .await;
        testutil::seed_all_stage_prompts(&handles).await;
        let service = WorkflowService::new(handles);

        let workflow = service
            .start(
                "Write a program that calls the backend",
                None,
                RequestOptions::default(),
            )
            .await
            .expect("start");
        service.run(&workflow.workflow_id).await;

        let finished = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(finished.current_state, WorkflowState::Completed);

        let plan = service
            .plan_for_workflow(&workflow.workflow_id)
            .await
            .expect("plan");
        assert!(plan.parent_plan_id.is_some());
        assert_eq!(plan.attempt_count, 1);

        let events = service.history(&workflow.workflow_id).await;
        let planning_groups = stage_trace(&events)
            .into_iter()
            .filter(|s| *s == Stage::Planning)
            .count();
        assert_eq!(planning_groups, 2);
        let reflection_groups = stage_trace(&events)
            .into_iter()
            .filter(|s| *s == Stage::Reflection)
            .count();
        assert_eq!(reflection_groups, 1);
        let retrying = events.iter().any(|e| {
            e.metadata.get("to").and_then(|v| v.as_str()) == Some("RETRYING")
        });
        assert!(retrying);
    }

    #[tokio::test]
    async fn quota_denial_fails_the_workflow_with_the_resource_code() {
        let governor = aard_governor::Governor::new(aard_governor::GovernorConfig {
            limits: vec![aard_governor::QuotaLimit {
                resource: aard_governor::QuotaResource::LlmRequests,
                period: aard_governor::QuotaPeriod::PerMinute,
                limit: 1,
            }],
            max_concurrent_tasks: None,
        });
        let handles = testutil::handles_with_governor(governor);
        testutil::seed_all_stage_prompts(&handles).await;
        // consume the single request in the window
        handles
            .governor
            .record(aard_governor::QuotaResource::LlmRequests, 1)
            .await;
        let service = WorkflowService::new(handles);

        // an ambiguous request needs the interpretation model call
        let workflow = service
            .start("Summarize the weekly report", None, RequestOptions::default())
            .await
            .expect("start");
        service.run(&workflow.workflow_id).await;

        let finished = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(finished.current_state, WorkflowState::Failed);
        assert_eq!(
            finished.last_reason_code.as_deref(),
            Some("quota_exceeded_llm_requests")
        );
    }

    #[tokio::test]
    async fn cancellation_during_execution_skips_steps_and_warns() {
        let handles = testutil::handles();
        handles.tools.register(Arc::new(SlowTool)).await;
        let tool_id = handles
            .capabilities
            .register(CapabilityRecord::new("slow", CapabilityKind::Tool))
            .await;
        let plan_json = json!({
            "steps": [
                {"id": "s1", "description": "long running call", "tool_id": tool_id},
                {"description": "afterwards", "dependencies": ["s1"]}
            ]
        })
        .to_string();
        handles
            .servers
            .register(Arc::new(ScriptedServer::new(vec![plan_json])))
            .await;
        testutil::seed_all_stage_prompts(&handles).await;
        let service = WorkflowService::new(handles);

        let workflow = service
            .start(
                "Write a job that waits on the backend",
                None,
                RequestOptions::default(),
            )
            .await
            .expect("start");
        let runner = {
            let service = service.clone();
            let workflow_id = workflow.workflow_id.clone();
            tokio::spawn(async move {
                service.run(&workflow_id).await;
            })
        };

        // wait until execution is underway, then cancel
        for _ in 0..200 {
            let state = service
                .get(&workflow.workflow_id)
                .await
                .expect("workflow")
                .current_state;
            if state == WorkflowState::Executing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.cancel(&workflow.workflow_id).await.expect("cancel");
        runner.await.expect("runner");

        let finished = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(finished.current_state, WorkflowState::Cancelled);

        let plan = service
            .plan_for_workflow(&workflow.workflow_id)
            .await
            .expect("plan");
        assert!(plan
            .steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Skipped | StepStatus::Failed)));

        let events = service.history(&workflow.workflow_id).await;
        let cancelled_event = events.iter().any(|e| {
            e.status == EventStatus::Warn && e.reason_code.as_deref() == Some("cancelled")
        });
        assert!(cancelled_event);
    }

    #[tokio::test]
    async fn disallowed_transition_leaves_state_unchanged_with_error_event() {
        let service = service_with_script(Vec::new()).await;
        let workflow = service
            .start("What is 2+2?", None, RequestOptions::default())
            .await
            .expect("start");
        let ctx = service.context_for(&workflow).await;

        let err = service
            .advance(
                &ctx,
                WorkflowState::Executing,
                None,
                DecisionSource::Rule,
                None,
                false,
            )
            .await
            .expect_err("invalid transition");
        assert!(matches!(err, ErrorKind::InvalidTransition { .. }));

        let unchanged = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(unchanged.current_state, WorkflowState::Initialized);

        let events = service.history(&workflow.workflow_id).await;
        assert!(events.iter().any(|e| {
            e.reason_code.as_deref() == Some("invalid_transition")
                && e.status == EventStatus::Error
        }));
    }

    #[tokio::test]
    async fn oversized_plan_fails_before_approval() {
        let steps = (0..30)
            .map(|i| json!({"description": format!("step {i}")}))
            .collect::<Vec<_>>();
        let plan_json = json!({"steps": steps}).to_string();
        let service = service_with_script(vec![plan_json]).await;

        let workflow = service
            .start(
                "Write a program with many stages",
                None,
                RequestOptions::default(),
            )
            .await
            .expect("start");
        service.run(&workflow.workflow_id).await;

        let finished = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(finished.current_state, WorkflowState::Failed);
        assert_eq!(
            finished.last_reason_code.as_deref(),
            Some("validation_failed")
        );
        // never approved, never executed
        let plan = service.plan_for_workflow(&workflow.workflow_id).await;
        assert!(plan.is_none() || plan.expect("plan").approved_at.is_none());
    }

    #[tokio::test]
    async fn approval_timeout_sweep_fails_the_workflow() {
        let plan_json = json!({
            "steps": [{"description": "delete all archives"}]
        });
        let service = service_with_script(vec![plan_json.to_string()]).await;
        service
            .handles()
            .config
            .patch_runtime(json!({"approval": {"timeout_s": 0}}))
            .await;

        let workflow = service
            .start(
                "Write a script to delete all archives",
                None,
                RequestOptions {
                    autonomy_level: Some(1),
                    ..RequestOptions::default()
                },
            )
            .await
            .expect("start");
        service.run(&workflow.workflow_id).await;
        assert_eq!(
            service
                .get(&workflow.workflow_id)
                .await
                .expect("workflow")
                .current_state,
            WorkflowState::ApprovalPending
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;
        service.sweep_approvals().await;

        let finished = service.get(&workflow.workflow_id).await.expect("workflow");
        assert_eq!(finished.current_state, WorkflowState::Failed);
        assert_eq!(
            finished.last_reason_code.as_deref(),
            Some("approval_timeout")
        );
    }
}
