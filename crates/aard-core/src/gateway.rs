use std::time::{Duration, Instant};

use serde_json::json;
use sha2::{Digest, Sha256};

use aard_governor::{bounded, Bounded, QuotaResource};
use aard_prompts::ResolutionKey;
use aard_providers::{CompletionRequest, GenerationParams, TokenUsage};
use aard_types::{DecisionSource, ErrorKind, EventStatus, ExecutionEvent, Stage};

use crate::RuntimeContext;

const RETRY_BACKOFF_BASE_MS: u64 = 100;

/// Short stable digest of the generation parameters, recorded on
/// `model.request` events so identical calls are correlatable.
fn digest_params(params: &GenerationParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(params).unwrap_or_default().as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(16);
    hex
}

/// Exemption keys that allow a model call without a resolved prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptExemption {
    Legacy,
    TestMock,
}

impl PromptExemption {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptExemption::Legacy => "legacy",
            PromptExemption::TestMock => "test_mock",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelCall {
    pub stage: Stage,
    pub component_role: String,
    pub user_payload: String,
    pub agent_id: Option<String>,
    pub model_ref: Option<String>,
    pub server_ref: Option<String>,
    pub system_prompt_override: Option<String>,
    pub exemption: Option<PromptExemption>,
    pub params: Option<GenerationParams>,
    pub parent_event_id: Option<String>,
}

impl ModelCall {
    pub fn new(stage: Stage, component_role: impl Into<String>, user_payload: impl Into<String>) -> Self {
        Self {
            stage,
            component_role: component_role.into(),
            user_payload: user_payload.into(),
            agent_id: None,
            model_ref: None,
            server_ref: None,
            system_prompt_override: None,
            exemption: None,
            params: None,
            parent_event_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelOutcome {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub latency_ms: u64,
    pub prompt_id: Option<String>,
    pub prompt_version: Option<u32>,
    pub request_event_id: String,
}

/// Single choke point for model calls: prompt presence, quota admission,
/// timeout, retry, and the request/response event pair all live here.
pub struct ModelGateway;

impl ModelGateway {
    pub async fn invoke(
        ctx: &RuntimeContext,
        call: ModelCall,
    ) -> Result<ModelOutcome, ErrorKind> {
        let model_ref = call
            .model_ref
            .clone()
            .or_else(|| ctx.options.model_ref.clone());
        let server_ref = call
            .server_ref
            .clone()
            .or_else(|| ctx.options.server_ref.clone());

        // Resolution order: explicit override, registry (which includes the
        // disk-fallback scope), then an explicit exemption. No prompt and no
        // exemption refuses the call.
        let mut prompt_id = None;
        let mut prompt_version = None;
        let system = if let Some(override_body) = &call.system_prompt_override {
            Some(override_body.clone())
        } else {
            let key = ResolutionKey {
                stage: Some(call.stage),
                component_role: call.component_role.clone(),
                agent_id: call.agent_id.clone(),
                model_id: model_ref.clone(),
                server_id: server_ref.clone(),
                task_type: ctx.options.task_type.clone(),
            };
            match ctx.handles.prompts.get_active(&key).await {
                Ok(resolved) => {
                    prompt_id = Some(resolved.prompt_id.clone());
                    prompt_version = Some(resolved.version);
                    Some(resolved.body)
                }
                Err(err) => {
                    if call.exemption.is_none() {
                        Self::emit_refusal(ctx, &call, &err).await;
                        return Err(err);
                    }
                    None
                }
            }
        };

        let params = call.params.clone().unwrap_or(GenerationParams {
            max_tokens: ctx.core.llm.max_tokens,
            temperature: ctx.core.llm.temperature,
            top_p: ctx.core.llm.top_p,
            num_ctx: ctx.core.llm.ctx_size,
        });

        if let Err(err) = ctx.handles.governor.admit(QuotaResource::LlmRequests, 1).await {
            Self::emit_refusal(ctx, &call, &err).await;
            return Err(err);
        }
        if let Err(err) = ctx
            .handles
            .governor
            .admit(QuotaResource::LlmTokens, params.max_tokens as u64)
            .await
        {
            Self::emit_refusal(ctx, &call, &err).await;
            return Err(err);
        }

        let params_digest = digest_params(&params);
        let mut request_event = ExecutionEvent::new(
            &ctx.workflow_id,
            &ctx.session_id,
            call.stage,
            &call.component_role,
            "model_gateway",
            DecisionSource::Prompt,
        )
        .with_summaries(&call.user_payload, "")
        .with_metadata(json!({
            "kind": "model.request",
            "params_digest": params_digest,
            "model_ref": model_ref,
            "server_ref": server_ref,
            "exemption": call.exemption.map(|e| e.as_str()),
        }));
        if let (Some(id), Some(version)) = (&prompt_id, prompt_version) {
            request_event = request_event.with_prompt(id.clone(), version);
        }
        if let Some(parent) = &call.parent_event_id {
            request_event.parent_event_id = Some(parent.clone());
        }
        let request_event = ctx.emit(request_event).await;

        let server = match ctx
            .handles
            .servers
            .select(server_ref.as_deref(), model_ref.as_deref())
            .await
        {
            Ok(server) => server,
            Err(error) => {
                let err = ErrorKind::ModelUnavailable(error.to_string());
                Self::emit_response(ctx, &call, &request_event.event_id, Err(&err), 0, &None).await;
                return Err(err);
            }
        };

        let request = CompletionRequest {
            system,
            user: call.user_payload.clone(),
            model: model_ref.clone(),
            params,
        };
        let timeout = Duration::from_secs(ctx.core.llm.timeout_s);
        let started = Instant::now();
        let mut last_error = String::new();

        for attempt in 0..=ctx.core.llm.max_retries {
            match bounded(timeout, &ctx.cancel, server.complete(&request)).await {
                Bounded::Cancelled => {
                    let err = ErrorKind::Cancelled;
                    Self::emit_response(
                        ctx,
                        &call,
                        &request_event.event_id,
                        Err(&err),
                        started.elapsed().as_millis() as u64,
                        &None,
                    )
                    .await;
                    return Err(err);
                }
                Bounded::TimedOut => {
                    let err = ErrorKind::ModelTimeout;
                    Self::emit_response(
                        ctx,
                        &call,
                        &request_event.event_id,
                        Err(&err),
                        started.elapsed().as_millis() as u64,
                        &None,
                    )
                    .await;
                    if let Some(id) = &prompt_id {
                        ctx.handles
                            .prompts
                            .record_usage(id, false, started.elapsed().as_millis() as u64)
                            .await;
                    }
                    return Err(err);
                }
                Bounded::Completed(Ok(response)) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    Self::emit_response(
                        ctx,
                        &call,
                        &request_event.event_id,
                        Ok(&response.text),
                        latency_ms,
                        &response.usage,
                    )
                    .await;
                    if let Some(id) = &prompt_id {
                        ctx.handles.prompts.record_usage(id, true, latency_ms).await;
                    }
                    return Ok(ModelOutcome {
                        text: response.text,
                        usage: response.usage,
                        latency_ms,
                        prompt_id,
                        prompt_version,
                        request_event_id: request_event.event_id,
                    });
                }
                Bounded::Completed(Err(error)) => {
                    last_error = error.to_string();
                    if attempt < ctx.core.llm.max_retries {
                        let backoff =
                            Duration::from_millis(RETRY_BACKOFF_BASE_MS << attempt.min(6));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        let err = ErrorKind::ModelUnavailable(last_error);
        Self::emit_response(
            ctx,
            &call,
            &request_event.event_id,
            Err(&err),
            started.elapsed().as_millis() as u64,
            &None,
        )
        .await;
        if let Some(id) = &prompt_id {
            ctx.handles
                .prompts
                .record_usage(id, false, started.elapsed().as_millis() as u64)
                .await;
        }
        Err(err)
    }

    async fn emit_refusal(ctx: &RuntimeContext, call: &ModelCall, err: &ErrorKind) {
        ctx.emit(
            ExecutionEvent::new(
                &ctx.workflow_id,
                &ctx.session_id,
                call.stage,
                &call.component_role,
                "model_gateway",
                DecisionSource::Rule,
            )
            .with_status(EventStatus::Error)
            .with_summaries(&call.user_payload, err.to_string())
            .with_reason(err.reason_code())
            .with_metadata(json!({"kind": "model.refused"})),
        )
        .await;
    }

    async fn emit_response(
        ctx: &RuntimeContext,
        call: &ModelCall,
        request_event_id: &str,
        result: Result<&str, &ErrorKind>,
        latency_ms: u64,
        usage: &Option<TokenUsage>,
    ) -> ExecutionEvent {
        let mut event = ExecutionEvent::new(
            &ctx.workflow_id,
            &ctx.session_id,
            call.stage,
            &call.component_role,
            "model_gateway",
            DecisionSource::Prompt,
        );
        event.parent_event_id = Some(request_event_id.to_string());
        let event = match result {
            Ok(text) => event.with_summaries(&call.user_payload, text).with_metadata(json!({
                "kind": "model.response",
                "latency_ms": latency_ms,
                "usage": usage,
            })),
            Err(err) => event
                .with_status(EventStatus::Error)
                .with_summaries(&call.user_payload, err.to_string())
                .with_reason(err.reason_code())
                .with_metadata(json!({
                    "kind": "model.response",
                    "latency_ms": latency_ms,
                })),
        };
        ctx.emit(event).await
    }
}
