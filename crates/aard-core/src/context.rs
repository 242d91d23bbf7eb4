use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Level;

use aard_governor::Governor;
use aard_journal::EventJournal;
use aard_observability::{emit_event, summarize, ObservabilityEvent, ProcessKind};
use aard_prompts::PromptRegistry;
use aard_providers::ServerRegistry;
use aard_registry::CapabilityRegistry;
use aard_types::{EventStatus, ExecutionEvent};

use crate::{
    ApprovalGate, BiasStore, CheckpointStore, ConfigStore, CoreConfig, MemoryStore, ToolRouter,
};

pub const SUMMARY_MAX_LEN: usize = 240;

/// Process-wide service handles. Components borrow these through the
/// context for at most one workflow; nothing holds a service beyond that.
#[derive(Clone)]
pub struct CoreHandles {
    pub journal: EventJournal,
    pub prompts: PromptRegistry,
    pub capabilities: CapabilityRegistry,
    pub servers: ServerRegistry,
    pub governor: Governor,
    pub config: ConfigStore,
    pub checkpoints: CheckpointStore,
    pub memory: Arc<dyn MemoryStore>,
    pub tools: ToolRouter,
    pub approvals: ApprovalGate,
    pub biases: BiasStore,
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub autonomy_level: Option<u8>,
    pub model_ref: Option<String>,
    pub server_ref: Option<String>,
    pub task_type: Option<String>,
}

/// Per-workflow context threaded through every suspension point. Cheap to
/// clone; cancellation and pause are shared flags.
#[derive(Clone)]
pub struct RuntimeContext {
    pub workflow_id: String,
    pub session_id: String,
    pub options: RequestOptions,
    pub core: CoreConfig,
    pub cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    pub handles: CoreHandles,
}

impl RuntimeContext {
    pub fn new(
        workflow_id: impl Into<String>,
        session_id: impl Into<String>,
        options: RequestOptions,
        core: CoreConfig,
        cancel: CancellationToken,
        handles: CoreHandles,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            session_id: session_id.into(),
            options,
            core,
            cancel,
            paused: Arc::new(AtomicBool::new(false)),
            handles,
        }
    }

    /// Shares an externally-owned pause flag (the workflow service holds
    /// the other end).
    pub fn with_pause_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.paused = flag;
        self
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Appends to the journal and mirrors the record to the tracing layer.
    /// Summaries are bounded before they leave the process.
    pub async fn emit(&self, mut event: ExecutionEvent) -> ExecutionEvent {
        event.input_summary = summarize(&event.input_summary, SUMMARY_MAX_LEN);
        event.output_summary = summarize(&event.output_summary, SUMMARY_MAX_LEN);

        let level = match event.status {
            EventStatus::Ok => Level::INFO,
            EventStatus::Warn => Level::WARN,
            EventStatus::Error => Level::ERROR,
        };
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: &event.component_role,
                component: &event.component_name,
                workflow_id: Some(&event.workflow_id),
                session_id: Some(&event.session_id),
                stage: Some(event.stage.as_str()),
                prompt_id: event.prompt_id.as_deref(),
                status: Some(match event.status {
                    EventStatus::Ok => "ok",
                    EventStatus::Warn => "warn",
                    EventStatus::Error => "error",
                }),
                reason_code: event.reason_code.as_deref(),
                detail: Some(&event.output_summary),
            },
        );

        match self.handles.journal.append(event.clone()).await {
            Ok(stored) => stored,
            Err(error) => {
                tracing::error!(target: "aard.core", %error, "journal append failed");
                event
            }
        }
    }
}
