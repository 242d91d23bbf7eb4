use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use aard_governor::Governor;
use aard_journal::EventJournal;
use aard_prompts::{AssignmentScope, PromptAssignment, PromptRegistry};
use aard_providers::{ServerRegistry, ServersConfig};
use aard_registry::CapabilityRegistry;
use aard_types::Stage;

use crate::{
    ApprovalGate, BiasStore, CheckpointStore, ConfigStore, CoreConfig, CoreHandles,
    InMemoryMemoryStore, RequestOptions, RuntimeContext, ToolRouter,
};

pub(crate) fn handles() -> CoreHandles {
    handles_with_governor(Governor::unlimited())
}

pub(crate) fn handles_with_governor(governor: Governor) -> CoreHandles {
    CoreHandles {
        journal: EventJournal::new(),
        prompts: PromptRegistry::new(),
        capabilities: CapabilityRegistry::new(),
        servers: ServerRegistry::new(ServersConfig::default()),
        governor,
        config: ConfigStore::ephemeral(),
        checkpoints: CheckpointStore::new(),
        memory: Arc::new(InMemoryMemoryStore::new()),
        tools: ToolRouter::new(),
        approvals: ApprovalGate::new(),
        biases: BiasStore::new(),
    }
}

pub(crate) fn context(handles: CoreHandles) -> RuntimeContext {
    context_with(handles, CoreConfig::default(), RequestOptions::default())
}

pub(crate) fn context_with(
    handles: CoreHandles,
    core: CoreConfig,
    options: RequestOptions,
) -> RuntimeContext {
    RuntimeContext::new(
        "wf-test",
        "session-test",
        options,
        core,
        CancellationToken::new(),
        handles,
    )
}

/// Registers an active global prompt for (stage, role).
pub(crate) async fn seed_prompt(handles: &CoreHandles, stage: Stage, role: &str, body: &str) {
    let prompt = handles
        .prompts
        .create_prompt(format!("{}-{role}", stage.as_str()), stage, role, body)
        .await;
    handles
        .prompts
        .activate(&prompt.prompt_id)
        .await
        .expect("activate");
    handles
        .prompts
        .assign(PromptAssignment::new(
            AssignmentScope::Global,
            stage,
            role,
            prompt.prompt_id,
        ))
        .await;
}

/// Seeds every stage role the pipeline resolves during a full run.
pub(crate) async fn seed_all_stage_prompts(handles: &CoreHandles) {
    for (stage, role) in [
        (Stage::Interpretation, "interpretation"),
        (Stage::Routing, "routing"),
        (Stage::Planning, "planning"),
        (Stage::Execution, "execution"),
        (Stage::Reflection, "reflection"),
    ] {
        seed_prompt(handles, stage, role, &format!("You handle {role}.")).await;
    }
}
