use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use aard_core::{
    ApprovalGate, BiasStore, CheckpointStore, ConfigStore, CoreHandles, InMemoryMemoryStore,
    ToolRouter, WorkflowService,
};
use aard_governor::Governor;
use aard_journal::EventJournal;
use aard_observability::{init_logging, LogSettings, ProcessKind};
use aard_prompts::PromptRegistry;
use aard_providers::ServerRegistry;
use aard_registry::CapabilityRegistry;
use aard_server::{serve, AppState};

const APPROVAL_SWEEP_INTERVAL_S: u64 = 15;

#[derive(Parser, Debug)]
#[command(name = "aard-engine")]
#[command(about = "Headless AARD orchestration backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long, env = "AARD_STATE_DIR")]
        state_dir: Option<String>,
    },
    Run {
        text: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _log_guard =
                init_logging(ProcessKind::Engine, &LogSettings::for_state_dir(&state_dir))?;
            let state = build_state(&state_dir).await?;
            spawn_approval_sweeper(state.service.clone());
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);
            serve(addr, state).await?;
        }
        Command::Run { text } => {
            let state_dir = resolve_state_dir(None);
            let state = build_state(&state_dir).await?;
            let workflow = state
                .service
                .start(&text, None, Default::default())
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            state.service.run(&workflow.workflow_id).await;
            let finished = state
                .service
                .get(&workflow.workflow_id)
                .await
                .context("workflow vanished")?;
            println!(
                "{} ({})",
                finished.summary.unwrap_or_else(|| "no output".to_string()),
                finished.current_state.as_str()
            );
            state.service.handles().journal.shutdown().await?;
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("AARD_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|d| d.join("aard"))
        .unwrap_or_else(|| PathBuf::from(".aard"))
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let config_path = state_dir.join("config.json");
    info!("starting aard-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={} config_path={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        config_path.display()
    );
}

async fn build_state(state_dir: &PathBuf) -> anyhow::Result<AppState> {
    let config = ConfigStore::new(state_dir.join("config.json")).await?;
    let core = config.core().await;

    let journal = EventJournal::with_sink(state_dir.join("journal").join("events.jsonl")).await?;
    let prompts = PromptRegistry::new();
    let loaded = prompts.load_disk_fallbacks(state_dir.join("prompts")).await?;
    info!("loaded {loaded} disk-fallback prompt(s)");

    let handles = CoreHandles {
        journal,
        prompts,
        capabilities: CapabilityRegistry::new(),
        servers: ServerRegistry::new(core.servers_config()),
        governor: Governor::new(core.governor_config()),
        config,
        checkpoints: CheckpointStore::new(),
        memory: Arc::new(InMemoryMemoryStore::new()),
        tools: ToolRouter::new(),
        approvals: ApprovalGate::new(),
        biases: BiasStore::new(),
    };

    Ok(AppState::new(WorkflowService::new(handles)))
}

fn spawn_approval_sweeper(service: WorkflowService) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(APPROVAL_SWEEP_INTERVAL_S));
        loop {
            ticker.tick().await;
            service.sweep_approvals().await;
        }
    });
}
