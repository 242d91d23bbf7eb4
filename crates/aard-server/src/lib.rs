use aard_core::WorkflowService;

mod http;

pub use http::{router, serve};

/// Clone-of-handles application state shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub service: WorkflowService,
}

impl AppState {
    pub fn new(service: WorkflowService) -> Self {
        Self { service }
    }
}

pub fn build_id() -> String {
    if let Some(explicit) = option_env!("AARD_BUILD_ID") {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    env!("CARGO_PKG_VERSION").to_string()
}
