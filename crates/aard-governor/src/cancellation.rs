use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// One cancellation token per workflow. Cancellation is cooperative:
/// suspension points race against the token and unwind at the next I/O
/// boundary.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, workflow_id: &str) -> CancellationToken {
        let mut tokens = self.tokens.write().await;
        let token = tokens
            .entry(workflow_id.to_string())
            .or_insert_with(CancellationToken::new);
        token.clone()
    }

    pub async fn get(&self, workflow_id: &str) -> Option<CancellationToken> {
        self.tokens.read().await.get(workflow_id).cloned()
    }

    pub async fn cancel(&self, workflow_id: &str) -> bool {
        let tokens = self.tokens.read().await;
        let Some(token) = tokens.get(workflow_id) else {
            return false;
        };
        token.cancel();
        true
    }

    pub async fn remove(&self, workflow_id: &str) {
        self.tokens.write().await.remove(workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_idempotent_per_workflow() {
        let registry = CancellationRegistry::new();
        let first = registry.create("wf-1").await;
        let second = registry.create("wf-1").await;
        first.cancel();
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_reaches_held_tokens() {
        let registry = CancellationRegistry::new();
        let token = registry.create("wf-1").await;
        assert!(registry.cancel("wf-1").await);
        assert!(token.is_cancelled());
        assert!(!registry.cancel("wf-unknown").await);
    }
}
