use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use aard_types::{Checkpoint, ErrorKind};

pub fn state_hash(snapshot: &Value) -> String {
    let canonical = snapshot.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Per-entity snapshot store. Checkpoints are immutable; the latest per
/// entity is the rollback target and is re-verified against its hash
/// before the snapshot is handed back.
#[derive(Clone, Default)]
pub struct CheckpointStore {
    inner: Arc<RwLock<HashMap<(String, String), Vec<Checkpoint>>>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        entity_type: &str,
        entity_id: &str,
        snapshot: Value,
        reason: &str,
    ) -> Checkpoint {
        let hash = state_hash(&snapshot);
        let checkpoint = Checkpoint::new(entity_type, entity_id, snapshot, hash, reason);
        self.inner
            .write()
            .await
            .entry((entity_type.to_string(), entity_id.to_string()))
            .or_default()
            .push(checkpoint.clone());
        checkpoint
    }

    pub async fn latest(&self, entity_type: &str, entity_id: &str) -> Option<Checkpoint> {
        self.inner
            .read()
            .await
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .and_then(|list| list.last())
            .cloned()
    }

    pub async fn count(&self, entity_type: &str, entity_id: &str) -> usize {
        self.inner
            .read()
            .await
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Restores from the latest checkpoint. The snapshot is hashed again on
    /// the way out; a mismatch means the stored state was tampered with or
    /// decayed, which is unrecoverable.
    pub async fn rollback(&self, entity_type: &str, entity_id: &str) -> Result<Value, ErrorKind> {
        let Some(checkpoint) = self.latest(entity_type, entity_id).await else {
            return Err(ErrorKind::CheckpointCorrupt(format!(
                "no checkpoint for {entity_type}/{entity_id}"
            )));
        };
        let recomputed = state_hash(&checkpoint.state_snapshot);
        if recomputed != checkpoint.state_hash {
            return Err(ErrorKind::CheckpointCorrupt(format!(
                "hash mismatch for {entity_type}/{entity_id}"
            )));
        }
        Ok(checkpoint.state_snapshot)
    }
}
