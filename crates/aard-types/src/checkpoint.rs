use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable snapshot of an entity. The latest checkpoint per entity is the
/// rollback target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub state_snapshot: Value,
    pub state_hash: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        state_snapshot: Value,
        state_hash: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            state_snapshot,
            state_hash: state_hash.into(),
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}
