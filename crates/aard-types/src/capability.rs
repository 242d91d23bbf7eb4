use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Agent,
    Tool,
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Active,
    Paused,
    Deprecated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapabilityMetrics {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// One registry entry for an agent, tool, or model available at dispatch
/// time. `server_id` is set for model entries only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub id: String,
    pub name: String,
    pub kind: CapabilityKind,
    pub status: CapabilityStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub allowed_agents: Vec<String>,
    #[serde(default)]
    pub forbidden_agents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub health: CapabilityHealth,
    pub trust_score: f64,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub metrics: CapabilityMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl CapabilityRecord {
    pub fn new(name: impl Into<String>, kind: CapabilityKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            status: CapabilityStatus::Active,
            capabilities: Vec::new(),
            allowed_agents: Vec::new(),
            forbidden_agents: Vec::new(),
            server_id: None,
            health: CapabilityHealth::Healthy,
            trust_score: 0.5,
            pinned: false,
            metrics: CapabilityMetrics::default(),
            metadata: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_active_and_healthy() {
        let record = CapabilityRecord::new("web_search", CapabilityKind::Tool);
        assert_eq!(record.status, CapabilityStatus::Active);
        assert_eq!(record.health, CapabilityHealth::Healthy);
        assert!(record.trust_score > 0.0 && record.trust_score < 1.0);
    }
}
