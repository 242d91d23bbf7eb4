use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use aard_types::{
    CapabilityHealth, CapabilityKind, CapabilityRecord, CapabilityStatus, ErrorKind,
};

const TRUST_EMA_ALPHA: f64 = 0.1;
const DEGRADED_AFTER_FAILURES: u32 = 3;
const UNHEALTHY_AFTER_FAILURES: u32 = 5;

#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
    pub kind: Option<CapabilityKind>,
    pub status: Option<CapabilityStatus>,
    pub capability: Option<String>,
}

impl CapabilityFilter {
    pub fn of_kind(kind: CapabilityKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    fn matches(&self, record: &CapabilityRecord) -> bool {
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(tag) = &self.capability {
            if !record.capabilities.iter().any(|c| c == tag) {
                return false;
            }
        }
        true
    }
}

/// Authoritative listing of agents, tools, and models available at dispatch
/// time. Process-wide; writes are serialized per handle.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    records: Arc<RwLock<Vec<CapabilityRecord>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, record: CapabilityRecord) -> String {
        let id = record.id.clone();
        let mut records = self.records.write().await;
        if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
        } else {
            records.push(record);
        }
        id
    }

    pub async fn deactivate(&self, id: &str) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        record.status = CapabilityStatus::Paused;
        true
    }

    pub async fn get(&self, id: &str) -> Option<CapabilityRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub async fn get_by_name(&self, kind: CapabilityKind, name: &str) -> Option<CapabilityRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.kind == kind && r.name == name)
            .cloned()
    }

    pub async fn list(&self, filter: &CapabilityFilter) -> Vec<CapabilityRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// A capability is dispatchable when it is active and not unhealthy,
    /// unless the record is explicitly pinned.
    pub async fn dispatchable(&self, id: &str) -> Result<CapabilityRecord, ErrorKind> {
        let Some(record) = self.get(id).await else {
            return Err(ErrorKind::DependencyNotReady(format!(
                "capability `{id}` is not registered"
            )));
        };
        if record.status != CapabilityStatus::Active {
            return Err(ErrorKind::DependencyNotReady(format!(
                "capability `{}` is not active",
                record.name
            )));
        }
        if record.health == CapabilityHealth::Unhealthy && !record.pinned {
            return Err(ErrorKind::DependencyNotReady(format!(
                "capability `{}` is unhealthy",
                record.name
            )));
        }
        Ok(record)
    }

    /// Tool access rule: `forbidden_agents` wins over `allowed_agents`; an
    /// empty allow list means open access.
    pub async fn can_use(&self, agent_id: &str, tool_id: &str) -> Result<(), ErrorKind> {
        let Some(tool) = self.get(tool_id).await else {
            return Err(ErrorKind::DependencyNotReady(format!(
                "tool `{tool_id}` is not registered"
            )));
        };
        let denied = ErrorKind::ToolDenied {
            agent: agent_id.to_string(),
            tool: tool.name.clone(),
        };
        if tool.forbidden_agents.iter().any(|a| a == agent_id) {
            return Err(denied);
        }
        if !tool.allowed_agents.is_empty() && !tool.allowed_agents.iter().any(|a| a == agent_id) {
            return Err(denied);
        }
        Ok(())
    }

    /// Execution feedback: updates metrics, the trust EMA, and downgrades
    /// health after consecutive failures.
    pub async fn record_execution(&self, id: &str, success: bool, latency_ms: u64) {
        let mut records = self.records.write().await;
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return;
        };
        let metrics = &mut record.metrics;
        metrics.executions += 1;
        if success {
            metrics.successes += 1;
            metrics.consecutive_failures = 0;
        } else {
            metrics.failures += 1;
            metrics.consecutive_failures += 1;
        }
        let n = metrics.executions as f64;
        metrics.avg_latency_ms = (metrics.avg_latency_ms * (n - 1.0) + latency_ms as f64) / n;
        metrics.last_used_at = Some(Utc::now());

        let outcome = if success { 1.0 } else { 0.0 };
        record.trust_score =
            (record.trust_score * (1.0 - TRUST_EMA_ALPHA) + outcome * TRUST_EMA_ALPHA).clamp(0.0, 1.0);

        record.health = if metrics.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
            CapabilityHealth::Unhealthy
        } else if metrics.consecutive_failures >= DEGRADED_AFTER_FAILURES {
            CapabilityHealth::Degraded
        } else {
            CapabilityHealth::Healthy
        };

        if record.health != CapabilityHealth::Healthy {
            tracing::warn!(
                target: "aard.registry",
                capability = %record.name,
                consecutive_failures = metrics.consecutive_failures,
                "capability health downgraded"
            );
        }
    }

    pub async fn mark_health(&self, id: &str, health: CapabilityHealth) {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            record.health = health;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> CapabilityRecord {
        CapabilityRecord::new(name, CapabilityKind::Tool)
    }

    #[tokio::test]
    async fn register_and_filter_by_kind() {
        let registry = CapabilityRegistry::new();
        registry.register(tool("web_search")).await;
        registry
            .register(CapabilityRecord::new("coder", CapabilityKind::Agent))
            .await;

        let tools = registry
            .list(&CapabilityFilter::of_kind(CapabilityKind::Tool))
            .await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "web_search");
    }

    #[tokio::test]
    async fn forbidden_wins_over_allowed() {
        let registry = CapabilityRegistry::new();
        let mut record = tool("python_sandbox");
        record.allowed_agents = vec!["coder".to_string()];
        record.forbidden_agents = vec!["coder".to_string()];
        let id = registry.register(record).await;

        assert!(matches!(
            registry.can_use("coder", &id).await,
            Err(ErrorKind::ToolDenied { .. })
        ));
    }

    #[tokio::test]
    async fn empty_allow_list_means_open_access() {
        let registry = CapabilityRegistry::new();
        let id = registry.register(tool("web_search")).await;
        assert!(registry.can_use("anyone", &id).await.is_ok());
    }

    #[tokio::test]
    async fn allow_list_restricts_access() {
        let registry = CapabilityRegistry::new();
        let mut record = tool("deploy");
        record.allowed_agents = vec!["ops".to_string()];
        let id = registry.register(record).await;
        assert!(registry.can_use("ops", &id).await.is_ok());
        assert!(registry.can_use("coder", &id).await.is_err());
    }

    #[tokio::test]
    async fn consecutive_failures_downgrade_health() {
        let registry = CapabilityRegistry::new();
        let id = registry.register(tool("flaky")).await;
        for _ in 0..DEGRADED_AFTER_FAILURES {
            registry.record_execution(&id, false, 50).await;
        }
        assert_eq!(
            registry.get(&id).await.expect("record").health,
            CapabilityHealth::Degraded
        );
        for _ in 0..(UNHEALTHY_AFTER_FAILURES - DEGRADED_AFTER_FAILURES) {
            registry.record_execution(&id, false, 50).await;
        }
        assert_eq!(
            registry.get(&id).await.expect("record").health,
            CapabilityHealth::Unhealthy
        );
        assert!(registry.dispatchable(&id).await.is_err());

        registry.record_execution(&id, true, 50).await;
        assert_eq!(
            registry.get(&id).await.expect("record").health,
            CapabilityHealth::Healthy
        );
    }

    #[tokio::test]
    async fn pinned_capability_dispatches_while_unhealthy() {
        let registry = CapabilityRegistry::new();
        let mut record = tool("pinned");
        record.pinned = true;
        let id = registry.register(record).await;
        for _ in 0..UNHEALTHY_AFTER_FAILURES {
            registry.record_execution(&id, false, 50).await;
        }
        assert!(registry.dispatchable(&id).await.is_ok());
    }

    #[tokio::test]
    async fn paused_capability_is_not_dispatchable() {
        let registry = CapabilityRegistry::new();
        let id = registry.register(tool("old")).await;
        registry.deactivate(&id).await;
        assert!(registry.dispatchable(&id).await.is_err());
    }

    #[tokio::test]
    async fn trust_moves_with_outcomes() {
        let registry = CapabilityRegistry::new();
        let id = registry.register(tool("steady")).await;
        let before = registry.get(&id).await.expect("record").trust_score;
        for _ in 0..10 {
            registry.record_execution(&id, true, 10).await;
        }
        let after = registry.get(&id).await.expect("record").trust_score;
        assert!(after > before);
    }
}
