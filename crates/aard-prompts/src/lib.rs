use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use aard_types::{ErrorKind, Stage};

const SUCCESS_RATE_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Draft,
    Testing,
    Active,
    Deprecated,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptMetrics {
    pub usage_count: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub prompt_id: String,
    pub name: String,
    pub version: u32,
    pub stage: Stage,
    pub component_role: String,
    pub status: PromptStatus,
    pub body: String,
    #[serde(default)]
    pub metrics: PromptMetrics,
    pub created_at: DateTime<Utc>,
}

/// Assignment scopes in resolution-priority order: an experiment binding
/// beats an agent binding beats the global default beats the disk fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentScope {
    Experiment,
    Agent,
    Global,
    DiskFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptAssignment {
    pub assignment_id: String,
    pub scope: AssignmentScope,
    pub stage: Stage,
    pub component_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    pub prompt_id: String,
    #[serde(default)]
    pub priority: i32,
}

impl PromptAssignment {
    pub fn new(scope: AssignmentScope, stage: Stage, component_role: impl Into<String>, prompt_id: impl Into<String>) -> Self {
        Self {
            assignment_id: uuid::Uuid::new_v4().to_string(),
            scope,
            stage,
            component_role: component_role.into(),
            agent_id: None,
            model_id: None,
            server_id: None,
            task_type: None,
            prompt_id: prompt_id.into(),
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionKey {
    pub stage: Option<Stage>,
    pub component_role: String,
    pub agent_id: Option<String>,
    pub model_id: Option<String>,
    pub server_id: Option<String>,
    pub task_type: Option<String>,
}

impl ResolutionKey {
    pub fn new(stage: Stage, component_role: impl Into<String>) -> Self {
        Self {
            stage: Some(stage),
            component_role: component_role.into(),
            ..Self::default()
        }
    }

    fn describe(&self) -> String {
        format!(
            "stage={} role={}",
            self.stage.map(|s| s.as_str()).unwrap_or("*"),
            self.component_role
        )
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPrompt {
    pub prompt_id: String,
    pub name: String,
    pub version: u32,
    pub body: String,
    pub scope: AssignmentScope,
}

#[derive(Default)]
struct RegistryInner {
    prompts: Vec<Prompt>,
    assignments: Vec<PromptAssignment>,
}

/// Process-wide versioned prompt store. Writes are serialized per handle;
/// the active pointer for a name flips atomically under the write lock so
/// readers never observe two active versions.
#[derive(Clone)]
pub struct PromptRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    activation_threshold: f64,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            activation_threshold: 0.5,
        }
    }

    pub fn with_activation_threshold(mut self, threshold: f64) -> Self {
        self.activation_threshold = threshold;
        self
    }

    pub async fn create_prompt(
        &self,
        name: impl Into<String>,
        stage: Stage,
        component_role: impl Into<String>,
        body: impl Into<String>,
    ) -> Prompt {
        let prompt = Prompt {
            prompt_id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            version: 1,
            stage,
            component_role: component_role.into(),
            status: PromptStatus::Draft,
            body: body.into(),
            metrics: PromptMetrics::default(),
            created_at: Utc::now(),
        };
        self.inner.write().await.prompts.push(prompt.clone());
        prompt
    }

    /// New version of an existing prompt name; versions are monotonic.
    pub async fn create_version(
        &self,
        name: &str,
        body: impl Into<String>,
    ) -> anyhow::Result<Prompt> {
        let mut inner = self.inner.write().await;
        let Some(latest) = inner
            .prompts
            .iter()
            .filter(|p| p.name == name)
            .max_by_key(|p| p.version)
            .cloned()
        else {
            anyhow::bail!("unknown prompt name `{name}`");
        };
        let prompt = Prompt {
            prompt_id: uuid::Uuid::new_v4().to_string(),
            name: latest.name,
            version: latest.version + 1,
            stage: latest.stage,
            component_role: latest.component_role,
            status: PromptStatus::Draft,
            body: body.into(),
            metrics: PromptMetrics::default(),
            created_at: Utc::now(),
        };
        inner.prompts.push(prompt.clone());
        Ok(prompt)
    }

    /// Promotes a version to active and demotes any previous active version
    /// of the same name. A `testing` prompt with recorded usage must clear
    /// the activation threshold first.
    pub async fn activate(&self, prompt_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let Some(index) = inner.prompts.iter().position(|p| p.prompt_id == prompt_id) else {
            anyhow::bail!("unknown prompt id `{prompt_id}`");
        };
        let candidate = inner.prompts[index].clone();
        if candidate.status == PromptStatus::Testing
            && candidate.metrics.usage_count > 0
            && candidate.metrics.success_rate < self.activation_threshold
        {
            anyhow::bail!(
                "prompt `{}` v{} below activation threshold ({:.2} < {:.2})",
                candidate.name,
                candidate.version,
                candidate.metrics.success_rate,
                self.activation_threshold
            );
        }
        for prompt in inner
            .prompts
            .iter_mut()
            .filter(|p| p.name == candidate.name && p.status == PromptStatus::Active)
        {
            prompt.status = PromptStatus::Deprecated;
        }
        inner.prompts[index].status = PromptStatus::Active;
        Ok(())
    }

    pub async fn deprecate(&self, prompt_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let Some(prompt) = inner.prompts.iter_mut().find(|p| p.prompt_id == prompt_id) else {
            anyhow::bail!("unknown prompt id `{prompt_id}`");
        };
        prompt.status = PromptStatus::Deprecated;
        Ok(())
    }

    pub async fn set_testing(&self, prompt_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let Some(prompt) = inner.prompts.iter_mut().find(|p| p.prompt_id == prompt_id) else {
            anyhow::bail!("unknown prompt id `{prompt_id}`");
        };
        prompt.status = PromptStatus::Testing;
        Ok(())
    }

    pub async fn assign(&self, assignment: PromptAssignment) {
        self.inner.write().await.assignments.push(assignment);
    }

    pub async fn get(&self, prompt_id: &str) -> Option<Prompt> {
        self.inner
            .read()
            .await
            .prompts
            .iter()
            .find(|p| p.prompt_id == prompt_id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<Prompt> {
        self.inner.read().await.prompts.clone()
    }

    /// Resolves exactly one active prompt body for the key, walking scopes
    /// `experiment → agent → global → disk`, highest priority first within
    /// a scope.
    pub async fn get_active(&self, key: &ResolutionKey) -> Result<ResolvedPrompt, ErrorKind> {
        let inner = self.inner.read().await;
        let mut candidates = inner
            .assignments
            .iter()
            .filter(|a| assignment_matches(a, key))
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| a.scope.cmp(&b.scope).then(b.priority.cmp(&a.priority)));

        for assignment in candidates {
            let Some(prompt) = inner
                .prompts
                .iter()
                .find(|p| p.prompt_id == assignment.prompt_id && p.status == PromptStatus::Active)
            else {
                continue;
            };
            return Ok(ResolvedPrompt {
                prompt_id: prompt.prompt_id.clone(),
                name: prompt.name.clone(),
                version: prompt.version,
                body: prompt.body.clone(),
                scope: assignment.scope,
            });
        }
        Err(ErrorKind::PromptNotFound(key.describe()))
    }

    /// Metrics aggregation for a prompt after a model call: EMA success
    /// rate, rolling average latency.
    pub async fn record_usage(&self, prompt_id: &str, success: bool, latency_ms: u64) {
        let mut inner = self.inner.write().await;
        let Some(prompt) = inner.prompts.iter_mut().find(|p| p.prompt_id == prompt_id) else {
            return;
        };
        let metrics = &mut prompt.metrics;
        let outcome = if success { 1.0 } else { 0.0 };
        if metrics.usage_count == 0 {
            metrics.success_rate = outcome;
            metrics.avg_latency_ms = latency_ms as f64;
        } else {
            metrics.success_rate = metrics.success_rate * (1.0 - SUCCESS_RATE_EMA_ALPHA)
                + outcome * SUCCESS_RATE_EMA_ALPHA;
            let n = metrics.usage_count as f64;
            metrics.avg_latency_ms = (metrics.avg_latency_ms * n + latency_ms as f64) / (n + 1.0);
        }
        metrics.usage_count += 1;
    }

    /// Loads `<stage>.<component_role>.md` files shipped with the software
    /// and registers them as active disk-fallback prompts.
    pub async fn load_disk_fallbacks(&self, dir: impl AsRef<Path>) -> anyhow::Result<usize> {
        let dir = dir.as_ref();
        let mut loaded = 0usize;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(base) = name.strip_suffix(".md") else {
                continue;
            };
            let Some((stage_part, role)) = base.split_once('.') else {
                continue;
            };
            let Some(stage) = parse_stage(stage_part) else {
                tracing::warn!(target: "aard.prompts", file = name, "skipping prompt file with unknown stage");
                continue;
            };
            let body = tokio::fs::read_to_string(&path).await?;
            let prompt = self
                .create_prompt(format!("disk:{base}"), stage, role, body)
                .await;
            self.activate(&prompt.prompt_id).await?;
            self.assign(PromptAssignment::new(
                AssignmentScope::DiskFallback,
                stage,
                role,
                prompt.prompt_id,
            ))
            .await;
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn assignment_matches(assignment: &PromptAssignment, key: &ResolutionKey) -> bool {
    if let Some(stage) = key.stage {
        if assignment.stage != stage {
            return false;
        }
    }
    if assignment.component_role != key.component_role {
        return false;
    }
    if assignment.scope == AssignmentScope::Agent && assignment.agent_id != key.agent_id {
        return false;
    }
    if let Some(model_id) = &assignment.model_id {
        if key.model_id.as_deref() != Some(model_id.as_str()) {
            return false;
        }
    }
    if let Some(server_id) = &assignment.server_id {
        if key.server_id.as_deref() != Some(server_id.as_str()) {
            return false;
        }
    }
    if let Some(task_type) = &assignment.task_type {
        if key.task_type.as_deref() != Some(task_type.as_str()) {
            return false;
        }
    }
    true
}

fn parse_stage(input: &str) -> Option<Stage> {
    Stage::ALL.into_iter().find(|s| s.as_str() == input)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with_global(stage: Stage, role: &str, body: &str) -> (PromptRegistry, Prompt) {
        let registry = PromptRegistry::new();
        let prompt = registry.create_prompt("base", stage, role, body).await;
        registry.activate(&prompt.prompt_id).await.expect("activate");
        registry
            .assign(PromptAssignment::new(
                AssignmentScope::Global,
                stage,
                role,
                prompt.prompt_id.clone(),
            ))
            .await;
        (registry, prompt)
    }

    #[tokio::test]
    async fn activate_then_resolve_returns_the_activated_body() {
        let (registry, _) =
            registry_with_global(Stage::Planning, "planning", "You are the planner.").await;
        let next = registry
            .create_version("base", "You are the planner, v2.")
            .await
            .expect("version");
        assert_eq!(next.version, 2);
        registry.activate(&next.prompt_id).await.expect("activate");
        registry
            .assign(PromptAssignment::new(
                AssignmentScope::Global,
                Stage::Planning,
                "planning",
                next.prompt_id.clone(),
            ))
            .await;

        let resolved = registry
            .get_active(&ResolutionKey::new(Stage::Planning, "planning"))
            .await
            .expect("resolve");
        assert_eq!(resolved.body, "You are the planner, v2.");
        assert_eq!(resolved.version, 2);
    }

    #[tokio::test]
    async fn at_most_one_active_version_per_name() {
        let (registry, first) =
            registry_with_global(Stage::Planning, "planning", "v1").await;
        let next = registry.create_version("base", "v2").await.expect("version");
        registry.activate(&next.prompt_id).await.expect("activate");

        let first_now = registry.get(&first.prompt_id).await.expect("prompt");
        assert_eq!(first_now.status, PromptStatus::Deprecated);
        let active = registry
            .list()
            .await
            .into_iter()
            .filter(|p| p.name == "base" && p.status == PromptStatus::Active)
            .count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn agent_scope_beats_global_scope() {
        let (registry, _) = registry_with_global(Stage::Execution, "execution", "global").await;
        let agent_prompt = registry
            .create_prompt("agent-special", Stage::Execution, "execution", "agent body")
            .await;
        registry
            .activate(&agent_prompt.prompt_id)
            .await
            .expect("activate");
        let mut assignment = PromptAssignment::new(
            AssignmentScope::Agent,
            Stage::Execution,
            "execution",
            agent_prompt.prompt_id.clone(),
        );
        assignment.agent_id = Some("agent-7".to_string());
        registry.assign(assignment).await;

        let mut key = ResolutionKey::new(Stage::Execution, "execution");
        key.agent_id = Some("agent-7".to_string());
        let resolved = registry.get_active(&key).await.expect("resolve");
        assert_eq!(resolved.body, "agent body");
        assert_eq!(resolved.scope, AssignmentScope::Agent);

        let other = registry
            .get_active(&ResolutionKey::new(Stage::Execution, "execution"))
            .await
            .expect("resolve");
        assert_eq!(other.body, "global");
    }

    #[tokio::test]
    async fn missing_key_yields_prompt_not_found() {
        let registry = PromptRegistry::new();
        let err = registry
            .get_active(&ResolutionKey::new(Stage::Routing, "router"))
            .await
            .expect_err("miss");
        assert!(matches!(err, ErrorKind::PromptNotFound(_)));
    }

    #[tokio::test]
    async fn testing_prompt_below_threshold_cannot_activate() {
        let registry = PromptRegistry::new().with_activation_threshold(0.8);
        let prompt = registry
            .create_prompt("risky", Stage::Planning, "planning", "body")
            .await;
        registry.set_testing(&prompt.prompt_id).await.expect("testing");
        for _ in 0..5 {
            registry.record_usage(&prompt.prompt_id, false, 10).await;
        }
        let err = registry.activate(&prompt.prompt_id).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn record_usage_tracks_ema_and_latency() {
        let registry = PromptRegistry::new();
        let prompt = registry
            .create_prompt("m", Stage::Execution, "execution", "body")
            .await;
        registry.record_usage(&prompt.prompt_id, true, 100).await;
        registry.record_usage(&prompt.prompt_id, true, 300).await;
        let stored = registry.get(&prompt.prompt_id).await.expect("prompt");
        assert_eq!(stored.metrics.usage_count, 2);
        assert!(stored.metrics.success_rate > 0.9);
        assert!((stored.metrics.avg_latency_ms - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn disk_fallbacks_register_active_prompts() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("interpretation.interpreter.md"),
            "Interpret the request.",
        )
        .expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let registry = PromptRegistry::new();
        let loaded = registry
            .load_disk_fallbacks(dir.path())
            .await
            .expect("load");
        assert_eq!(loaded, 1);

        let resolved = registry
            .get_active(&ResolutionKey::new(Stage::Interpretation, "interpreter"))
            .await
            .expect("resolve");
        assert_eq!(resolved.scope, AssignmentScope::DiskFallback);
        assert_eq!(resolved.body, "Interpret the request.");
    }
}
