use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use aard_governor::{GovernorConfig, QuotaLimit, QuotaPeriod, QuotaResource};
use aard_providers::ServersConfig;

fn default_llm_timeout_s() -> u64 {
    30
}
fn default_llm_max_tokens() -> u32 {
    500
}
fn default_llm_temperature() -> f64 {
    0.7
}
fn default_llm_top_p() -> f64 {
    0.9
}
fn default_llm_ctx_size() -> u32 {
    8192
}
fn default_llm_max_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,
    #[serde(default = "default_llm_top_p")]
    pub top_p: f64,
    #[serde(default = "default_llm_ctx_size")]
    pub ctx_size: u32,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_llm_timeout_s(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            top_p: default_llm_top_p(),
            ctx_size: default_llm_ctx_size(),
            max_retries: default_llm_max_retries(),
        }
    }
}

fn default_plan_max_steps() -> usize {
    20
}
fn default_plan_total_timeout_s() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default = "default_plan_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_plan_total_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_plan_total_timeout_s")]
    pub total_timeout_s: u64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            max_steps: default_plan_max_steps(),
            timeout_s: default_plan_total_timeout_s(),
            total_timeout_s: default_plan_total_timeout_s(),
        }
    }
}

fn default_step_timeout_s() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default = "default_step_timeout_s")]
    pub timeout_s: u64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_step_timeout_s(),
        }
    }
}

fn default_sandbox_timeout_s() -> u64 {
    60
}
fn default_sandbox_memory_mb() -> u64 {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_sandbox_memory_mb")]
    pub memory_mb: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_sandbox_timeout_s(),
            memory_mb: default_sandbox_memory_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CodeConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

fn default_risk_weight_step_count() -> f64 {
    0.03
}
fn default_risk_weight_high_risk_step() -> f64 {
    0.35
}
fn default_risk_weight_dependency_depth() -> f64 {
    0.05
}
fn default_risk_weight_external_action() -> f64 {
    0.15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskWeights {
    #[serde(default = "default_risk_weight_step_count")]
    pub step_count: f64,
    #[serde(default = "default_risk_weight_high_risk_step")]
    pub high_risk_step: f64,
    #[serde(default = "default_risk_weight_dependency_depth")]
    pub dependency_depth: f64,
    #[serde(default = "default_risk_weight_external_action")]
    pub external_action: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            step_count: default_risk_weight_step_count(),
            high_risk_step: default_risk_weight_high_risk_step(),
            dependency_depth: default_risk_weight_dependency_depth(),
            external_action: default_risk_weight_external_action(),
        }
    }
}

fn default_autonomy_default() -> u8 {
    2
}
fn default_approval_timeout_s() -> u64 {
    300
}
fn default_timeout_policy() -> String {
    "fail".to_string()
}
fn default_very_high_threshold() -> f64 {
    0.85
}
fn default_risk_thresholds() -> [f64; 3] {
    [0.35, 0.55, 0.75]
}
fn default_trust_thresholds() -> [f64; 3] {
    [0.7, 0.5, 0.3]
}
fn default_risk_indicators() -> Vec<String> {
    [
        "delete all",
        "drop table",
        "rm -rf",
        "format disk",
        "shutdown",
        "wipe",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
fn default_external_indicators() -> Vec<String> {
    ["deploy", "send email", "post to", "publish", "purchase"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_autonomy_default")]
    pub autonomy_default: u8,
    #[serde(default = "default_approval_timeout_s")]
    pub timeout_s: u64,
    /// `fail` or `auto_approve`.
    #[serde(default = "default_timeout_policy")]
    pub timeout_policy: String,
    #[serde(default)]
    pub risk_weights: RiskWeights,
    /// Risk thresholds for autonomy levels 1..=3.
    #[serde(default = "default_risk_thresholds")]
    pub risk_thresholds: [f64; 3],
    /// Trust thresholds for autonomy levels 1..=3.
    #[serde(default = "default_trust_thresholds")]
    pub trust_thresholds: [f64; 3],
    #[serde(default = "default_very_high_threshold")]
    pub very_high_threshold: f64,
    #[serde(default = "default_risk_indicators")]
    pub risk_indicators: Vec<String>,
    #[serde(default = "default_external_indicators")]
    pub external_indicators: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            autonomy_default: default_autonomy_default(),
            timeout_s: default_approval_timeout_s(),
            timeout_policy: default_timeout_policy(),
            risk_weights: RiskWeights::default(),
            risk_thresholds: default_risk_thresholds(),
            trust_thresholds: default_trust_thresholds(),
            very_high_threshold: default_very_high_threshold(),
            risk_indicators: default_risk_indicators(),
            external_indicators: default_external_indicators(),
        }
    }
}

fn default_replan_max_attempts() -> u32 {
    3
}
fn default_replan_severity_threshold() -> String {
    "high".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanConfig {
    #[serde(default = "default_replan_max_attempts")]
    pub max_attempts: u32,
    /// Lowest severity that triggers a replan: `critical`, `high`, or
    /// `medium`.
    #[serde(default = "default_replan_severity_threshold")]
    pub on_severity_threshold: String,
}

impl Default for ReplanConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_replan_max_attempts(),
            on_severity_threshold: default_replan_severity_threshold(),
        }
    }
}

/// Typed view over the effective configuration. Every tunable the core
/// reads lives here; component code never carries its own numbers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub plan: PlanConfig,
    #[serde(default)]
    pub step: StepConfig,
    #[serde(default)]
    pub code: CodeConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub replan: ReplanConfig,
    /// `quota.<resource>.<period>` limits, e.g.
    /// `{"llm_requests": {"per_minute": 10}}`.
    #[serde(default)]
    pub quota: Map<String, Value>,
    #[serde(default)]
    pub servers: Map<String, Value>,
    pub default_server: Option<String>,
    pub max_concurrent_tasks: Option<u64>,
}

impl CoreConfig {
    pub fn governor_config(&self) -> GovernorConfig {
        let mut limits = Vec::new();
        for (resource_key, periods) in &self.quota {
            let Some(resource) = QuotaResource::parse(resource_key) else {
                tracing::warn!(target: "aard.config", resource = %resource_key, "unknown quota resource");
                continue;
            };
            let Some(periods) = periods.as_object() else {
                continue;
            };
            for (period_key, limit) in periods {
                let Some(period) = QuotaPeriod::parse(period_key) else {
                    tracing::warn!(target: "aard.config", period = %period_key, "unknown quota period");
                    continue;
                };
                let Some(limit) = limit.as_u64() else {
                    continue;
                };
                limits.push(QuotaLimit {
                    resource,
                    period,
                    limit,
                });
            }
        }
        GovernorConfig {
            limits,
            max_concurrent_tasks: self.max_concurrent_tasks,
        }
    }

    pub fn servers_config(&self) -> ServersConfig {
        let value = serde_json::json!({
            "servers": Value::Object(self.servers.clone()),
            "default_server": self.default_server,
        });
        serde_json::from_value(value).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
}

/// Layered configuration: state file, then environment, then runtime
/// patches, deep-merged in that order.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = read_json_file(&path).await.unwrap_or_else(|_| empty_object());
        let layers = ConfigLayers {
            file,
            env: env_layer(),
            runtime: empty_object(),
        };
        let store = Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        };
        store.save().await?;
        Ok(store)
    }

    /// In-memory store for tests and oneshot runs.
    pub fn ephemeral() -> Self {
        Self {
            path: PathBuf::new(),
            layers: Arc::new(RwLock::new(ConfigLayers {
                file: empty_object(),
                env: empty_object(),
                runtime: empty_object(),
            })),
        }
    }

    pub async fn core(&self) -> CoreConfig {
        serde_json::from_value(self.effective().await).unwrap_or_default()
    }

    pub async fn effective(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        merged
    }

    pub async fn patch_runtime(&self, patch: Value) -> Value {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        self.effective().await
    }

    pub async fn patch_file(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.file, &patch);
        }
        self.save().await?;
        Ok(self.effective().await)
    }

    async fn save(&self) -> anyhow::Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let value = self.layers.read().await.file.clone();
        let raw = serde_json::to_string_pretty(&value)?;
        fs::write(&self.path, raw).await?;
        Ok(())
    }
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

fn env_layer() -> Value {
    match std::env::var("AARD_CONFIG") {
        Ok(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).unwrap_or_else(|_| empty_object())
        }
        _ => empty_object(),
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match target_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target_slot, patch_value) => {
            *target_slot = patch_value.clone();
        }
    }
}
