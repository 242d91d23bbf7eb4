use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServersConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    pub default_server: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedModel {
    pub id: String,
    pub server_id: String,
    pub display_name: String,
    pub context_window: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub models: Vec<HostedModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub num_ctx: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            temperature: 0.7,
            top_p: 0.9,
            num_ctx: 8192,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub user: String,
    pub model: Option<String>,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait ModelServer: Send + Sync {
    fn info(&self) -> ServerInfo;
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse>;
}

/// Registry of configured model servers. Selection follows the gateway
/// contract: a pinned server never falls back, a bare model reference picks
/// any server hosting that model.
#[derive(Clone)]
pub struct ServerRegistry {
    servers: Arc<RwLock<Vec<Arc<dyn ModelServer>>>>,
    default_server: Arc<RwLock<Option<String>>>,
}

impl ServerRegistry {
    pub fn new(config: ServersConfig) -> Self {
        let servers = build_servers(&config);
        Self {
            servers: Arc::new(RwLock::new(servers)),
            default_server: Arc::new(RwLock::new(config.default_server)),
        }
    }

    pub async fn reload(&self, config: ServersConfig) {
        let rebuilt = build_servers(&config);
        *self.servers.write().await = rebuilt;
        *self.default_server.write().await = config.default_server;
    }

    pub async fn list(&self) -> Vec<ServerInfo> {
        self.servers.read().await.iter().map(|s| s.info()).collect()
    }

    /// Adds a server built outside the config path (custom transports,
    /// test doubles). Takes precedence for `select` only by id or model.
    pub async fn register(&self, server: Arc<dyn ModelServer>) {
        self.servers.write().await.insert(0, server);
    }

    pub async fn select(
        &self,
        server_ref: Option<&str>,
        model_ref: Option<&str>,
    ) -> anyhow::Result<Arc<dyn ModelServer>> {
        let servers = self.servers.read().await;
        let available = servers.iter().map(|s| s.info().id).collect::<Vec<_>>();

        if let Some(id) = server_ref {
            // Pinned server: failure surfaces, no fallback to another server.
            if let Some(server) = servers.iter().find(|s| s.info().id == id) {
                return Ok(server.clone());
            }
            anyhow::bail!(
                "server `{}` is not configured. configured servers: {}",
                id,
                available.join(", ")
            );
        }

        if let Some(model) = model_ref {
            if let Some(server) = servers
                .iter()
                .find(|s| s.info().models.iter().any(|m| m.id == model))
            {
                return Ok(server.clone());
            }
        }

        let configured_default = self.default_server.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(server) = servers.iter().find(|s| s.info().id == default_id) {
                return Ok(server.clone());
            }
        }

        let Some(server) = servers.first() else {
            anyhow::bail!("no model server configured");
        };
        Ok(server.clone())
    }
}

fn build_servers(config: &ServersConfig) -> Vec<Arc<dyn ModelServer>> {
    let mut servers: Vec<Arc<dyn ModelServer>> = Vec::new();

    for (id, entry) in &config.servers {
        if id == "echo" {
            continue;
        }
        servers.push(Arc::new(OpenAICompatibleServer {
            id: id.clone(),
            name: id.clone(),
            base_url: normalize_base(entry.url.as_deref().unwrap_or("http://127.0.0.1:11434/v1")),
            api_key: entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string()),
            default_model: entry
                .default_model
                .clone()
                .unwrap_or_else(|| "llama3.1:8b".to_string()),
            client: Client::new(),
        }));
    }

    if servers.is_empty() || config.servers.contains_key("echo") {
        servers.push(Arc::new(LocalEchoServer));
    }

    servers
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

/// Deterministic local server used when nothing is configured and in tests.
pub struct LocalEchoServer;

#[async_trait]
impl ModelServer for LocalEchoServer {
    fn info(&self) -> ServerInfo {
        ServerInfo {
            id: "echo".to_string(),
            name: "Local Echo".to_string(),
            models: vec![HostedModel {
                id: "echo-1".to_string(),
                server_id: "echo".to_string(),
                display_name: "Echo Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        Ok(CompletionResponse {
            text: format!("Echo: {}", request.user),
            usage: None,
        })
    }
}

pub struct OpenAICompatibleServer {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
    pub client: Client,
}

#[async_trait]
impl ModelServer for OpenAICompatibleServer {
    fn info(&self) -> ServerInfo {
        ServerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![HostedModel {
                id: self.default_model.clone(),
                server_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let url = format!("{}/chat/completions", self.base_url);

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.user}));

        let mut req = self.client.post(url).json(&json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.params.max_tokens,
            "temperature": request.params.temperature,
            "top_p": request.params.top_p,
            "num_ctx": request.params.num_ctx,
            "stream": false,
        }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("server request failed with status {}", status));
            anyhow::bail!(detail);
        }

        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }

        if let Some(text) = extract_openai_text(&value) {
            return Ok(CompletionResponse {
                text,
                usage: extract_usage(&value),
            });
        }

        let body_preview = truncate_for_error(&value.to_string(), 500);
        anyhow::bail!(
            "server returned no completion content for model `{}` (response: {})",
            model,
            body_preview
        );
    }
}

/// scheme + host + standard API prefix; comparisons run on this form.
pub fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

fn extract_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_openai_text(value: &serde_json::Value) -> Option<String> {
    if let Some(text) = value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"))
        .and_then(|v| v.get("content"))
        .and_then(|v| v.as_str())
    {
        if !text.trim().is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(text) = value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("text"))
        .and_then(|v| v.as_str())
    {
        return Some(text.to_string());
    }
    None
}

fn extract_openai_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(server_ids: &[&str], default_server: Option<&str>) -> ServersConfig {
        let mut servers = HashMap::new();
        for id in server_ids {
            servers.insert(
                (*id).to_string(),
                ServerConfig {
                    api_key: None,
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        ServersConfig {
            servers,
            default_server: default_server.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn pinned_server_wins_over_default() {
        let registry = ServerRegistry::new(cfg(&["alpha", "beta"], Some("alpha")));
        let server = registry.select(Some("beta"), None).await.expect("server");
        assert_eq!(server.info().id, "beta");
    }

    #[tokio::test]
    async fn pinned_unknown_server_errors_without_fallback() {
        let registry = ServerRegistry::new(cfg(&["alpha"], None));
        let err = registry
            .select(Some("beta"), Some("alpha-model"))
            .await
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("server `beta` is not configured"));
    }

    #[tokio::test]
    async fn model_ref_selects_any_hosting_server() {
        let registry = ServerRegistry::new(cfg(&["alpha", "beta"], Some("alpha")));
        let server = registry
            .select(None, Some("beta-model"))
            .await
            .expect("server");
        assert_eq!(server.info().id, "beta");
    }

    #[tokio::test]
    async fn falls_back_to_default_then_first() {
        let registry = ServerRegistry::new(cfg(&["alpha"], Some("missing")));
        let server = registry.select(None, None).await.expect("server");
        assert_eq!(server.info().id, "alpha");
    }

    #[tokio::test]
    async fn empty_config_serves_echo() {
        let registry = ServerRegistry::new(ServersConfig::default());
        let server = registry.select(None, None).await.expect("server");
        assert_eq!(server.info().id, "echo");
        let response = server
            .complete(&CompletionRequest {
                system: None,
                user: "ping".to_string(),
                model: None,
                params: GenerationParams::default(),
            })
            .await
            .expect("completion");
        assert_eq!(response.text, "Echo: ping");
    }

    #[test]
    fn normalize_base_appends_v1_once() {
        assert_eq!(normalize_base("http://h:1/"), "http://h:1/v1");
        assert_eq!(normalize_base("http://h:1/v1"), "http://h:1/v1");
    }

    #[test]
    fn extract_text_prefers_message_content() {
        let value = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(extract_openai_text(&value).as_deref(), Some("hi"));
    }

    #[test]
    fn extract_error_reads_nested_message() {
        let value = json!({"error": {"message": "model not found"}});
        assert_eq!(
            extract_openai_error(&value).as_deref(),
            Some("model not found")
        );
    }
}
