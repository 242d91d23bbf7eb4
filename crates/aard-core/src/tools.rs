use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Tool bodies live outside the core; this is the seam they plug into.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn name(&self) -> &str;
    async fn invoke(&self, args: Value, cancel: CancellationToken) -> anyhow::Result<Value>;
}

#[derive(Clone, Default)]
pub struct ToolRouter {
    tools: Arc<RwLock<HashMap<String, Arc<dyn ToolInvoker>>>>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tool: Arc<dyn ToolInvoker>) {
        self.tools
            .write()
            .await
            .insert(tool.name().to_string(), tool);
    }

    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<Value> {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            anyhow::bail!("unknown tool `{name}`");
        };
        tool.invoke(args, cancel).await
    }
}

/// Structural check of function-call parameters against the declared
/// schema: required fields must be present, typed properties must match.
pub fn validate_parameters(parameters: &Value, schema: &Value) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema_obj.get("required").and_then(|v| v.as_array()) {
        let params = parameters.as_object();
        for field in required {
            let Some(field) = field.as_str() else { continue };
            if params.map(|p| !p.contains_key(field)).unwrap_or(true) {
                return Err(format!("missing required parameter `{field}`"));
            }
        }
    }

    let Some(properties) = schema_obj.get("properties").and_then(|v| v.as_object()) else {
        return Ok(());
    };
    let Some(params) = parameters.as_object() else {
        if properties.is_empty() {
            return Ok(());
        }
        return Err("parameters must be an object".to_string());
    };

    for (field, spec) in properties {
        let Some(value) = params.get(field) else {
            continue;
        };
        let Some(expected) = spec.get("type").and_then(|v| v.as_str()) else {
            continue;
        };
        if !value_matches_type(value, expected) {
            return Err(format!(
                "parameter `{field}` must have type `{expected}`"
            ));
        }
    }
    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct UpperTool;

    #[async_trait]
    impl ToolInvoker for UpperTool {
        fn name(&self) -> &str {
            "upper"
        }

        async fn invoke(&self, args: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(json!({"text": text.to_uppercase()}))
        }
    }

    #[tokio::test]
    async fn router_dispatches_registered_tool() {
        let router = ToolRouter::new();
        router.register(Arc::new(UpperTool)).await;
        assert!(router.has("upper").await);

        let out = router
            .invoke("upper", json!({"text": "ok"}), CancellationToken::new())
            .await
            .expect("invoke");
        assert_eq!(out, json!({"text": "OK"}));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let router = ToolRouter::new();
        let err = router
            .invoke("nope", json!({}), CancellationToken::new())
            .await
            .expect_err("unknown");
        assert!(err.to_string().contains("unknown tool"));
    }

    #[test]
    fn missing_required_parameter_fails_validation() {
        let schema = json!({
            "type": "object",
            "properties": {"n": {"type": "integer"}},
            "required": ["n"]
        });
        let err = validate_parameters(&json!({}), &schema).expect_err("missing");
        assert!(err.contains("missing required parameter `n`"));
        assert!(validate_parameters(&json!({"n": 10}), &schema).is_ok());
    }

    #[test]
    fn type_mismatch_fails_validation() {
        let schema = json!({
            "type": "object",
            "properties": {"limit": {"type": "integer"}}
        });
        let err = validate_parameters(&json!({"limit": "ten"}), &schema).expect_err("mismatch");
        assert!(err.contains("type `integer`"));
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate_parameters(&json!({"x": 1}), &Value::Null).is_ok());
    }
}
