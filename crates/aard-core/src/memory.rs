use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// Opaque interface to long-term memory. The core stores keyed JSON
/// records with tags; embedding-backed search lives behind an external
/// implementation of this trait.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn put(&self, key: &str, value: Value, tags: Vec<String>) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> Option<Value>;
    async fn search(&self, query: &str, limit: usize) -> Vec<(String, Value)>;
}

#[derive(Clone, Default)]
pub struct InMemoryMemoryStore {
    records: Arc<RwLock<HashMap<String, (Value, Vec<String>)>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn put(&self, key: &str, value: Value, tags: Vec<String>) -> anyhow::Result<()> {
        self.records
            .write()
            .await
            .insert(key.to_string(), (value, tags));
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<Value> {
        self.records.read().await.get(key).map(|(v, _)| v.clone())
    }

    async fn search(&self, query: &str, limit: usize) -> Vec<(String, Value)> {
        let needle = query.to_lowercase();
        self.records
            .read()
            .await
            .iter()
            .filter(|(key, (value, tags))| {
                key.to_lowercase().contains(&needle)
                    || tags.iter().any(|t| t.to_lowercase().contains(&needle))
                    || value.to_string().to_lowercase().contains(&needle)
            })
            .take(limit)
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect()
    }
}
