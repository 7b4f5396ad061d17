use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

use flow_config::StateConfig;
use flow_core::{FlowError, HealthStatus, Result};

/// Namespaced key-value working memory.
///
/// Every call takes an optional thread scope: the same namespace under two
/// different threads holds two independent maps.
#[async_trait]
pub trait StateService: Send + Sync {
    async fn get(&self, namespace: &str, key: &str, thread_id: Option<&str>)
    -> Result<Option<Value>>;

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        thread_id: Option<&str>,
    ) -> Result<()>;

    async fn delete(&self, namespace: &str, key: &str, thread_id: Option<&str>) -> Result<bool>;

    /// Drop one namespace.
    async fn clear(&self, namespace: &str, thread_id: Option<&str>) -> Result<()>;

    /// Drop everything this service holds.
    async fn clear_all(&self) -> Result<()>;

    async fn get_namespace(
        &self,
        namespace: &str,
        thread_id: Option<&str>,
    ) -> Result<HashMap<String, Value>>;

    async fn health(&self) -> HealthStatus;
}

/// Capped in-memory state service.
pub struct InMemoryStateService {
    namespaces: RwLock<HashMap<String, HashMap<String, Value>>>,
    max_namespaces: usize,
    max_entries_per_namespace: usize,
}

impl InMemoryStateService {
    pub fn new(max_namespaces: usize, max_entries_per_namespace: usize) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            max_namespaces,
            max_entries_per_namespace,
        }
    }

    pub fn from_config(config: &StateConfig) -> Self {
        Self::new(config.max_namespaces, config.max_entries_per_namespace)
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.read().len()
    }

    fn scoped(namespace: &str, thread_id: Option<&str>) -> String {
        match thread_id {
            Some(thread) => format!("{}:{}", thread, namespace),
            None => namespace.to_string(),
        }
    }
}

impl Default for InMemoryStateService {
    fn default() -> Self {
        Self::from_config(&StateConfig::default())
    }
}

#[async_trait]
impl StateService for InMemoryStateService {
    async fn get(
        &self,
        namespace: &str,
        key: &str,
        thread_id: Option<&str>,
    ) -> Result<Option<Value>> {
        let scoped = Self::scoped(namespace, thread_id);
        Ok(self
            .namespaces
            .read()
            .get(&scoped)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        thread_id: Option<&str>,
    ) -> Result<()> {
        let scoped = Self::scoped(namespace, thread_id);
        let mut namespaces = self.namespaces.write();

        if !namespaces.contains_key(&scoped) && namespaces.len() >= self.max_namespaces {
            return Err(FlowError::StateLimit(format!(
                "namespace limit of {} reached, cannot create '{}'",
                self.max_namespaces, namespace
            )));
        }

        let entries = namespaces.entry(scoped).or_default();
        if !entries.contains_key(key) && entries.len() >= self.max_entries_per_namespace {
            return Err(FlowError::StateLimit(format!(
                "namespace '{}' is full ({} entries)",
                namespace, self.max_entries_per_namespace
            )));
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str, thread_id: Option<&str>) -> Result<bool> {
        let scoped = Self::scoped(namespace, thread_id);
        let mut namespaces = self.namespaces.write();
        let Some(entries) = namespaces.get_mut(&scoped) else {
            return Ok(false);
        };
        let removed = entries.remove(key).is_some();
        if entries.is_empty() {
            namespaces.remove(&scoped);
        }
        Ok(removed)
    }

    async fn clear(&self, namespace: &str, thread_id: Option<&str>) -> Result<()> {
        self.namespaces
            .write()
            .remove(&Self::scoped(namespace, thread_id));
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.namespaces.write().clear();
        Ok(())
    }

    async fn get_namespace(
        &self,
        namespace: &str,
        thread_id: Option<&str>,
    ) -> Result<HashMap<String, Value>> {
        Ok(self
            .namespaces
            .read()
            .get(&Self::scoped(namespace, thread_id))
            .cloned()
            .unwrap_or_default())
    }

    /// Degraded once the namespace cap is reached.
    async fn health(&self) -> HealthStatus {
        if self.namespaces.read().len() >= self.max_namespaces {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
