use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use flow_core::{Event, EventBus, FlowError, Result, ToolDefinition, ToolHandler};

/// Registration input for `create_tool`.
#[derive(Clone)]
pub struct ToolConfig {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub categories: Vec<String>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolConfig {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({ "type": "object" }),
            categories: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            categories: self.categories.clone(),
            provider: None,
        }
    }
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

/// Name → handler table with timed execution.
pub struct ToolEngine {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    timeout: Duration,
    events: EventBus,
}

impl ToolEngine {
    pub fn new(timeout: Duration, events: EventBus) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            timeout,
            events,
        }
    }

    /// Register or replace a tool.
    pub fn register(&self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        let name = definition.name.clone();
        let provider = definition.provider.clone();
        let replaced = self
            .tools
            .write()
            .insert(
                name.clone(),
                RegisteredTool {
                    definition,
                    handler,
                },
            )
            .is_some();
        if replaced {
            warn!(tool = %name, "tool re-registered, previous handler replaced");
        } else {
            info!(tool = %name, "tool registered");
        }
        self.events.publish(Event::ToolRegistered {
            tool_name: name,
            provider,
        });
    }

    /// Drop every tool registered by `provider`; returns how many.
    pub fn unregister_provider(&self, provider: &str) -> usize {
        let mut tools = self.tools.write();
        let before = tools.len();
        tools.retain(|_, t| t.definition.provider.as_deref() != Some(provider));
        before - tools.len()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// All definitions, sorted by name.
    pub fn list(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .values()
            .map(|t| t.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        correlation_id: Option<&str>,
    ) -> Result<Value> {
        let handler = self
            .tools
            .read()
            .get(name)
            .map(|t| Arc::clone(&t.handler))
            .ok_or_else(|| FlowError::ToolNotFound(name.to_string()))?;

        self.events.publish(Event::ToolCalled {
            tool_name: name.to_string(),
            correlation_id: correlation_id.map(str::to_string),
        });
        debug!(tool = name, "executing tool");

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, handler.call(input)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ FlowError::ToolExecution { .. })) => Err(e),
            Ok(Err(e)) => Err(FlowError::ToolExecution {
                tool: name.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(FlowError::Timeout {
                operation: format!("tool '{}'", name),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(_) => self.events.publish(Event::ToolCompleted {
                tool_name: name.to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
            }),
            Err(ref e) => {
                warn!(tool = name, error = %e, "tool failed");
                self.events.publish(Event::ToolFailed {
                    tool_name: name.to_string(),
                    error: e.to_string(),
                });
            }
        }
        outcome
    }
}
