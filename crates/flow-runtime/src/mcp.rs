use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use flow_core::{Event, EventBus, McpAdapter, Result, ToolDefinition, ToolHandler};

use crate::tools::ToolEngine;

/// Routes one registered tool to its MCP server.
struct McpToolHandler {
    adapter: Arc<dyn McpAdapter>,
    tool_name: String,
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    async fn call(&self, input: Value) -> Result<Value> {
        self.adapter.execute_tool(&self.tool_name, input).await
    }
}

/// Connects an MCP adapter to the tool engine.
pub struct McpBridge {
    adapter: Arc<dyn McpAdapter>,
    events: EventBus,
}

impl McpBridge {
    pub fn new(adapter: Arc<dyn McpAdapter>, events: EventBus) -> Self {
        Self { adapter, events }
    }

    /// Provider tag stamped on every tool this bridge registers.
    pub fn provider(&self) -> String {
        format!("mcp:{}", self.adapter.name())
    }

    pub fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }

    pub async fn connect(&self) -> Result<()> {
        if self.adapter.is_connected() {
            return Ok(());
        }
        self.adapter.connect().await?;
        info!(server = %self.adapter.name(), "MCP connected");
        self.events.publish(Event::McpConnected);
        Ok(())
    }

    /// Disconnect and drop this server's tools from `tools`.
    pub async fn disconnect(&self, tools: &ToolEngine) -> Result<()> {
        if self.adapter.is_connected() {
            self.adapter.disconnect().await?;
            self.events.publish(Event::McpDisconnected);
        }
        let removed = tools.unregister_provider(&self.provider());
        info!(server = %self.adapter.name(), removed, "MCP disconnected");
        Ok(())
    }

    /// Fetch the server's tool list and register each one, connecting first
    /// if needed.
    pub async fn register_tools(&self, tools: &ToolEngine) -> Result<Vec<ToolDefinition>> {
        self.connect().await?;
        let provider = self.provider();

        let mut registered = Vec::new();
        for mut definition in self.adapter.get_tools().await? {
            definition.provider = Some(provider.clone());
            let handler = Arc::new(McpToolHandler {
                adapter: Arc::clone(&self.adapter),
                tool_name: definition.name.clone(),
            });
            tools.register(definition.clone(), handler);
            registered.push(definition);
        }
        info!(server = %self.adapter.name(), count = registered.len(), "MCP tools registered");
        Ok(registered)
    }
}
