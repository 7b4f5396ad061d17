use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of a tool that agents can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique name, e.g. "calculator" or "github.search".
    pub name: String,
    /// Human-readable description for the LLM.
    pub description: String,
    /// JSON Schema of the input object.
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Which adapter provides this tool (None = registered directly).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// A request to call a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Something that can execute a single tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: Value) -> crate::Result<Value>;
}

/// Adapts a plain async closure into a [`ToolHandler`].
pub struct FnTool<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = crate::Result<Value>> + Send,
{
    async fn call(&self, input: Value) -> crate::Result<Value> {
        (self.0)(input).await
    }
}

/// External tool provider speaking the Model Context Protocol.
#[async_trait]
pub trait McpAdapter: Send + Sync {
    /// Provider name used to tag tools registered from this adapter.
    fn name(&self) -> &str;

    async fn connect(&self) -> crate::Result<()>;

    async fn disconnect(&self) -> crate::Result<()>;

    fn is_connected(&self) -> bool;

    async fn get_tools(&self) -> crate::Result<Vec<ToolDefinition>>;

    async fn execute_tool(&self, name: &str, input: Value) -> crate::Result<Value>;
}
