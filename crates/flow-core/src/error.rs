use thiserror::Error;

use crate::status::UnifiedStatus;

/// Unified error type for the entire flow runtime.
#[derive(Error, Debug)]
pub enum FlowError {
    // ── Validation errors ──────────────────────────────────────
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("validation failed: {field}: {reason}")]
    Validation { field: String, reason: String },

    // ── Execution state errors ─────────────────────────────────
    #[error("execution already running: {0}")]
    AlreadyRunning(String),

    #[error("no execution is running")]
    NotRunning,

    #[error("Agent '{0}' not found")]
    AgentNotFound(String),

    #[error("Tool '{0}' not found")]
    ToolNotFound(String),

    #[error("unknown context path root: {0}")]
    UnknownContextPath(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: UnifiedStatus,
        to: UnifiedStatus,
    },

    #[error("operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("execution cancelled: {0}")]
    Cancelled(String),

    #[error("max iterations reached: {0}")]
    MaxIterations(u32),

    // ── Collaborator errors ────────────────────────────────────
    #[error("state limit exceeded: {0}")]
    StateLimit(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("memory error: {0}")]
    Memory(String),

    #[error("version storage error: {0}")]
    Storage(String),

    #[error("tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    #[error("llm adapter error: {0}")]
    Llm(String),

    #[error("mcp adapter error: {0}")]
    Mcp(String),

    #[error("agent error: {0}")]
    Agent(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::InvalidArgument(_) => "INVALID_ARGUMENT",
            FlowError::Validation { .. } => "VALIDATION",
            FlowError::AlreadyRunning(_) => "ALREADY_RUNNING",
            FlowError::NotRunning => "NOT_RUNNING",
            FlowError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            FlowError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            FlowError::UnknownContextPath(_) => "UNKNOWN_CONTEXT_PATH",
            FlowError::InvalidTransition { .. } => "INVALID_TRANSITION",
            FlowError::Timeout { .. } => "TIMEOUT",
            FlowError::Cancelled(_) => "CANCELLED",
            FlowError::MaxIterations(_) => "MAX_ITERATIONS",
            FlowError::StateLimit(_) => "STATE_LIMIT",
            FlowError::Session(_) => "SESSION_ERROR",
            FlowError::Memory(_) => "MEMORY_ERROR",
            FlowError::Storage(_) => "STORAGE_ERROR",
            FlowError::ToolExecution { .. } => "TOOL_EXECUTION_ERROR",
            FlowError::Llm(_) => "LLM_ERROR",
            FlowError::Mcp(_) => "MCP_ERROR",
            FlowError::Agent(_) => "AGENT_ERROR",
            FlowError::Config(_) => "CONFIG_ERROR",
            FlowError::Io(_) => "IO_ERROR",
            FlowError::Serialization(_) => "SERIALIZATION_ERROR",
            FlowError::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Validation failures are raised before any state is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FlowError::InvalidArgument(_) | FlowError::Validation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
