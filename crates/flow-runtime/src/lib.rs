//! # flow-runtime
//!
//! Per-thread agent execution: lifecycle, context versioning, dispatch.
//!
//! ## Architecture
//!
//! ```text
//!              ┌────────────────┐
//!              │  Orchestrator  │  ← create_agent / call_agent / call_tool
//!              └───────┬────────┘
//!                      │ thread id
//!                      ▼
//!              ┌────────────────┐
//!              │RuntimeRegistry │  ← one runtime per thread, idle eviction
//!              └───────┬────────┘
//!                      │
//!                      ▼
//!              ┌────────────────┐      ┌────────────────┐
//!              │ExecutionRuntime│◄─────│ ContextBuilder │
//!              │                │      └────────────────┘
//!              │ start / append │
//!              │ values / query │
//!              └───────┬────────┘
//!                      │
//!         ┌────────────┼────────────┐
//!         ▼            ▼            ▼
//!    ┌─────────┐ ┌──────────┐ ┌──────────┐
//!    │ Session │ │  State   │ │  Memory  │
//!    └─────────┘ └──────────┘ └──────────┘
//! ```
//!
//! Agents run a think → act loop ([`AgentEngine`]) or the same loop with each
//! action tracked as a plan step ([`AgentExecutor`]).

pub mod agent;
pub mod context;
pub mod execution;
pub mod llm;
pub mod mcp;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod services;
pub mod tools;

pub use agent::{
    AgentConfig, AgentDefinition, AgentEngine, AgentExecutor, AgentIdentity, AgentMode,
    AgentOutcome, AgentRunner, AgentThink, DEFAULT_MAX_ITERATIONS, FnThink, PassthroughThink,
};
pub use context::{AgentContext, CallOptions, ContextBuilder, ExecutionHandle, SystemContext};
pub use execution::{
    CONTEXT_ROOTS, CleanupReport, ContextValueUpdate, ExecutionOutcome, ExecutionRuntime,
    ExecutionSummary, RuntimeStats,
};
pub use llm::{LlmThink, parse_thought};
pub use mcp::McpBridge;
pub use orchestrator::{
    AgentStatus, AgentUsage, OrchestrationResult, Orchestrator, OrchestratorStats, ResultContext,
};
pub use planner::{
    ActionResult, AgentAction, AgentThought, ExecutionHints, Level, PlannerExecutionContext,
    PlannerResult, ResultAnalysis, StepExecution, Style,
};
pub use registry::RuntimeRegistry;
pub use services::RuntimeServices;
pub use tools::{ToolConfig, ToolEngine};
