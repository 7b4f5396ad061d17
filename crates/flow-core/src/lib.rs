//! # flow-core
//!
//! Core types, traits, and primitives for the kodus-flow orchestration runtime.
//! This crate defines the shared vocabulary used by every other crate in the workspace.

pub mod clock;
pub mod error;
pub mod event;
pub mod health;
pub mod llm;
pub mod plan;
pub mod status;
pub mod thread;
pub mod tool;
pub mod version;

pub use clock::{Clock, IdGenerator, ManualClock, SharedClock, SystemClock, system_clock};
pub use error::{FlowError, Result};
pub use event::{Event, EventBus};
pub use health::{ComponentHealth, HealthReport, HealthStatus};
pub use llm::{LlmAdapter, LlmMessage, LlmRequest, LlmResponse, LlmRole, Usage};
pub use plan::{ExecutionPlan, PlanStep};
pub use status::{StatusMachine, UnifiedStatus};
pub use thread::{MetadataValue, Thread, ThreadId, sanitize_thread_id, validate_thread_id};
pub use tool::{FnTool, McpAdapter, ToolCall, ToolDefinition, ToolHandler};
pub use version::{
    ContextSource, ContextVersion, ExecutionStep, ScoredVersion, StorageHints, StorageTier,
    VersionLinks, VersionMetadata, VersionQuery, VersionStore, rank_versions,
};
