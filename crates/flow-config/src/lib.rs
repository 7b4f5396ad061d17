//! # flow-config
//!
//! Configuration system for the flow runtime. Reads from `flow.toml` and
//! environment variables, in that precedence order.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::FlowConfig;
pub use schema::{
    ConfigWarning, LoggingConfig, MemoryConfig, OrchestratorConfig, RegistryConfig,
    RuntimeConfig, StateConfig, WarningSeverity,
};
