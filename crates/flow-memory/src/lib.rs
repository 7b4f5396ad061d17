//! # flow-memory
//!
//! Collaborator services consumed by the execution runtime:
//!
//! - **Sessions**: append-only conversation history keyed by tenant and thread.
//! - **State**: namespaced key-value working memory with namespace/entry caps.
//! - **Memory**: long-term item store (in-process or SQLite).
//! - **Versions**: the context-version log behind `ExecutionRuntime`.

pub mod memory;
pub mod session;
pub mod state;
pub mod versions;

pub use memory::{
    InMemoryMemoryManager, MemoryItem, MemoryManager, MemoryQuery, SqliteMemoryManager,
    open_memory_manager,
};
pub use session::{
    ConversationEntry, InMemorySessionService, Session, SessionContext, SessionService,
};
pub use state::{InMemoryStateService, StateService};
pub use versions::InMemoryVersionStore;
