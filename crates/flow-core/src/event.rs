use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted by the orchestrator and runtimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Registration ───────────────────────────────────────────
    AgentRegistered {
        agent_name: String,
        mode: String,
    },
    ToolRegistered {
        tool_name: String,
        provider: Option<String>,
    },

    // ── Agent lifecycle ────────────────────────────────────────
    AgentStarted {
        agent_name: String,
        thread_id: String,
        correlation_id: String,
    },
    AgentThinking {
        agent_name: String,
        execution_id: String,
        iteration: u32,
    },
    AgentCompleted {
        agent_name: String,
        correlation_id: String,
        duration_ms: u64,
    },
    AgentFailed {
        agent_name: String,
        correlation_id: String,
        error: String,
    },

    // ── Tool lifecycle ─────────────────────────────────────────
    ToolCalled {
        tool_name: String,
        correlation_id: Option<String>,
    },
    ToolCompleted {
        tool_name: String,
        duration_ms: u64,
    },
    ToolFailed {
        tool_name: String,
        error: String,
    },

    // ── Execution lifecycle ────────────────────────────────────
    ExecutionStarted {
        execution_id: String,
        agent_name: Option<String>,
    },
    ExecutionEnded {
        execution_id: String,
        success: bool,
        duration_ms: u64,
    },
    StepTransition {
        execution_id: String,
        step_id: String,
        from: String,
        to: String,
    },

    // ── Registry / adapters ────────────────────────────────────
    ThreadEvicted {
        thread_id: String,
    },
    McpConnected,
    McpDisconnected,

    // ── System ─────────────────────────────────────────────────
    Shutdown,
}

/// A broadcast-based event bus for system-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
