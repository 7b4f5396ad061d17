use std::sync::Arc;

use flow_config::{FlowConfig, StateConfig};
use flow_core::{ComponentHealth, HealthReport, HealthStatus, Result};
use flow_memory::{
    InMemoryMemoryManager, InMemorySessionService, InMemoryStateService, MemoryManager,
    SessionService, StateService, open_memory_manager,
};

/// The shared collaborators every runtime and context is bound to.
#[derive(Clone)]
pub struct RuntimeServices {
    pub sessions: Arc<dyn SessionService>,
    /// Thread-scoped state that outlives single invocations (planner history).
    pub state: Arc<dyn StateService>,
    pub memory: Arc<dyn MemoryManager>,
}

impl RuntimeServices {
    pub fn new(
        sessions: Arc<dyn SessionService>,
        state: Arc<dyn StateService>,
        memory: Arc<dyn MemoryManager>,
    ) -> Self {
        Self {
            sessions,
            state,
            memory,
        }
    }

    /// All-in-process services.
    pub fn in_memory() -> Self {
        Self::with_memory(
            Arc::new(InMemoryMemoryManager::default()),
            &StateConfig::default(),
        )
    }

    pub fn with_memory(memory: Arc<dyn MemoryManager>, limits: &StateConfig) -> Self {
        Self {
            sessions: Arc::new(InMemorySessionService::new()),
            // One namespace per live thread; the registry releases it on eviction.
            state: Arc::new(InMemoryStateService::new(
                limits.max_thread_namespaces,
                limits.max_entries_per_namespace,
            )),
            memory,
        }
    }

    /// In-process sessions and state, memory backend per `[memory]`.
    pub fn from_config(config: &FlowConfig) -> Result<Self> {
        Ok(Self::with_memory(
            open_memory_manager(&config.memory)?,
            &config.state,
        ))
    }

    /// Probe every collaborator concurrently and fold the results.
    pub async fn health(&self) -> HealthReport {
        let (session, state, memory) = futures::join!(
            self.sessions.health(),
            self.state.health(),
            self.memory.is_healthy()
        );
        HealthReport::from_components(vec![
            ComponentHealth {
                component: "session".into(),
                status: session,
            },
            ComponentHealth {
                component: "state".into(),
                status: state,
            },
            ComponentHealth {
                component: "memory".into(),
                status: if memory {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                },
            },
        ])
    }
}
