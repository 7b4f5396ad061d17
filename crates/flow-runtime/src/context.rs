use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use flow_config::StateConfig;
use flow_core::{
    FlowError, HealthReport, IdGenerator, Result, SharedClock, StatusMachine, Thread,
    UnifiedStatus, system_clock,
};
use flow_memory::{
    ConversationEntry, InMemoryStateService, MemoryManager, SessionService, StateService,
};

use crate::agent::{AgentConfig, AgentIdentity, DEFAULT_MAX_ITERATIONS};
use crate::execution::{CleanupReport, ExecutionOutcome, ExecutionSummary};
use crate::services::RuntimeServices;

/// Lifecycle operations an agent context may call on its runtime.
#[async_trait]
pub trait ExecutionHandle: Send + Sync {
    fn start(&self, execution_id: &str, ctx: &AgentContext) -> Result<()>;

    fn end(&self, execution_id: &str, outcome: ExecutionOutcome) -> Result<ExecutionSummary>;

    fn update(&self, patch: Value) -> Result<()>;

    async fn health(&self) -> HealthReport;

    fn cleanup(&self) -> CleanupReport;
}

/// Per-call options for `call_agent`.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub thread: Option<Thread>,
    pub user_context: Option<Map<String, Value>>,
    pub session_id: Option<String>,
    pub tenant_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl CallOptions {
    pub fn with_thread(mut self, thread: Thread) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn with_user_context(mut self, user: Map<String, Value>) -> Self {
        self.user_context = Some(user);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Mutable execution-side view of an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemContext {
    pub iteration: u32,
    pub tools_used: u32,
    pub conversation_history: Vec<ConversationEntry>,
    pub status: UnifiedStatus,
    pub started_at: DateTime<Utc>,
}

/// Everything an agent's think logic may touch during one invocation.
pub struct AgentContext {
    pub agent_name: String,
    pub invocation_id: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub thread: Thread,
    pub session_id: String,
    pub identity: AgentIdentity,
    pub max_iterations: u32,
    pub input: Value,
    /// Scratch state for this invocation only.
    pub state: Arc<dyn StateService>,
    pub memory: Arc<dyn MemoryManager>,
    pub sessions: Arc<dyn SessionService>,
    user: Map<String, Value>,
    system: Mutex<SystemContext>,
    cancel: CancellationToken,
    execution: Arc<dyn ExecutionHandle>,
}

impl AgentContext {
    pub fn thread_id(&self) -> &str {
        self.thread.id.as_str()
    }

    pub fn user(&self) -> &Map<String, Value> {
        &self.user
    }

    pub fn system(&self) -> SystemContext {
        self.system.lock().clone()
    }

    pub fn execution(&self) -> &Arc<dyn ExecutionHandle> {
        &self.execution
    }

    pub fn record_iteration(&self) -> u32 {
        let mut system = self.system.lock();
        system.iteration += 1;
        system.iteration
    }

    pub fn record_tool_use(&self) {
        self.system.lock().tools_used += 1;
    }

    /// Move the invocation status through the central validator.
    pub fn set_status(&self, to: UnifiedStatus) -> Result<()> {
        StatusMachine::transition(&mut self.system.lock().status, to)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tear down per-invocation state. Shared session and memory stay.
    pub async fn cleanup(&self) -> Result<()> {
        self.state.clear_all().await
    }
}

/// Stateless factory for [`AgentContext`]s.
#[derive(Clone)]
pub struct ContextBuilder {
    services: RuntimeServices,
    state_limits: StateConfig,
    default_tenant: String,
    clock: SharedClock,
}

impl ContextBuilder {
    pub fn new(
        services: RuntimeServices,
        state_limits: StateConfig,
        default_tenant: impl Into<String>,
    ) -> Self {
        Self {
            services,
            state_limits,
            default_tenant: default_tenant.into(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn build(
        &self,
        agent: &AgentConfig,
        input: &Value,
        options: &CallOptions,
        execution: Arc<dyn ExecutionHandle>,
    ) -> Result<AgentContext> {
        let thread = match options.thread {
            Some(ref thread) => thread.clone(),
            None => Thread::new(IdGenerator::thread_id())?,
        };
        let tenant_id = options
            .tenant_id
            .clone()
            .unwrap_or_else(|| self.default_tenant.clone());
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(IdGenerator::correlation_id);

        let sessions = &self.services.sessions;
        let explicit = match options.session_id {
            Some(ref id) => sessions.get_session_context(id).await?,
            None => None,
        };
        let session = match explicit {
            Some(session) => session,
            None => {
                let found = sessions
                    .find_session_by_thread(thread.id.as_str(), &tenant_id)
                    .await?;
                let session_id = match found {
                    Some(s) => s.id,
                    None => {
                        let mut meta = Map::new();
                        meta.insert("agentName".into(), json!(agent.name));
                        sessions
                            .create_session(&tenant_id, thread.id.as_str(), meta)
                            .await?
                            .id
                    }
                };
                sessions
                    .get_session_context(&session_id)
                    .await?
                    .ok_or_else(|| {
                        FlowError::Session(format!(
                            "session {} vanished during context build",
                            session_id
                        ))
                    })?
            }
        };

        debug!(
            agent = %agent.name,
            thread_id = %thread.id,
            session_id = %session.session_id,
            "agent context built"
        );

        Ok(AgentContext {
            agent_name: agent.name.clone(),
            invocation_id: IdGenerator::invocation_id(),
            tenant_id,
            correlation_id,
            thread,
            session_id: session.session_id,
            identity: agent.identity.clone(),
            max_iterations: agent.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            input: input.clone(),
            state: Arc::new(InMemoryStateService::from_config(&self.state_limits)),
            memory: Arc::clone(&self.services.memory),
            sessions: Arc::clone(&self.services.sessions),
            user: options.user_context.clone().unwrap_or_default(),
            system: Mutex::new(SystemContext {
                iteration: 0,
                tools_used: 0,
                conversation_history: session.conversation_history,
                status: UnifiedStatus::Pending,
                started_at: self.clock.now(),
            }),
            cancel: CancellationToken::new(),
            execution,
        })
    }
}
