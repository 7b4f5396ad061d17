use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use flow_config::FlowConfig;
use flow_core::{
    Event, EventBus, FlowError, HealthReport, IdGenerator, LlmAdapter, McpAdapter, Result,
    SharedClock, Thread, ToolDefinition, system_clock,
};
use flow_memory::MemoryItem;

use crate::agent::{
    AgentConfig, AgentDefinition, AgentEngine, AgentExecutor, AgentMode, AgentOutcome,
    AgentRunner, AgentThink, PassthroughThink,
};
use crate::context::{AgentContext, CallOptions, ContextBuilder, ExecutionHandle};
use crate::execution::{ContextValueUpdate, ExecutionOutcome, ExecutionRuntime};
use crate::llm::LlmThink;
use crate::mcp::McpBridge;
use crate::registry::RuntimeRegistry;
use crate::services::RuntimeServices;
use crate::tools::{ToolConfig, ToolEngine};

// ── Drop safety ────────────────────────────────────────────────

/// Ends the execution as cancelled when a `call_agent` future is dropped
/// between start and end, so the thread is usable again.
struct RunGuard {
    handle: Arc<dyn ExecutionHandle>,
    cancel: tokio_util::sync::CancellationToken,
    execution_id: String,
    armed: bool,
}

impl RunGuard {
    fn new(ctx: &AgentContext, execution_id: &str) -> Self {
        Self {
            handle: Arc::clone(ctx.execution()),
            cancel: ctx.cancellation_token(),
            execution_id: execution_id.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        match self
            .handle
            .end(&self.execution_id, ExecutionOutcome::failed("cancelled: call dropped"))
        {
            Ok(_) => warn!(execution_id = %self.execution_id, "call dropped mid-run, execution ended"),
            Err(e) => debug!(execution_id = %self.execution_id, error = %e, "dropped call left nothing to end"),
        }
    }
}

// ── Result envelope ────────────────────────────────────────────

/// Identifiers that tie a result back to the call that produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub tenant_id: String,
}

/// What every public call returns. Failures are carried as values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub context: ResultContext,
    /// Wall time in milliseconds.
    pub duration: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl OrchestrationResult {
    fn succeeded(
        result: Value,
        context: ResultContext,
        started: Instant,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            error_code: None,
            context,
            duration: started.elapsed().as_millis() as u64,
            metadata,
        }
    }

    fn failed(err: &FlowError, context: ResultContext, started: Instant) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(err.to_string()),
            error_code: Some(err.code().to_string()),
            context,
            duration: started.elapsed().as_millis() as u64,
            metadata: Map::new(),
        }
    }
}

// ── Agent bookkeeping ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUsage {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_called_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub definition: AgentDefinition,
    pub usage: AgentUsage,
    pub has_custom_think: bool,
}

struct AgentData {
    instance: Arc<dyn AgentRunner>,
    definition: AgentDefinition,
    config: AgentConfig,
    usage: Mutex<AgentUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub tenant_id: String,
    pub agents: usize,
    pub tools: usize,
    pub threads: usize,
    pub total_calls: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp: Option<String>,
    pub mcp_connected: bool,
}

// ── Orchestrator ───────────────────────────────────────────────

/// Public entry point: agent and tool registration, dispatch, and MCP.
pub struct Orchestrator {
    config: FlowConfig,
    services: RuntimeServices,
    registry: Arc<RuntimeRegistry>,
    builder: ContextBuilder,
    tools: Arc<ToolEngine>,
    agents: RwLock<HashMap<String, Arc<AgentData>>>,
    events: EventBus,
    clock: SharedClock,
    llm: Option<Arc<dyn LlmAdapter>>,
    mcp: Option<McpBridge>,
}

impl Orchestrator {
    /// Build with services selected by `config`.
    pub fn new(config: &FlowConfig) -> Result<Self> {
        let services = RuntimeServices::from_config(config)?;
        Ok(Self::with_services(config.clone(), services, system_clock()))
    }

    pub fn with_services(config: FlowConfig, services: RuntimeServices, clock: SharedClock) -> Self {
        let events = EventBus::new(config.orchestrator.event_capacity);
        let registry = Arc::new(
            RuntimeRegistry::new(
                services.clone(),
                config.registry.clone(),
                config.runtime.clone(),
                events.clone(),
            )
            .with_clock(Arc::clone(&clock)),
        );
        let builder = ContextBuilder::new(
            services.clone(),
            config.state.clone(),
            config.orchestrator.tenant_id.clone(),
        )
        .with_clock(Arc::clone(&clock));
        let tools = Arc::new(ToolEngine::new(
            config.orchestrator.default_timeout(),
            events.clone(),
        ));

        info!(
            tenant_id = %config.orchestrator.tenant_id,
            memory = %services.memory.name(),
            "orchestrator ready"
        );
        Self {
            config,
            services,
            registry,
            builder,
            tools,
            agents: RwLock::new(HashMap::new()),
            events,
            clock,
            llm: None,
            mcp: None,
        }
    }

    /// Agents registered without a think function after this call reason
    /// through `adapter`.
    pub fn with_llm(mut self, adapter: Arc<dyn LlmAdapter>) -> Self {
        self.llm = Some(adapter);
        self
    }

    pub fn with_mcp(mut self, adapter: Arc<dyn McpAdapter>) -> Self {
        self.mcp = Some(McpBridge::new(adapter, self.events.clone()));
        self
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn tools(&self) -> &Arc<ToolEngine> {
        &self.tools
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    // ── Agents ─────────────────────────────────────────────────

    /// Register an agent, replacing any agent of the same name.
    pub fn create_agent(&self, config: AgentConfig) -> Result<AgentDefinition> {
        config.validate()?;

        let mut config = config;
        let max_iterations = config
            .max_iterations
            .unwrap_or(self.config.orchestrator.default_max_iterations);
        config.max_iterations = Some(max_iterations);
        let timeout_ms = config
            .timeout_ms
            .unwrap_or(self.config.orchestrator.default_timeout_ms);

        let think = self.resolve_think(&config);
        let tools = Arc::clone(&self.tools);
        let instance: Arc<dyn AgentRunner> = match config.mode {
            AgentMode::Simple => Arc::new(AgentEngine::new(
                config.name.clone(),
                think,
                tools,
                self.events.clone(),
            )),
            AgentMode::Workflow => Arc::new(AgentExecutor::new(
                config.name.clone(),
                think,
                tools,
                self.events.clone(),
            )),
        };

        let definition = AgentDefinition {
            name: config.name.clone(),
            mode: config.mode,
            identity: config.identity.clone(),
            max_iterations,
            timeout_ms,
            created_at: self.clock.now(),
        };
        let data = Arc::new(AgentData {
            instance,
            definition: definition.clone(),
            config,
            usage: Mutex::new(AgentUsage::default()),
        });

        let replaced = self
            .agents
            .write()
            .insert(definition.name.clone(), data)
            .is_some();
        if replaced {
            warn!(agent = %definition.name, "agent re-registered, previous definition replaced");
        } else {
            info!(agent = %definition.name, mode = definition.mode.as_str(), "agent registered");
        }
        self.events.publish(Event::AgentRegistered {
            agent_name: definition.name.clone(),
            mode: definition.mode.as_str().to_string(),
        });
        Ok(definition)
    }

    fn resolve_think(&self, config: &AgentConfig) -> Arc<dyn AgentThink> {
        if let Some(ref think) = config.think {
            return Arc::clone(think);
        }
        match self.llm {
            Some(ref llm) => Arc::new(LlmThink::new(Arc::clone(llm), Arc::clone(&self.tools))),
            None => {
                debug!(agent = %config.name, "no think function or LLM, answering with input");
                Arc::new(PassthroughThink)
            }
        }
    }

    /// Run `name` once against `input`. Never fails: errors come back inside
    /// the envelope.
    pub async fn call_agent(
        &self,
        name: &str,
        input: Value,
        options: CallOptions,
    ) -> OrchestrationResult {
        let started = Instant::now();
        let mut context = ResultContext {
            correlation_id: options
                .correlation_id
                .clone()
                .unwrap_or_else(IdGenerator::correlation_id),
            tenant_id: options
                .tenant_id
                .clone()
                .unwrap_or_else(|| self.config.orchestrator.tenant_id.clone()),
            agent_name: Some(name.to_string()),
            ..Default::default()
        };

        let agent = self.agents.read().get(name).cloned();
        let Some(agent) = agent else {
            let err = FlowError::AgentNotFound(name.to_string());
            warn!(agent = name, "call to unknown agent");
            return OrchestrationResult::failed(&err, context, started);
        };

        let outcome = self.dispatch(&agent, input, options, &mut context).await;

        let mut usage = agent.usage.lock();
        usage.calls += 1;
        usage.last_called_at = Some(self.clock.now());
        match outcome {
            Ok(outcome) => {
                usage.successes += 1;
                let metadata = outcome_metadata(&outcome);
                OrchestrationResult::succeeded(outcome.output, context, started, metadata)
            }
            Err(e) => {
                usage.failures += 1;
                OrchestrationResult::failed(&e, context, started)
            }
        }
    }

    async fn dispatch(
        &self,
        agent: &AgentData,
        input: Value,
        options: CallOptions,
        context: &mut ResultContext,
    ) -> Result<AgentOutcome> {
        let name = agent.definition.name.as_str();
        let thread = match options.thread {
            Some(ref thread) => thread.clone(),
            None => Thread::new(IdGenerator::thread_id())?,
        };
        context.thread_id = Some(thread.id.as_str().to_string());
        let options = CallOptions {
            thread: Some(thread.clone()),
            tenant_id: Some(context.tenant_id.clone()),
            correlation_id: Some(context.correlation_id.clone()),
            ..options
        };

        let runtime = self.registry.get_by_thread(thread.id.as_str())?;
        let _run = runtime.lock_run().await;

        let handle: Arc<dyn ExecutionHandle> = runtime.clone();
        let ctx = self
            .builder
            .build(&agent.config, &input, &options, handle)
            .await?;
        context.session_id = Some(ctx.session_id.clone());

        let execution_id = IdGenerator::execution_id();
        context.execution_id = Some(execution_id.clone());
        ctx.execution().start(&execution_id, &ctx)?;
        let guard = RunGuard::new(&ctx, &execution_id);
        self.events.publish(Event::ExecutionStarted {
            execution_id: execution_id.clone(),
            agent_name: Some(name.to_string()),
        });
        self.events.publish(Event::AgentStarted {
            agent_name: name.to_string(),
            thread_id: thread.id.as_str().to_string(),
            correlation_id: ctx.correlation_id.clone(),
        });

        let result = match seed_context(&runtime, &ctx, &execution_id) {
            Ok(()) => self.run_with_timeout(agent, input.clone(), &ctx, &runtime).await,
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(ref o) => ExecutionOutcome::succeeded(o.output.clone()),
            Err(ref e) => ExecutionOutcome::failed(e.to_string()),
        };
        guard.disarm();
        match ctx.execution().end(&execution_id, outcome) {
            Ok(summary) => self.events.publish(Event::ExecutionEnded {
                execution_id: summary.execution_id,
                success: summary.success,
                duration_ms: summary.duration_ms,
            }),
            Err(e) => warn!(execution_id = %execution_id, error = %e, "failed to end execution"),
        }

        match result {
            Ok(ref o) => {
                self.events.publish(Event::AgentCompleted {
                    agent_name: name.to_string(),
                    correlation_id: ctx.correlation_id.clone(),
                    duration_ms: o.summary.duration_ms,
                });
                self.remember(&ctx, &input, &o.output).await;
            }
            Err(ref e) => {
                error!(agent = name, execution_id = %execution_id, error = %e, "agent call failed");
                self.events.publish(Event::AgentFailed {
                    agent_name: name.to_string(),
                    correlation_id: ctx.correlation_id.clone(),
                    error: e.to_string(),
                });
            }
        }

        if let Err(e) = ctx.cleanup().await {
            warn!(agent = name, error = %e, "context cleanup failed");
        }
        ctx.execution().cleanup();
        result
    }

    async fn run_with_timeout(
        &self,
        agent: &AgentData,
        input: Value,
        ctx: &AgentContext,
        runtime: &ExecutionRuntime,
    ) -> Result<AgentOutcome> {
        let timeout_ms = agent.definition.timeout_ms;
        let run = agent.instance.run(input, ctx, runtime);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
            Ok(result) => result,
            Err(_) => {
                ctx.cancel();
                Err(FlowError::Timeout {
                    operation: format!("agent '{}'", agent.definition.name),
                    timeout_ms,
                })
            }
        }
    }

    /// Record a successful exchange in the session and long-term memory.
    /// Failures here never fail the call.
    async fn remember(&self, ctx: &AgentContext, input: &Value, output: &Value) {
        if let Err(e) = ctx
            .sessions
            .add_conversation_entry(
                &ctx.session_id,
                input.clone(),
                output.clone(),
                Some(&ctx.agent_name),
            )
            .await
        {
            warn!(session_id = %ctx.session_id, error = %e, "failed to record conversation");
        }

        let item = MemoryItem::new("conversation", json!({ "input": input, "output": output }))
            .with_tenant(ctx.tenant_id.clone())
            .with_session(ctx.session_id.clone())
            .with_agent(ctx.agent_name.clone());
        if let Err(e) = ctx.memory.store(item).await {
            warn!(agent = %ctx.agent_name, error = %e, "failed to store memory item");
        }
    }

    pub fn list_agents(&self) -> Vec<AgentDefinition> {
        let mut agents: Vec<AgentDefinition> = self
            .agents
            .read()
            .values()
            .map(|a| a.definition.clone())
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn get_agent_status(&self, name: &str) -> Result<AgentStatus> {
        let agents = self.agents.read();
        let agent = agents
            .get(name)
            .ok_or_else(|| FlowError::AgentNotFound(name.to_string()))?;
        Ok(AgentStatus {
            definition: agent.definition.clone(),
            usage: agent.usage.lock().clone(),
            has_custom_think: agent.config.think.is_some(),
        })
    }

    // ── Tools ──────────────────────────────────────────────────

    pub fn create_tool(&self, config: ToolConfig) -> Result<ToolDefinition> {
        if config.name.trim().is_empty() {
            return Err(FlowError::Validation {
                field: "name".into(),
                reason: "tool name must not be empty".into(),
            });
        }
        let definition = config.definition();
        self.tools
            .register(definition.clone(), Arc::clone(&config.handler));
        Ok(definition)
    }

    pub async fn call_tool(&self, name: &str, input: Value) -> OrchestrationResult {
        let started = Instant::now();
        let context = ResultContext {
            correlation_id: IdGenerator::correlation_id(),
            tenant_id: self.config.orchestrator.tenant_id.clone(),
            tool_name: Some(name.to_string()),
            ..Default::default()
        };
        match self
            .tools
            .execute(name, input, Some(&context.correlation_id))
            .await
        {
            Ok(value) => OrchestrationResult::succeeded(value, context, started, Map::new()),
            Err(e) => OrchestrationResult::failed(&e, context, started),
        }
    }

    // ── MCP ────────────────────────────────────────────────────

    fn mcp(&self) -> Result<&McpBridge> {
        self.mcp
            .as_ref()
            .ok_or_else(|| FlowError::Mcp("no MCP adapter configured".into()))
    }

    pub async fn connect_mcp(&self) -> Result<()> {
        self.mcp()?.connect().await
    }

    pub async fn disconnect_mcp(&self) -> Result<()> {
        self.mcp()?.disconnect(&self.tools).await
    }

    pub async fn register_mcp_tools(&self) -> Result<Vec<ToolDefinition>> {
        self.mcp()?.register_tools(&self.tools).await
    }

    // ── Introspection ──────────────────────────────────────────

    pub fn get_stats(&self) -> OrchestratorStats {
        let agents = self.agents.read();
        OrchestratorStats {
            tenant_id: self.config.orchestrator.tenant_id.clone(),
            agents: agents.len(),
            tools: self.tools.len(),
            threads: self.registry.len(),
            total_calls: agents.values().map(|a| a.usage.lock().calls).sum(),
            llm: self.llm.as_ref().map(|l| l.name().to_string()),
            mcp: self.mcp.as_ref().map(McpBridge::provider),
            mcp_connected: self.mcp.as_ref().is_some_and(McpBridge::is_connected),
        }
    }

    pub async fn health(&self) -> HealthReport {
        self.services.health().await
    }

    /// Drop every runtime and disconnect MCP.
    pub async fn shutdown(&self) {
        if let Some(ref mcp) = self.mcp {
            if let Err(e) = mcp.disconnect(&self.tools).await {
                warn!(error = %e, "MCP disconnect failed during shutdown");
            }
        }
        self.registry.clear();
        self.events.publish(Event::Shutdown);
        info!("orchestrator shut down");
    }
}

/// Seed the value cache with what the agent may look up by path.
fn seed_context(runtime: &ExecutionRuntime, ctx: &AgentContext, execution_id: &str) -> Result<()> {
    let identity = serde_json::to_value(&ctx.identity)?;
    let mut updates = vec![
        ContextValueUpdate::new("agent", "name", json!(ctx.agent_name)),
        ContextValueUpdate::new("agent", "identity", identity),
        ContextValueUpdate::new("execution", "id", json!(execution_id)),
        ContextValueUpdate::new("execution", "correlationId", json!(ctx.correlation_id)),
        ContextValueUpdate::new("session", "id", json!(ctx.session_id)),
        ContextValueUpdate::new("session", "tenantId", json!(ctx.tenant_id)),
    ];
    updates.extend(
        ctx.user()
            .iter()
            .map(|(k, v)| ContextValueUpdate::new("user", k.clone(), v.clone())),
    );
    for update in updates {
        runtime.add_context_value(update)?;
    }
    Ok(())
}

fn outcome_metadata(outcome: &AgentOutcome) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("iterations".into(), json!(outcome.summary.iterations));
    metadata.insert("toolCalls".into(), json!(outcome.summary.tool_calls));
    metadata.insert("errors".into(), json!(outcome.summary.errors));
    if let Some(ref plan) = outcome.plan {
        metadata.insert("planId".into(), json!(plan.id));
        metadata.insert("planSteps".into(), json!(plan.steps.len()));
        metadata.insert("planStatus".into(), json!(plan.status));
    }
    metadata
}
