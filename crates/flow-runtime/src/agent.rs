use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use flow_core::{
    ContextSource, Event, EventBus, ExecutionPlan, FlowError, PlanStep, Result, UnifiedStatus,
};

use crate::context::AgentContext;
use crate::execution::ExecutionRuntime;
use crate::planner::{
    ActionResult, AgentAction, AgentThought, PlannerExecutionContext, PlannerResult,
    ResultAnalysis, StepExecution,
};
use crate::tools::ToolEngine;

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Who the agent is. At least one of role, goal, description or expertise
/// must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expertise: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl AgentIdentity {
    pub fn role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        fn blank(field: &Option<String>) -> bool {
            field.as_deref().map(str::trim).unwrap_or_default().is_empty()
        }
        blank(&self.role)
            && blank(&self.goal)
            && blank(&self.description)
            && self.expertise.iter().all(|e| e.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Plain think → act loop.
    #[default]
    Simple,
    /// Think → act loop that tracks every action as a plan step.
    Workflow,
}

impl AgentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::Simple => "simple",
            AgentMode::Workflow => "workflow",
        }
    }
}

/// Decision logic for one agent.
#[async_trait]
pub trait AgentThink: Send + Sync {
    async fn think(
        &self,
        input: &Value,
        planner: &PlannerExecutionContext,
        ctx: &AgentContext,
    ) -> Result<AgentThought>;
}

/// Adapts an async closure over `(input, history)` into an [`AgentThink`].
pub struct FnThink<F>(pub F);

#[async_trait]
impl<F, Fut> AgentThink for FnThink<F>
where
    F: Fn(Value, Vec<StepExecution>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<AgentThought>> + Send,
{
    async fn think(
        &self,
        input: &Value,
        planner: &PlannerExecutionContext,
        _ctx: &AgentContext,
    ) -> Result<AgentThought> {
        (self.0)(input.clone(), planner.history()).await
    }
}

/// Answers with the input unchanged. Used when an agent has neither its own
/// think function nor an LLM to fall back on.
pub struct PassthroughThink;

#[async_trait]
impl AgentThink for PassthroughThink {
    async fn think(
        &self,
        input: &Value,
        _planner: &PlannerExecutionContext,
        _ctx: &AgentContext,
    ) -> Result<AgentThought> {
        Ok(AgentThought::final_answer(input.clone()).with_reasoning("passthrough"))
    }
}

/// Registration input for `create_agent`.
#[derive(Clone)]
pub struct AgentConfig {
    pub name: String,
    pub identity: AgentIdentity,
    pub mode: AgentMode,
    pub max_iterations: Option<u32>,
    /// Dispatch timeout; the orchestrator default applies when unset.
    pub timeout_ms: Option<u64>,
    pub think: Option<Arc<dyn AgentThink>>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, identity: AgentIdentity) -> Self {
        Self {
            name: name.into(),
            identity,
            mode: AgentMode::Simple,
            max_iterations: None,
            timeout_ms: None,
            think: None,
        }
    }

    pub fn with_mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_think(mut self, think: impl AgentThink + 'static) -> Self {
        self.think = Some(Arc::new(think));
        self
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FlowError::Validation {
                field: "name".into(),
                reason: "agent name must not be empty".into(),
            });
        }
        if self.identity.is_empty() {
            return Err(FlowError::Validation {
                field: "identity".into(),
                reason: "at least one of role, goal, description or expertise is required".into(),
            });
        }
        if self.max_iterations == Some(0) {
            return Err(FlowError::Validation {
                field: "max_iterations".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Public description of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub name: String,
    pub mode: AgentMode,
    pub identity: AgentIdentity,
    pub max_iterations: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// What a runner hands back to the orchestrator.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub output: Value,
    pub summary: PlannerResult,
    pub plan: Option<ExecutionPlan>,
}

/// Runs one invocation of an agent against a thread's runtime.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    fn mode(&self) -> AgentMode;

    async fn run(
        &self,
        input: Value,
        ctx: &AgentContext,
        runtime: &ExecutionRuntime,
    ) -> Result<AgentOutcome>;
}

pub(crate) fn input_text(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Shared think → act loop ────────────────────────────────────

trait StepTracker: Send {
    fn begin(&mut self, thought: &AgentThought) -> Result<()>;
    fn finish(&mut self, result: &ActionResult) -> Result<()>;
}

struct NoTracking;

impl StepTracker for NoTracking {
    fn begin(&mut self, _thought: &AgentThought) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, _result: &ActionResult) -> Result<()> {
        Ok(())
    }
}

struct AgentCore {
    name: String,
    think: Arc<dyn AgentThink>,
    tools: Arc<ToolEngine>,
    events: EventBus,
}

impl AgentCore {
    async fn drive(
        &self,
        input: &Value,
        ctx: &AgentContext,
        runtime: &ExecutionRuntime,
        tracker: &mut dyn StepTracker,
    ) -> Result<AgentOutcome> {
        let planner = runtime
            .build_planner_context(&input_text(input), ctx)
            .await?;
        ctx.set_status(UnifiedStatus::Executing)?;

        let result = self.iterate(input, ctx, runtime, &planner, tracker).await;

        if let Err(e) = runtime.persist_planner_history(&planner).await {
            warn!(agent = %self.name, error = %e, "failed to persist planner history");
        }
        let status = match &result {
            Ok(_) => UnifiedStatus::Completed,
            Err(FlowError::Cancelled(_)) => UnifiedStatus::Cancelled,
            Err(_) => UnifiedStatus::Failed,
        };
        ctx.set_status(status)?;

        result.map(|output| AgentOutcome {
            output,
            summary: planner.get_final_result(),
            plan: None,
        })
    }

    async fn iterate(
        &self,
        input: &Value,
        ctx: &AgentContext,
        runtime: &ExecutionRuntime,
        planner: &PlannerExecutionContext,
        tracker: &mut dyn StepTracker,
    ) -> Result<Value> {
        loop {
            if ctx.is_cancelled() {
                return Err(FlowError::Cancelled(format!("agent '{}'", self.name)));
            }
            if planner.iterations() >= planner.max_iterations {
                return Err(FlowError::MaxIterations(planner.max_iterations));
            }

            let iteration = ctx.record_iteration();
            self.events.publish(Event::AgentThinking {
                agent_name: self.name.clone(),
                execution_id: planner.execution_id.clone(),
                iteration,
            });

            let thought = self.think.think(input, planner, ctx).await?;
            runtime.append(
                ContextSource::Agent,
                json!({
                    "type": "agent_thought",
                    "iteration": iteration,
                    "reasoning": thought.reasoning,
                    "action": thought.action,
                }),
            )?;
            tracker.begin(&thought)?;

            match thought.action.clone() {
                AgentAction::ToolCall { tool_name, input: args } => {
                    ctx.record_tool_use();
                    let (result, observation) = match self
                        .tools
                        .execute(&tool_name, args, Some(&ctx.correlation_id))
                        .await
                    {
                        Ok(content) => (
                            ActionResult::ToolResult { content },
                            ResultAnalysis::continue_with(true, format!("{tool_name} succeeded")),
                        ),
                        Err(e) => (
                            ActionResult::Error {
                                error: e.to_string(),
                            },
                            ResultAnalysis::continue_with(false, format!("{tool_name} failed")),
                        ),
                    };
                    runtime.append(
                        ContextSource::Tool,
                        json!({ "type": "tool_result", "toolName": tool_name, "result": result }),
                    )?;
                    tracker.finish(&result)?;
                    planner.update(thought, result, observation);
                }
                AgentAction::FinalAnswer { content } => {
                    let result = ActionResult::FinalAnswer {
                        content: content.clone(),
                    };
                    runtime.append(
                        ContextSource::Agent,
                        json!({ "type": "final_answer", "content": content }),
                    )?;
                    tracker.finish(&result)?;
                    planner.update(thought, result, ResultAnalysis::complete());
                    debug!(agent = %self.name, iteration, "final answer");
                    return Ok(content);
                }
            }
        }
    }
}

// ── Simple runner ──────────────────────────────────────────────

pub struct AgentEngine {
    core: AgentCore,
}

impl AgentEngine {
    pub fn new(
        name: impl Into<String>,
        think: Arc<dyn AgentThink>,
        tools: Arc<ToolEngine>,
        events: EventBus,
    ) -> Self {
        Self {
            core: AgentCore {
                name: name.into(),
                think,
                tools,
                events,
            },
        }
    }
}

#[async_trait]
impl AgentRunner for AgentEngine {
    fn mode(&self) -> AgentMode {
        AgentMode::Simple
    }

    async fn run(
        &self,
        input: Value,
        ctx: &AgentContext,
        runtime: &ExecutionRuntime,
    ) -> Result<AgentOutcome> {
        self.core.drive(&input, ctx, runtime, &mut NoTracking).await
    }
}

// ── Workflow runner ────────────────────────────────────────────

struct PlanTracker {
    plan: ExecutionPlan,
    current: Option<String>,
    execution_id: String,
    events: EventBus,
}

impl PlanTracker {
    fn move_step(&mut self, step_id: &str, to: UnifiedStatus) -> Result<()> {
        let from = self
            .plan
            .step(step_id)
            .map(|s| s.status)
            .unwrap_or(UnifiedStatus::Pending);
        self.plan.transition_step(step_id, to)?;
        self.events.publish(Event::StepTransition {
            execution_id: self.execution_id.clone(),
            step_id: step_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(())
    }
}

impl StepTracker for PlanTracker {
    fn begin(&mut self, thought: &AgentThought) -> Result<()> {
        let description = if thought.reasoning.is_empty() {
            thought.action.kind().to_string()
        } else {
            thought.reasoning.clone()
        };
        let mut step = PlanStep::new(description);
        if let AgentAction::ToolCall { ref tool_name, .. } = thought.action {
            step = step.with_tool(tool_name.clone());
        }
        let id = step.id.clone();
        self.plan.add_step(step);
        self.move_step(&id, UnifiedStatus::Executing)?;
        self.current = Some(id);
        Ok(())
    }

    fn finish(&mut self, result: &ActionResult) -> Result<()> {
        let Some(id) = self.current.take() else {
            return Ok(());
        };
        let (to, value, error) = match result {
            ActionResult::Error { error } => (UnifiedStatus::Failed, None, Some(error.clone())),
            ActionResult::ToolResult { content } | ActionResult::FinalAnswer { content } => {
                (UnifiedStatus::Completed, Some(content.clone()), None)
            }
        };
        if let Some(step) = self.plan.steps.iter_mut().find(|s| s.id == id) {
            step.result = value;
            step.error = error;
        }
        self.move_step(&id, to)
    }
}

/// Workflow runner: the same loop, with every action recorded as a plan
/// step whose status moves through the central state machine.
pub struct AgentExecutor {
    core: AgentCore,
}

impl AgentExecutor {
    pub fn new(
        name: impl Into<String>,
        think: Arc<dyn AgentThink>,
        tools: Arc<ToolEngine>,
        events: EventBus,
    ) -> Self {
        Self {
            core: AgentCore {
                name: name.into(),
                think,
                tools,
                events,
            },
        }
    }
}

#[async_trait]
impl AgentRunner for AgentExecutor {
    fn mode(&self) -> AgentMode {
        AgentMode::Workflow
    }

    async fn run(
        &self,
        input: Value,
        ctx: &AgentContext,
        runtime: &ExecutionRuntime,
    ) -> Result<AgentOutcome> {
        let execution_id = runtime
            .current_execution_id()
            .ok_or(FlowError::NotRunning)?;
        let mut plan = ExecutionPlan::new(input_text(&input));
        plan.transition(UnifiedStatus::Executing)?;

        let mut tracker = PlanTracker {
            plan,
            current: None,
            execution_id,
            events: self.core.events.clone(),
        };
        let result = self.core.drive(&input, ctx, runtime, &mut tracker).await;

        // A step can be left executing when the loop bailed out mid-action.
        if let Some(id) = tracker.current.take() {
            tracker.move_step(&id, UnifiedStatus::Failed)?;
        }
        let mut plan = tracker.plan;
        plan.transition(if result.is_ok() {
            UnifiedStatus::Completed
        } else {
            UnifiedStatus::Failed
        })?;

        runtime.append(
            ContextSource::System,
            json!({
                "type": "plan_finished",
                "status": plan.status,
                "progress": plan.progress(),
                "plan": plan,
            }),
        )?;

        result.map(|mut outcome| {
            outcome.plan = Some(plan);
            outcome
        })
    }
}
