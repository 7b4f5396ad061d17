use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use flow_core::SharedClock;
use flow_memory::ConversationEntry;

use crate::agent::AgentIdentity;

/// What the agent decided to do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentAction {
    ToolCall {
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    FinalAnswer {
        content: Value,
    },
}

impl AgentAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentAction::ToolCall { .. } => "tool_call",
            AgentAction::FinalAnswer { .. } => "final_answer",
        }
    }
}

/// Output of one think step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentThought {
    pub reasoning: String,
    pub action: AgentAction,
}

impl AgentThought {
    pub fn final_answer(content: impl Into<Value>) -> Self {
        Self {
            reasoning: String::new(),
            action: AgentAction::FinalAnswer {
                content: content.into(),
            },
        }
    }

    pub fn tool_call(tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            reasoning: String::new(),
            action: AgentAction::ToolCall {
                tool_name: tool_name.into(),
                input,
            },
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionResult {
    ToolResult { content: Value },
    FinalAnswer { content: Value },
    Error { error: String },
}

impl ActionResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ActionResult::Error { .. })
    }
}

/// The planner's reading of an action result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultAnalysis {
    pub is_complete: bool,
    pub is_successful: bool,
    pub should_continue: bool,
    #[serde(default)]
    pub feedback: String,
}

impl ResultAnalysis {
    pub fn complete() -> Self {
        Self {
            is_complete: true,
            is_successful: true,
            should_continue: false,
            feedback: String::new(),
        }
    }

    pub fn continue_with(successful: bool, feedback: impl Into<String>) -> Self {
        Self {
            is_complete: false,
            is_successful: successful,
            should_continue: true,
            feedback: feedback.into(),
        }
    }
}

/// One think → act → observe entry of planner history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub thought: AgentThought,
    pub result: ActionResult,
    pub observation: ResultAnalysis,
    pub timestamp: DateTime<Utc>,
}

// ── Execution hints ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    Formal,
    Casual,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHints {
    pub urgency: Level,
    pub verbosity: Level,
    pub style: Style,
    pub risk_tolerance: Level,
}

impl ExecutionHints {
    /// Urgency comes from the input text; the rest from the agent's
    /// personality and style.
    pub fn derive(input: &str, identity: &AgentIdentity) -> Self {
        let input = input.to_lowercase();
        let urgency = if contains_any(&input, &["urgent", "quickly"]) {
            Level::High
        } else if contains_any(&input, &["when possible", "eventually"]) {
            Level::Low
        } else {
            Level::Medium
        };

        let persona = format!(
            "{} {}",
            identity.personality.as_deref().unwrap_or_default(),
            identity.style.as_deref().unwrap_or_default()
        )
        .to_lowercase();

        let verbosity = if contains_any(&persona, &["detailed", "verbose", "thorough"]) {
            Level::High
        } else if contains_any(&persona, &["concise", "brief", "terse"]) {
            Level::Low
        } else {
            Level::Medium
        };

        let style = if contains_any(&persona, &["casual", "friendly", "informal"]) {
            Style::Casual
        } else if persona.contains("formal") {
            Style::Formal
        } else {
            Style::Neutral
        };

        let risk_tolerance = if contains_any(&persona, &["cautious", "careful"]) {
            Level::Low
        } else if contains_any(&persona, &["bold", "adventurous"]) {
            Level::High
        } else {
            Level::Medium
        };

        Self {
            urgency,
            verbosity,
            style,
            risk_tolerance,
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

// ── Planner context ────────────────────────────────────────────

/// Summary of one planner run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub iterations: u32,
    pub tool_calls: usize,
    pub errors: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// The planning view of one execution.
///
/// History loaded from earlier runs is visible through [`history`] but the
/// iteration, tool-call and error counts in [`get_final_result`] only cover
/// entries recorded by this run.
///
/// [`history`]: PlannerExecutionContext::history
/// [`get_final_result`]: PlannerExecutionContext::get_final_result
pub struct PlannerExecutionContext {
    pub input: String,
    pub execution_id: String,
    pub thread_id: String,
    pub agent_name: String,
    pub max_iterations: u32,
    pub hints: ExecutionHints,
    /// Snapshot of the runtime's context values, `type -> key -> value`.
    pub context: Map<String, Value>,
    history: Mutex<Vec<StepExecution>>,
    prior_len: usize,
    started_at: DateTime<Utc>,
    clock: SharedClock,
}

impl PlannerExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        input: String,
        execution_id: String,
        thread_id: String,
        agent_name: String,
        max_iterations: u32,
        hints: ExecutionHints,
        context: Map<String, Value>,
        history: Vec<StepExecution>,
        clock: SharedClock,
    ) -> Self {
        Self {
            input,
            execution_id,
            thread_id,
            agent_name,
            max_iterations,
            hints,
            context,
            prior_len: history.len(),
            history: Mutex::new(history),
            started_at: clock.now(),
            clock,
        }
    }

    pub fn update(&self, thought: AgentThought, result: ActionResult, observation: ResultAnalysis) {
        self.history.lock().push(StepExecution {
            thought,
            result,
            observation,
            timestamp: self.clock.now(),
        });
    }

    pub fn history(&self) -> Vec<StepExecution> {
        self.history.lock().clone()
    }

    /// Entries recorded by this run.
    pub fn iterations(&self) -> u32 {
        (self.history.lock().len() - self.prior_len) as u32
    }

    pub fn has_prior_history(&self) -> bool {
        self.prior_len > 0
    }

    pub fn get_final_result(&self) -> PlannerResult {
        let history = self.history.lock();
        let run = &history[self.prior_len..];

        let last = run.last();
        let success = last
            .map(|s| s.observation.is_complete && s.observation.is_successful)
            .unwrap_or(false);
        let result = last.and_then(|s| match &s.result {
            ActionResult::FinalAnswer { content } => Some(content.clone()),
            _ => None,
        });

        PlannerResult {
            success,
            result,
            iterations: run.len() as u32,
            tool_calls: run
                .iter()
                .filter(|s| matches!(s.thought.action, AgentAction::ToolCall { .. }))
                .count(),
            errors: run.iter().filter(|s| s.result.is_error()).count(),
            started_at: self.started_at,
            duration_ms: (self.clock.now() - self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        }
    }
}

/// Fold a session's conversation into one synthetic history entry.
pub(crate) fn history_from_conversation(
    entries: &[ConversationEntry],
) -> Option<StepExecution> {
    let last = entries.last()?;
    let turns: Vec<Value> = entries
        .iter()
        .map(|e| json!({ "input": e.input, "output": e.output }))
        .collect();

    Some(StepExecution {
        thought: AgentThought::final_answer(Value::Array(turns.clone())).with_reasoning(format!(
            "Previous conversation ({} turns)",
            entries.len()
        )),
        result: ActionResult::FinalAnswer {
            content: Value::Array(turns),
        },
        observation: ResultAnalysis::complete(),
        timestamp: last.timestamp,
    })
}
