use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use flow_core::{LlmAdapter, LlmMessage, LlmRequest, Result};

use crate::agent::{AgentIdentity, AgentThink, input_text};
use crate::context::AgentContext;
use crate::planner::{ActionResult, AgentAction, AgentThought, PlannerExecutionContext};
use crate::tools::ToolEngine;

/// Think step backed by an [`LlmAdapter`].
///
/// The model is expected to reply with a JSON action; anything that does not
/// parse as one is taken as the final answer verbatim.
pub struct LlmThink {
    adapter: Arc<dyn LlmAdapter>,
    tools: Arc<ToolEngine>,
    max_tokens: u32,
    temperature: f32,
}

impl LlmThink {
    pub fn new(adapter: Arc<dyn LlmAdapter>, tools: Arc<ToolEngine>) -> Self {
        Self {
            adapter,
            tools,
            max_tokens: 4096,
            temperature: 0.2,
        }
    }

    fn system_prompt(identity: &AgentIdentity) -> String {
        let mut prompt = String::new();
        if let Some(ref role) = identity.role {
            prompt.push_str(&format!("Role: {role}\n"));
        }
        if let Some(ref goal) = identity.goal {
            prompt.push_str(&format!("Goal: {goal}\n"));
        }
        if let Some(ref description) = identity.description {
            prompt.push_str(&format!("{description}\n"));
        }
        if !identity.expertise.is_empty() {
            prompt.push_str(&format!("Expertise: {}\n", identity.expertise.join(", ")));
        }
        prompt.push_str(
            "Reply with JSON: {\"type\":\"tool_call\",\"tool_name\":...,\"input\":{...}} \
             or {\"type\":\"final_answer\",\"content\":...}.",
        );
        prompt
    }
}

#[async_trait]
impl AgentThink for LlmThink {
    async fn think(
        &self,
        input: &Value,
        planner: &PlannerExecutionContext,
        ctx: &AgentContext,
    ) -> Result<AgentThought> {
        let mut messages = vec![LlmMessage::user(input_text(input))];
        for step in planner.history() {
            messages.push(LlmMessage::assistant(serde_json::to_string(
                &step.thought.action,
            )?));
            let observation = match step.result {
                ActionResult::ToolResult { content } | ActionResult::FinalAnswer { content } => {
                    content.to_string()
                }
                ActionResult::Error { error } => format!("error: {error}"),
            };
            messages.push(LlmMessage::user(observation));
        }

        let request = LlmRequest {
            system: Some(Self::system_prompt(&ctx.identity)),
            messages,
            tools: self.tools.list(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let response = self.adapter.execute(&request).await?;
        debug!(
            model = %self.adapter.name(),
            tokens = response.usage.total_tokens(),
            "llm think"
        );
        Ok(parse_thought(&response.content))
    }
}

/// Read an action out of a model reply.
pub fn parse_thought(reply: &str) -> AgentThought {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        let reasoning = obj
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Ok(action) = serde_json::from_value::<AgentAction>(Value::Object(obj.clone())) {
            return AgentThought { reasoning, action };
        }
        if let Some(action) = obj
            .get("action")
            .and_then(|a| serde_json::from_value::<AgentAction>(a.clone()).ok())
        {
            return AgentThought { reasoning, action };
        }
    }
    AgentThought::final_answer(Value::String(trimmed.to_string()))
}
