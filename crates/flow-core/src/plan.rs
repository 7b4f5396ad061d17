use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::status::{StatusMachine, UnifiedStatus};

/// A step in an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    pub status: UnifiedStatus,
    /// Tool this step intends to call, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Ids of steps that must finish before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanStep {
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            status: UnifiedStatus::Pending,
            tool: None,
            depends_on: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Move to `to` through the central validator.
    pub fn transition(&mut self, to: UnifiedStatus) -> Result<()> {
        StatusMachine::transition(&mut self.status, to)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn is_done(&self) -> bool {
        matches!(
            self.status,
            UnifiedStatus::Completed | UnifiedStatus::Skipped | UnifiedStatus::FinalAnswerResult
        )
    }
}

/// A DAG of plan steps plus the plan's own status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub goal: String,
    pub status: UnifiedStatus,
    pub steps: Vec<PlanStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn new(goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            status: UnifiedStatus::Pending,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_steps(mut self, steps: Vec<PlanStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn add_step(&mut self, step: PlanStep) -> &PlanStep {
        self.steps.push(step);
        self.updated_at = Utc::now();
        &self.steps[self.steps.len() - 1]
    }

    pub fn step(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Check that every dependency exists and the graph has no cycles.
    pub fn validate(&self) -> Result<()> {
        let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        if ids.len() != self.steps.len() {
            return Err(FlowError::Validation {
                field: "plan.steps".into(),
                reason: "duplicate step id".into(),
            });
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(FlowError::Validation {
                        field: format!("plan.steps.{}.depends_on", step.id),
                        reason: format!("unknown step '{dep}'"),
                    });
                }
            }
        }

        // Kahn's algorithm over distinct edges: anything left over sits on a cycle.
        let mut indegree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| {
                let distinct: HashSet<&str> = s.depends_on.iter().map(String::as_str).collect();
                (s.id.as_str(), distinct.len())
            })
            .collect();
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = ready.pop() {
            visited += 1;
            for step in self.steps.iter().filter(|s| s.depends_on.iter().any(|d| d == id)) {
                if let Some(d) = indegree.get_mut(step.id.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(step.id.as_str());
                    }
                }
            }
        }
        if visited != self.steps.len() {
            return Err(FlowError::Validation {
                field: "plan.steps".into(),
                reason: "dependency cycle detected".into(),
            });
        }
        Ok(())
    }

    /// First pending step whose dependencies are all done.
    pub fn next_ready_step(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|step| {
            step.status == UnifiedStatus::Pending
                && step.depends_on.iter().all(|dep| {
                    self.step(dep).map(PlanStep::is_done).unwrap_or(false)
                })
        })
    }

    pub fn transition_step(&mut self, step_id: &str, to: UnifiedStatus) -> Result<()> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| FlowError::InvalidArgument(format!("unknown plan step '{step_id}'")))?;
        step.transition(to)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn transition(&mut self, to: UnifiedStatus) -> Result<()> {
        StatusMachine::transition(&mut self.status, to)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Fraction of steps that are done (0.0 for an empty plan).
    pub fn progress(&self) -> f32 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let done = self.steps.iter().filter(|s| s.is_done()).count();
        done as f32 / self.steps.len() as f32
    }

    pub fn is_complete(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(PlanStep::is_done)
    }
}
