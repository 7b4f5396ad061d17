//! The plan/step status vocabulary and its legal-transition table.
//!
//! Every status change in the runtime goes through [`StatusMachine`]; callers
//! never compare statuses by hand to decide whether a move is allowed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Replanning,
    WaitingInput,
    Paused,
    Cancelled,
    Skipped,
    Rewriting,
    Observing,
    Parallel,
    Stagnated,
    Timeout,
    Deadlock,
    FinalAnswerResult,
}

impl UnifiedStatus {
    pub const ALL: [UnifiedStatus; 16] = [
        UnifiedStatus::Pending,
        UnifiedStatus::Executing,
        UnifiedStatus::Completed,
        UnifiedStatus::Failed,
        UnifiedStatus::Replanning,
        UnifiedStatus::WaitingInput,
        UnifiedStatus::Paused,
        UnifiedStatus::Cancelled,
        UnifiedStatus::Skipped,
        UnifiedStatus::Rewriting,
        UnifiedStatus::Observing,
        UnifiedStatus::Parallel,
        UnifiedStatus::Stagnated,
        UnifiedStatus::Timeout,
        UnifiedStatus::Deadlock,
        UnifiedStatus::FinalAnswerResult,
    ];

    /// Statuses reachable in one step from `self`.
    pub fn allowed_transitions(self) -> &'static [UnifiedStatus] {
        use UnifiedStatus::*;
        match self {
            Pending => &[Executing, Cancelled, Skipped],
            Executing => &[
                Completed,
                Failed,
                Replanning,
                WaitingInput,
                Paused,
                Cancelled,
                Rewriting,
                Observing,
                Parallel,
                Stagnated,
                Timeout,
                Deadlock,
            ],
            Failed => &[Replanning, Cancelled],
            Replanning => &[Executing, Failed, Cancelled],
            WaitingInput => &[Executing, Cancelled],
            Paused => &[Executing, Cancelled],
            Rewriting | Observing | Parallel | Stagnated => &[Executing, Failed, Cancelled],
            Timeout | Deadlock => &[Replanning, Cancelled],
            Completed | Cancelled | Skipped | FinalAnswerResult => &[],
        }
    }

    pub fn can_transition_to(self, to: UnifiedStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        use UnifiedStatus::*;
        match self {
            Pending => "pending",
            Executing => "executing",
            Completed => "completed",
            Failed => "failed",
            Replanning => "replanning",
            WaitingInput => "waiting_input",
            Paused => "paused",
            Cancelled => "cancelled",
            Skipped => "skipped",
            Rewriting => "rewriting",
            Observing => "observing",
            Parallel => "parallel",
            Stagnated => "stagnated",
            Timeout => "timeout",
            Deadlock => "deadlock",
            FinalAnswerResult => "final_answer_result",
        }
    }
}

impl fmt::Display for UnifiedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnifiedStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        UnifiedStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| FlowError::InvalidArgument(format!("unknown status '{s}'")))
    }
}

/// Central transition validator.
pub struct StatusMachine;

impl StatusMachine {
    pub fn is_valid(from: UnifiedStatus, to: UnifiedStatus) -> bool {
        from.can_transition_to(to)
    }

    /// Validate `from -> to`, returning the new status on success.
    pub fn check(from: UnifiedStatus, to: UnifiedStatus) -> Result<UnifiedStatus> {
        if Self::is_valid(from, to) {
            Ok(to)
        } else {
            Err(FlowError::InvalidTransition { from, to })
        }
    }

    /// Apply a transition in place; `current` is untouched when it is illegal.
    pub fn transition(current: &mut UnifiedStatus, to: UnifiedStatus) -> Result<()> {
        *current = Self::check(*current, to)?;
        Ok(())
    }
}
