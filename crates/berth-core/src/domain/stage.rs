//! Deployment stages and the transition table between them.
//!
//! The happy path is strictly linear:
//!
//! ```text
//! Pending → Analyzing → ResourcePlanning → ConfigGeneration
//!         → InfraVerification → Executing → Monitoring → Completed
//! ```
//!
//! `Failed` and `Cancelled` are reachable from every non-terminal stage.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::deployment::{StageResult, StageStatus};

/// Stage of a deployment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Analyzing,
    ResourcePlanning,
    ConfigGeneration,
    InfraVerification,
    Executing,
    Monitoring,
    Completed,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Analyzing => "analyzing",
            Stage::ResourcePlanning => "resource_planning",
            Stage::ConfigGeneration => "config_generation",
            Stage::InfraVerification => "infra_verification",
            Stage::Executing => "executing",
            Stage::Monitoring => "monitoring",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed | Stage::Cancelled)
    }

    /// The next stage on the happy path, if any.
    pub fn successor(&self) -> Option<Stage> {
        match self {
            Stage::Pending => Some(Stage::Analyzing),
            Stage::Analyzing => Some(Stage::ResourcePlanning),
            Stage::ResourcePlanning => Some(Stage::ConfigGeneration),
            Stage::ConfigGeneration => Some(Stage::InfraVerification),
            Stage::InfraVerification => Some(Stage::Executing),
            Stage::Executing => Some(Stage::Monitoring),
            Stage::Monitoring => Some(Stage::Completed),
            Stage::Completed | Stage::Failed | Stage::Cancelled => None,
        }
    }

    /// Whether the state machine has an edge `self → to`.
    pub fn can_transition_to(&self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Stage::Failed | Stage::Cancelled => true,
            other => self.successor() == Some(other),
        }
    }

    /// Whether the stage may record repeated attempts without moving.
    pub fn is_retryable_checkpoint(&self) -> bool {
        matches!(self, Stage::InfraVerification)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage history that skips or reorders stages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryViolation {
    #[error("history is empty")]
    Empty,

    #[error("history must start at pending, found {0}")]
    BadStart(Stage),

    #[error("entry {index}: {from} -> {to} is not an edge of the state machine")]
    SkippedStage { index: usize, from: Stage, to: Stage },

    #[error("entry {index}: repeated {stage} is only allowed for retryable checkpoints")]
    IllegalRepeat { index: usize, stage: Stage },

    #[error("entry {index}: recorded after the request became terminal")]
    AfterTerminal { index: usize },
}

/// Check that a stage history is a contiguous walk over the state machine.
///
/// Rules:
/// - the first entry is a successful `Pending` entry (submission);
/// - a `failed` entry records the stage the failure originated in (the
///   current stage or the one being entered) and ends the history;
/// - a repeated stage is only allowed at a retryable checkpoint;
/// - every other entry is an edge from the previous stage.
pub fn validate_history(history: &[StageResult]) -> Result<(), HistoryViolation> {
    let first = history.first().ok_or(HistoryViolation::Empty)?;
    if first.stage != Stage::Pending || first.status == StageStatus::Failed {
        return Err(HistoryViolation::BadStart(first.stage));
    }

    let mut current = Stage::Pending;
    let mut terminal = false;

    for (index, entry) in history.iter().enumerate().skip(1) {
        if terminal {
            return Err(HistoryViolation::AfterTerminal { index });
        }

        if entry.status == StageStatus::Failed {
            let entered = current.successor().filter(|s| !s.is_terminal());
            if entry.stage != current && Some(entry.stage) != entered {
                return Err(HistoryViolation::SkippedStage {
                    index,
                    from: current,
                    to: entry.stage,
                });
            }
            terminal = true;
            continue;
        }

        if entry.stage == current {
            if !current.is_retryable_checkpoint() {
                return Err(HistoryViolation::IllegalRepeat {
                    index,
                    stage: current,
                });
            }
            continue;
        }

        if !current.can_transition_to(entry.stage) {
            return Err(HistoryViolation::SkippedStage {
                index,
                from: current,
                to: entry.stage,
            });
        }
        current = entry.stage;
        terminal = current.is_terminal();
    }

    Ok(())
}
