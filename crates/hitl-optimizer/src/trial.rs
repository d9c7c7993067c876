//! Trial records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::search::{ParameterValue, Params};

/// Unique study identifier.
pub type StudyId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

impl ObjectiveDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Maximize => "maximize",
            Self::Minimize => "minimize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "maximize" => Some(Self::Maximize),
            "minimize" => Some(Self::Minimize),
            _ => None,
        }
    }

    /// Whether `candidate` is strictly better than `incumbent`.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }

    /// Objective expressed as a loss (lower is better).
    pub fn to_loss(self, value: f64) -> f64 {
        match self {
            Self::Maximize => -value,
            Self::Minimize => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Running,
    Complete,
    Failed,
    Pruned,
}

impl TrialState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Pruned => "pruned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "pruned" => Some(Self::Pruned),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        self != Self::Running
    }

    /// Decide what finishing a trial currently in `self` (with stored
    /// `value`) with `outcome` amounts to.
    ///
    /// Re-delivering the outcome a trial already has is a no-op, which makes
    /// scoring idempotent. Any other change to a finished trial conflicts.
    pub fn transition(self, value: Option<f64>, outcome: &TrialOutcome) -> Transition {
        if self == Self::Running {
            return Transition::Applied;
        }
        let same = match (*outcome, self) {
            (TrialOutcome::Complete(v), Self::Complete) => value == Some(v),
            (TrialOutcome::Failed, Self::Failed) | (TrialOutcome::Pruned, Self::Pruned) => true,
            _ => false,
        };
        if same {
            Transition::Unchanged
        } else {
            Transition::Conflict
        }
    }
}

impl std::fmt::Display for TrialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a trial left the running state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum TrialOutcome {
    Complete(f64),
    Failed,
    Pruned,
}

impl TrialOutcome {
    pub fn state(&self) -> TrialState {
        match self {
            Self::Complete(_) => TrialState::Complete,
            Self::Failed => TrialState::Failed,
            Self::Pruned => TrialState::Pruned,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match *self {
            Self::Complete(v) => Some(v),
            _ => None,
        }
    }
}

/// Result of applying a [`TrialOutcome`] to a stored trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The trial was running and is now finished.
    Applied,
    /// The trial already carried this exact outcome.
    Unchanged,
    /// The trial is finished with a different outcome.
    Conflict,
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

/// A single trial: one proposed parameter vector and its eventual outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub study_id: StudyId,
    pub number: usize,
    pub parameters: Params,
    pub state: TrialState,
    pub value: Option<f64>,
    /// System attributes (notes, artifact metadata), stored as JSON.
    pub attrs: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(study_id: StudyId, number: usize, parameters: Params) -> Self {
        Self {
            id: Uuid::new_v4(),
            study_id,
            number,
            parameters,
            state: TrialState::Running,
            value: None,
            attrs: HashMap::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn param(&self, name: &str) -> Option<ParameterValue> {
        self.parameters.get(name).copied()
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        self.param(name).map(|v| v.as_f64())
    }

    pub fn attr(&self, key: &str) -> Option<&serde_json::Value> {
        self.attrs.get(key)
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Record a finishing outcome on this in-memory record.
    pub fn finish(&mut self, outcome: &TrialOutcome) {
        self.state = outcome.state();
        self.value = outcome.value();
        self.finished_at = Some(Utc::now());
    }
}
