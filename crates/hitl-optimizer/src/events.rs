//! Two-phase trial protocol: a trial is created by the loop and scored later,
//! out of band, by a human.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::search::Params;
use crate::trial::{StudyId, TrialOutcome};

/// Events emitted by a [`crate::Study`] for external consumption (logging,
/// feedback surfaces, reconciliation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrialEvent {
    Created {
        study_id: StudyId,
        trial_number: usize,
        parameters: Params,
        at: DateTime<Utc>,
    },
    /// Only emitted when the outcome actually changed the trial; replays of
    /// an already-applied score are silent.
    Scored {
        study_id: StudyId,
        trial_number: usize,
        outcome: TrialOutcome,
        at: DateTime<Utc>,
    },
}

impl TrialEvent {
    pub fn trial_number(&self) -> usize {
        match self {
            Self::Created { trial_number, .. } | Self::Scored { trial_number, .. } => *trial_number,
        }
    }
}
