//! Applying a rater's answer to a trial.

use hitl_optimizer::{Study, Transition, Trial, TrialOutcome, TrialState};
use hitl_types::{FeedbackError, HitlResult};
use tracing::{info, warn};

use crate::artifact::{get_artifact_path, list_artifacts};
use crate::note::get_note;
use crate::widgets::{registered_widgets, WidgetResponse};

/// A trial is shown to raters once its image is stored and its note links
/// to it. Cycles that crashed before that point leave trials that can only
/// be skipped.
fn is_presented(trial: &Trial) -> HitlResult<bool> {
    let Some(note) = get_note(trial)? else {
        return Ok(false);
    };
    Ok(list_artifacts(trial)
        .iter()
        .any(|meta| note.body.contains(&get_artifact_path(trial, &meta.artifact_id))))
}

/// Resolve `response` through the study's registered widget and complete
/// the trial with the resulting value. Re-submitting the same answer is a
/// no-op. Trials without a stored image are rejected.
pub fn score_trial(
    study: &mut Study,
    trial_number: usize,
    response: &WidgetResponse,
) -> HitlResult<(Trial, Transition)> {
    let widgets = registered_widgets(study)?;
    let widget = widgets
        .first()
        .ok_or_else(|| FeedbackError::WidgetsNotRegistered {
            study: study.name().to_string(),
        })?;
    let value = widget.resolve(response)?;

    let current = study.get_trial(trial_number)?;
    if current.state == TrialState::Running && !is_presented(&current)? {
        warn!(trial = trial_number, "refusing to score a trial with no image");
        return Err(FeedbackError::TrialNotPresented {
            number: trial_number,
        }
        .into());
    }

    let (trial, transition) = study.tell(trial_number, TrialOutcome::Complete(value))?;
    if transition == Transition::Applied {
        info!(trial = trial_number, value, "rater score recorded");
    }
    Ok((trial, transition))
}

/// Give up on a trial without scoring it; it stops counting against the
/// batch capacity.
pub fn skip_trial(study: &mut Study, trial_number: usize) -> HitlResult<(Trial, Transition)> {
    let (trial, transition) = study.tell(trial_number, TrialOutcome::Failed)?;
    if transition == Transition::Applied {
        info!(trial = trial_number, "trial skipped");
    }
    Ok((trial, transition))
}
