//! Markdown notes shown next to a trial.

use hitl_optimizer::{Study, Trial};
use hitl_types::HitlResult;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const NOTE_ATTR_KEY: &str = "dashboard:note";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Incremented on every save.
    pub version: u64,
    pub body: String,
}

/// Replace the note on trial `trial_number`.
pub fn save_note(study: &Study, trial_number: usize, body: &str) -> HitlResult<Note> {
    let trial = study.get_trial(trial_number)?;
    let version = get_note(&trial)?.map_or(1, |n| n.version + 1);
    let note = Note {
        version,
        body: body.to_string(),
    };
    study.set_trial_attr(trial_number, NOTE_ATTR_KEY, serde_json::to_value(&note)?)?;
    debug!(trial = trial_number, version, "note saved");
    Ok(note)
}

pub fn get_note(trial: &Trial) -> HitlResult<Option<Note>> {
    trial
        .attr(NOTE_ATTR_KEY)
        .map(|value| serde_json::from_value(value.clone()).map_err(Into::into))
        .transpose()
}

/// Markdown body embedding the trial's image.
pub fn trial_note_template(trial_number: usize, artifact_path: &str) -> String {
    format!("## Trial {trial_number}\n\n![generated-image]({artifact_path})\n")
}
