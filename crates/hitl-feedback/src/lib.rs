//! # hitl-feedback
//!
//! Everything between a proposed trial and the human scoring it: the
//! artifact store that holds rendered images, markdown notes attached to
//! trials, the objective form widgets raters answer, and request routing
//! for the HTTP feedback service.

pub mod artifact;
pub mod note;
pub mod scoring;
pub mod service;
pub mod widgets;

pub use artifact::{
    get_artifact_path, list_artifacts, upload_artifact, ArtifactBackend, ArtifactMeta,
    FileSystemBackend,
};
pub use note::{get_note, save_note, trial_note_template, Note, NOTE_ATTR_KEY};
pub use scoring::{score_trial, skip_trial};
pub use service::{route, Method, Request, Response};
pub use widgets::{
    register_objective_form_widgets, registered_widgets, ObjectiveFormWidget, WidgetResponse,
};
