//! # hitl-optimizer
//!
//! Studies and trials for human-in-the-loop optimization.
//!
//! Provides search space definitions, samplers (random and a TPE with
//! constant-liar support for batches of unscored trials), the two-phase
//! trial event protocol, and study storage backends (in-memory and SQLite).

mod events;
mod sampler;
mod search;
mod sqlite;
mod storage;
mod study;
mod trial;

pub use events::TrialEvent;
pub use sampler::{RandomSampler, Sampler, SamplerConfig, TpeConfig, TpeSampler};
pub use search::{ParameterDef, ParameterKind, ParameterValue, Params, SearchSpace};
pub use sqlite::SqliteStorage;
pub use storage::{InMemoryStorage, StudyRecord, StudyStorage};
pub use study::{Study, StudyConfig};
pub use trial::{ObjectiveDirection, StudyId, Transition, Trial, TrialOutcome, TrialState};
