//! Named, persistent optimization studies.

use chrono::Utc;
use hitl_types::{validation_error, HitlResult, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::events::TrialEvent;
use crate::sampler::{Sampler, SamplerConfig, TpeConfig};
use crate::search::SearchSpace;
use crate::storage::{StudyRecord, StudyStorage};
use crate::trial::{ObjectiveDirection, StudyId, Transition, Trial, TrialOutcome, TrialState};

/// Top-level configuration for a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    pub name: String,
    pub description: String,

    /// Direction of optimization.
    pub direction: ObjectiveDirection,

    /// Label of the objective shown to raters. Exactly one.
    pub metric_names: Vec<String>,

    /// The parameter search space.
    pub search_space: SearchSpace,

    pub sampler: SamplerConfig,

    /// Reattach to an existing study of the same name instead of failing.
    pub load_if_exists: bool,
}

impl StudyConfig {
    pub fn new(name: impl Into<String>, search_space: SearchSpace) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            direction: ObjectiveDirection::Minimize,
            metric_names: vec!["objective".to_string()],
            search_space,
            sampler: SamplerConfig::default(),
            load_if_exists: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_metric_name(mut self, name: impl Into<String>) -> Self {
        self.metric_names = vec![name.into()];
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_load_if_exists(mut self, load_if_exists: bool) -> Self {
        self.load_if_exists = load_if_exists;
        self
    }

    pub fn validate(&self) -> HitlResult<()> {
        if self.name.trim().is_empty() {
            return Err(validation_error!("study name must not be empty"));
        }
        if self.metric_names.len() != 1 {
            return Err(validation_error!(
                "expected exactly one metric name, got {}",
                self.metric_names.len()
            ));
        }
        self.search_space.validate()
    }
}

impl Default for StudyConfig {
    /// The color study: (r, g, b) rated by a human, where a "good" rating
    /// maps to -1 so the study minimizes.
    fn default() -> Self {
        Self::new("Human-in-the-loop Optimization", SearchSpace::rgb())
            .with_description("Pick a highlight color humans like")
            .with_metric_name("Do you like this color?")
            .with_sampler(SamplerConfig::Tpe(TpeConfig::default()))
    }
}

/// A live handle on a persisted study.
///
/// The handle owns the sampler; trial history always comes from storage so
/// several handles (e.g. the loop and the feedback service) can work on the
/// same study.
pub struct Study {
    record: StudyRecord,
    storage: Arc<dyn StudyStorage>,
    sampler: Box<dyn Sampler>,
    events: Vec<TrialEvent>,
}

impl std::fmt::Debug for Study {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Study")
            .field("record", &self.record)
            .field("sampler", &self.sampler.name())
            .field("pending_events", &self.events.len())
            .finish()
    }
}

impl Study {
    /// Create the study described by `config`, or reattach to it when it
    /// already exists and `load_if_exists` is set.
    pub fn create(config: &StudyConfig, storage: Arc<dyn StudyStorage>) -> HitlResult<Self> {
        config.validate()?;

        let record = match storage.find_study(&config.name)? {
            Some(record) if config.load_if_exists => {
                if record.direction != config.direction {
                    warn!(
                        study = %record.name,
                        stored = ?record.direction,
                        configured = ?config.direction,
                        "keeping stored direction of existing study"
                    );
                }
                info!(study = %record.name, id = %record.id, "reattached to existing study");
                record
            }
            Some(record) => {
                return Err(StorageError::DuplicatedStudy { name: record.name }.into());
            }
            None => storage.create_study(&config.name, config.direction)?,
        };

        Ok(Self {
            record,
            storage,
            sampler: config.sampler.build(),
            events: Vec::new(),
        })
    }

    /// Attach to an existing study by name.
    pub fn load(
        name: &str,
        storage: Arc<dyn StudyStorage>,
        sampler: Box<dyn Sampler>,
    ) -> HitlResult<Self> {
        let record = storage
            .find_study(name)?
            .ok_or_else(|| StorageError::StudyNotFound {
                name: name.to_string(),
            })?;
        Ok(Self {
            record,
            storage,
            sampler,
            events: Vec::new(),
        })
    }

    pub fn id(&self) -> StudyId {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.record.direction
    }

    pub fn storage(&self) -> &Arc<dyn StudyStorage> {
        &self.storage
    }

    /// Propose a new trial. The sampler sees every trial so far, running
    /// ones included; the trial is stored as running before it is returned.
    pub fn ask(&mut self, space: &SearchSpace) -> HitlResult<Trial> {
        space.validate()?;
        let history = self.storage.get_trials(self.record.id, None)?;
        let params = self.sampler.sample(space, &history, self.record.direction)?;
        let trial = self.storage.create_trial(self.record.id, &params)?;

        debug!(
            study = %self.record.name,
            number = trial.number,
            sampler = self.sampler.name(),
            "asked new trial"
        );
        self.events.push(TrialEvent::Created {
            study_id: self.record.id,
            trial_number: trial.number,
            parameters: trial.parameters.clone(),
            at: trial.created_at,
        });
        Ok(trial)
    }

    /// Finish a trial. Replaying the same outcome is a no-op.
    pub fn tell(&mut self, number: usize, outcome: TrialOutcome) -> HitlResult<(Trial, Transition)> {
        if let TrialOutcome::Complete(v) = outcome {
            if !v.is_finite() {
                return Err(validation_error!("objective value must be finite, got {v}"));
            }
        }

        let (trial, transition) = self.storage.finish_trial(self.record.id, number, outcome)?;
        if transition == Transition::Applied {
            info!(study = %self.record.name, number, outcome = ?outcome, "trial scored");
            self.events.push(TrialEvent::Scored {
                study_id: self.record.id,
                trial_number: number,
                outcome,
                at: trial.finished_at.unwrap_or_else(Utc::now),
            });
        } else {
            debug!(number, "score already recorded");
        }
        Ok((trial, transition))
    }

    pub fn trials(&self, states: Option<&[TrialState]>) -> HitlResult<Vec<Trial>> {
        self.storage.get_trials(self.record.id, states)
    }

    /// Trials awaiting a score. Read-only.
    pub fn running_trials(&self) -> HitlResult<Vec<Trial>> {
        self.trials(Some(&[TrialState::Running]))
    }

    pub fn get_trial(&self, number: usize) -> HitlResult<Trial> {
        self.storage.get_trial(self.record.id, number)
    }

    pub fn set_metric_names(&self, names: &[String]) -> HitlResult<()> {
        if names.len() != 1 {
            return Err(validation_error!(
                "expected exactly one metric name, got {}",
                names.len()
            ));
        }
        self.storage.set_metric_names(self.record.id, names)
    }

    pub fn metric_names(&self) -> HitlResult<Vec<String>> {
        self.storage.metric_names(self.record.id)
    }

    pub fn set_trial_attr(&self, number: usize, key: &str, value: serde_json::Value) -> HitlResult<()> {
        self.storage.set_trial_attr(self.record.id, number, key, value)
    }

    pub fn set_study_attr(&self, key: &str, value: serde_json::Value) -> HitlResult<()> {
        self.storage.set_study_attr(self.record.id, key, value)
    }

    pub fn study_attrs(&self) -> HitlResult<HashMap<String, serde_json::Value>> {
        self.storage.study_attrs(self.record.id)
    }

    /// Best completed trial according to the study direction.
    pub fn best_trial(&self) -> HitlResult<Option<Trial>> {
        let complete = self.trials(Some(&[TrialState::Complete]))?;
        let mut best: Option<Trial> = None;
        for trial in complete {
            let Some(value) = trial.value else { continue };
            let dominated = match best.as_ref().and_then(|b| b.value) {
                None => true,
                Some(current) => self.record.direction.improves(value, current),
            };
            if dominated {
                best = Some(trial);
            }
        }
        Ok(best)
    }

    /// Running trials that never received the attribute `marker` (for the
    /// loop: a note), i.e. trials a crashed cycle left behind.
    pub fn orphaned_trials(&self, marker: &str) -> HitlResult<Vec<Trial>> {
        Ok(self
            .running_trials()?
            .into_iter()
            .filter(|t| t.attr(marker).is_none())
            .collect())
    }

    /// Take the events emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<TrialEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::RandomSampler;
    use crate::storage::InMemoryStorage;
    use hitl_types::HitlError;

    fn seeded_config() -> StudyConfig {
        StudyConfig::default().with_sampler(SamplerConfig::Tpe(TpeConfig::default().with_seed(5)))
    }

    fn memory() -> Arc<dyn StudyStorage> {
        Arc::new(InMemoryStorage::new())
    }

    #[test]
    fn default_config_describes_color_study() {
        let config = StudyConfig::default();
        assert_eq!(config.name, "Human-in-the-loop Optimization");
        assert_eq!(config.metric_names, vec!["Do you like this color?".to_string()]);
        assert_eq!(config.direction, ObjectiveDirection::Minimize);
        assert!(config.load_if_exists);
        config.validate().unwrap();
    }

    #[test]
    fn ask_creates_running_trials_in_order() {
        let storage = memory();
        let mut study = Study::create(&seeded_config(), storage).unwrap();
        let space = SearchSpace::rgb();

        for expected in 0..3 {
            let trial = study.ask(&space).unwrap();
            assert_eq!(trial.number, expected);
            assert_eq!(trial.state, TrialState::Running);
            for name in ["r", "g", "b"] {
                let v = trial.param_f64(name).unwrap();
                assert!((0.0..=1.0).contains(&v));
            }
        }
        assert_eq!(study.running_trials().unwrap().len(), 3);

        let events = study.drain_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TrialEvent::Created { trial_number: 0, .. }));
        assert!(study.drain_events().is_empty());
    }

    #[test]
    fn tell_emits_scored_once() {
        let mut study = Study::create(&seeded_config(), memory()).unwrap();
        study.ask(&SearchSpace::rgb()).unwrap();
        study.drain_events();

        let (_, first) = study.tell(0, TrialOutcome::Complete(-1.0)).unwrap();
        let (_, again) = study.tell(0, TrialOutcome::Complete(-1.0)).unwrap();
        assert_eq!(first, Transition::Applied);
        assert_eq!(again, Transition::Unchanged);

        let events = study.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trial_number(), 0);
        assert!(study.running_trials().unwrap().is_empty());
    }

    #[test]
    fn tell_rejects_non_finite_values() {
        let mut study = Study::create(&seeded_config(), memory()).unwrap();
        study.ask(&SearchSpace::rgb()).unwrap();
        assert!(study.tell(0, TrialOutcome::Complete(f64::NAN)).is_err());
    }

    #[test]
    fn running_trials_query_does_not_change_state() {
        let mut study = Study::create(&seeded_config(), memory()).unwrap();
        let space = SearchSpace::rgb();
        study.ask(&space).unwrap();
        study.ask(&space).unwrap();

        let before = study.trials(None).unwrap();
        for _ in 0..10 {
            assert_eq!(study.running_trials().unwrap().len(), 2);
        }
        assert_eq!(study.trials(None).unwrap(), before);
    }

    #[test]
    fn reattach_continues_numbering() {
        let storage = memory();
        {
            let mut study = Study::create(&seeded_config(), storage.clone()).unwrap();
            for n in 0..4 {
                study.ask(&SearchSpace::rgb()).unwrap();
                study.tell(n, TrialOutcome::Complete(0.0)).unwrap();
            }
        }

        let mut study = Study::create(&seeded_config(), storage).unwrap();
        let trial = study.ask(&SearchSpace::rgb()).unwrap();
        assert_eq!(trial.number, 4);
    }

    #[test]
    fn create_without_load_if_exists_fails_on_duplicate() {
        let storage = memory();
        Study::create(&seeded_config(), storage.clone()).unwrap();
        let err = Study::create(&seeded_config().with_load_if_exists(false), storage).unwrap_err();
        assert!(matches!(err, HitlError::Storage(StorageError::DuplicatedStudy { .. })));
    }

    #[test]
    fn load_requires_existing_study() {
        let storage = memory();
        let missing = Study::load("nope", storage.clone(), Box::new(RandomSampler::new(Some(1))));
        assert!(missing.is_err());

        Study::create(&seeded_config(), storage.clone()).unwrap();
        let study = Study::load(
            "Human-in-the-loop Optimization",
            storage,
            Box::new(RandomSampler::new(Some(1))),
        )
        .unwrap();
        assert_eq!(study.direction(), ObjectiveDirection::Minimize);
    }

    #[test]
    fn best_trial_follows_direction() {
        let mut study = Study::create(&seeded_config(), memory()).unwrap();
        let space = SearchSpace::rgb();
        for (n, score) in [0.0, -1.0, 1.0].into_iter().enumerate() {
            study.ask(&space).unwrap();
            study.tell(n, TrialOutcome::Complete(score)).unwrap();
        }
        study.ask(&space).unwrap();

        let best = study.best_trial().unwrap().unwrap();
        assert_eq!(best.number, 1);
        assert_eq!(best.value, Some(-1.0));
    }

    #[test]
    fn orphaned_trials_are_running_without_marker() {
        let mut study = Study::create(&seeded_config(), memory()).unwrap();
        let space = SearchSpace::rgb();
        study.ask(&space).unwrap();
        study.ask(&space).unwrap();
        study
            .set_trial_attr(0, "dashboard:note", serde_json::json!({"body": "x"}))
            .unwrap();

        let orphans = study.orphaned_trials("dashboard:note").unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].number, 1);
    }

    #[test]
    fn metric_names_must_be_single() {
        let study = Study::create(&seeded_config(), memory()).unwrap();
        assert!(study.set_metric_names(&[]).is_err());
        study
            .set_metric_names(&["Do you like this color?".to_string()])
            .unwrap();
        assert_eq!(study.metric_names().unwrap().len(), 1);
    }
}
