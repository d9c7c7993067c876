//! Study storage abstraction and the in-memory backend.

use chrono::{DateTime, Utc};
use hitl_types::{HitlResult, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::search::Params;
use crate::trial::{ObjectiveDirection, StudyId, Transition, Trial, TrialOutcome, TrialState};

/// Persisted description of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub id: StudyId,
    pub name: String,
    pub direction: ObjectiveDirection,
    pub created_at: DateTime<Utc>,
}

/// Durable home of studies and their trials.
///
/// Implementations must make `create_trial` and `finish_trial` atomic: the
/// optimization loop creates trials while a separate feedback process
/// finishes them against the same storage.
pub trait StudyStorage: Send + Sync {
    /// Create a new study. Fails with `DuplicatedStudy` if the name is taken.
    fn create_study(&self, name: &str, direction: ObjectiveDirection) -> HitlResult<StudyRecord>;

    fn find_study(&self, name: &str) -> HitlResult<Option<StudyRecord>>;

    fn set_metric_names(&self, study_id: StudyId, names: &[String]) -> HitlResult<()>;

    fn metric_names(&self, study_id: StudyId) -> HitlResult<Vec<String>>;

    fn set_study_attr(&self, study_id: StudyId, key: &str, value: serde_json::Value) -> HitlResult<()>;

    fn study_attrs(&self, study_id: StudyId) -> HitlResult<HashMap<String, serde_json::Value>>;

    /// Create a running trial numbered one past the highest existing number.
    fn create_trial(&self, study_id: StudyId, params: &Params) -> HitlResult<Trial>;

    /// Move a trial out of the running state.
    ///
    /// Returns the stored trial and whether this call changed it. Replaying
    /// an identical outcome is `Unchanged`; a different outcome for a
    /// finished trial is a `TrialAlreadyFinished` error.
    fn finish_trial(
        &self,
        study_id: StudyId,
        number: usize,
        outcome: TrialOutcome,
    ) -> HitlResult<(Trial, Transition)>;

    /// Set (overwrite) a trial system attribute.
    fn set_trial_attr(
        &self,
        study_id: StudyId,
        number: usize,
        key: &str,
        value: serde_json::Value,
    ) -> HitlResult<()>;

    fn get_trial(&self, study_id: StudyId, number: usize) -> HitlResult<Trial>;

    /// Trials ordered by number, optionally filtered by state.
    fn get_trials(&self, study_id: StudyId, states: Option<&[TrialState]>) -> HitlResult<Vec<Trial>>;
}

pub(crate) fn trial_not_found(study_id: StudyId, number: usize) -> StorageError {
    StorageError::TrialNotFound {
        study: study_id.to_string(),
        number,
    }
}

pub(crate) fn study_not_found(study_id: StudyId) -> StorageError {
    StorageError::StudyNotFound {
        name: study_id.to_string(),
    }
}

#[derive(Debug, Default)]
struct StudyEntry {
    record: Option<StudyRecord>,
    metric_names: Vec<String>,
    attrs: HashMap<String, serde_json::Value>,
    trials: Vec<Trial>,
}

/// Process-local storage; nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    studies: RwLock<HashMap<StudyId, StudyEntry>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StudyStorage for InMemoryStorage {
    fn create_study(&self, name: &str, direction: ObjectiveDirection) -> HitlResult<StudyRecord> {
        let mut studies = self.studies.write();
        let taken = studies
            .values()
            .any(|s| s.record.as_ref().is_some_and(|r| r.name == name));
        if taken {
            return Err(StorageError::DuplicatedStudy {
                name: name.to_string(),
            }
            .into());
        }

        let record = StudyRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            direction,
            created_at: Utc::now(),
        };
        studies.insert(
            record.id,
            StudyEntry {
                record: Some(record.clone()),
                ..Default::default()
            },
        );
        Ok(record)
    }

    fn find_study(&self, name: &str) -> HitlResult<Option<StudyRecord>> {
        Ok(self
            .studies
            .read()
            .values()
            .filter_map(|s| s.record.clone())
            .find(|r| r.name == name))
    }

    fn set_metric_names(&self, study_id: StudyId, names: &[String]) -> HitlResult<()> {
        let mut studies = self.studies.write();
        let entry = studies.get_mut(&study_id).ok_or_else(|| study_not_found(study_id))?;
        entry.metric_names = names.to_vec();
        Ok(())
    }

    fn metric_names(&self, study_id: StudyId) -> HitlResult<Vec<String>> {
        let studies = self.studies.read();
        let entry = studies.get(&study_id).ok_or_else(|| study_not_found(study_id))?;
        Ok(entry.metric_names.clone())
    }

    fn set_study_attr(&self, study_id: StudyId, key: &str, value: serde_json::Value) -> HitlResult<()> {
        let mut studies = self.studies.write();
        let entry = studies.get_mut(&study_id).ok_or_else(|| study_not_found(study_id))?;
        entry.attrs.insert(key.to_string(), value);
        Ok(())
    }

    fn study_attrs(&self, study_id: StudyId) -> HitlResult<HashMap<String, serde_json::Value>> {
        let studies = self.studies.read();
        let entry = studies.get(&study_id).ok_or_else(|| study_not_found(study_id))?;
        Ok(entry.attrs.clone())
    }

    fn create_trial(&self, study_id: StudyId, params: &Params) -> HitlResult<Trial> {
        let mut studies = self.studies.write();
        let entry = studies.get_mut(&study_id).ok_or_else(|| study_not_found(study_id))?;
        let number = entry.trials.len();
        let trial = Trial::new(study_id, number, params.clone());
        entry.trials.push(trial.clone());
        Ok(trial)
    }

    fn finish_trial(
        &self,
        study_id: StudyId,
        number: usize,
        outcome: TrialOutcome,
    ) -> HitlResult<(Trial, Transition)> {
        let mut studies = self.studies.write();
        let entry = studies.get_mut(&study_id).ok_or_else(|| study_not_found(study_id))?;
        let trial = entry
            .trials
            .get_mut(number)
            .ok_or_else(|| trial_not_found(study_id, number))?;

        match trial.state.transition(trial.value, &outcome) {
            Transition::Applied => {
                trial.finish(&outcome);
                Ok((trial.clone(), Transition::Applied))
            }
            Transition::Unchanged => Ok((trial.clone(), Transition::Unchanged)),
            Transition::Conflict => Err(StorageError::TrialAlreadyFinished {
                number,
                state: trial.state.to_string(),
            }
            .into()),
        }
    }

    fn set_trial_attr(
        &self,
        study_id: StudyId,
        number: usize,
        key: &str,
        value: serde_json::Value,
    ) -> HitlResult<()> {
        let mut studies = self.studies.write();
        let entry = studies.get_mut(&study_id).ok_or_else(|| study_not_found(study_id))?;
        let trial = entry
            .trials
            .get_mut(number)
            .ok_or_else(|| trial_not_found(study_id, number))?;
        trial.attrs.insert(key.to_string(), value);
        Ok(())
    }

    fn get_trial(&self, study_id: StudyId, number: usize) -> HitlResult<Trial> {
        let studies = self.studies.read();
        let entry = studies.get(&study_id).ok_or_else(|| study_not_found(study_id))?;
        entry
            .trials
            .get(number)
            .cloned()
            .ok_or_else(|| trial_not_found(study_id, number).into())
    }

    fn get_trials(&self, study_id: StudyId, states: Option<&[TrialState]>) -> HitlResult<Vec<Trial>> {
        let studies = self.studies.read();
        let entry = studies.get(&study_id).ok_or_else(|| study_not_found(study_id))?;
        Ok(entry
            .trials
            .iter()
            .filter(|t| states.map_or(true, |s| s.contains(&t.state)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ParameterValue;
    use hitl_types::HitlError;

    fn params(r: f64) -> Params {
        let mut p = Params::new();
        p.insert("r".into(), ParameterValue::Float(r));
        p
    }

    #[test]
    fn duplicate_study_names_rejected() {
        let storage = InMemoryStorage::new();
        storage.create_study("colors", ObjectiveDirection::Minimize).unwrap();
        let err = storage
            .create_study("colors", ObjectiveDirection::Minimize)
            .unwrap_err();
        assert!(matches!(err, HitlError::Storage(StorageError::DuplicatedStudy { .. })));
        assert!(storage.find_study("colors").unwrap().is_some());
        assert!(storage.find_study("shapes").unwrap().is_none());
    }

    #[test]
    fn trial_numbers_increase_and_filter_by_state() {
        let storage = InMemoryStorage::new();
        let study = storage.create_study("colors", ObjectiveDirection::Minimize).unwrap();

        for i in 0..3 {
            let trial = storage.create_trial(study.id, &params(0.1 * i as f64)).unwrap();
            assert_eq!(trial.number, i);
            assert_eq!(trial.state, TrialState::Running);
        }

        storage
            .finish_trial(study.id, 1, TrialOutcome::Complete(-1.0))
            .unwrap();

        let running = storage
            .get_trials(study.id, Some(&[TrialState::Running]))
            .unwrap();
        assert_eq!(running.iter().map(|t| t.number).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(storage.get_trials(study.id, None).unwrap().len(), 3);
    }

    #[test]
    fn finish_trial_is_idempotent() {
        let storage = InMemoryStorage::new();
        let study = storage.create_study("colors", ObjectiveDirection::Minimize).unwrap();
        storage.create_trial(study.id, &params(0.5)).unwrap();

        let (_, first) = storage
            .finish_trial(study.id, 0, TrialOutcome::Complete(0.0))
            .unwrap();
        let (trial, second) = storage
            .finish_trial(study.id, 0, TrialOutcome::Complete(0.0))
            .unwrap();
        assert_eq!(first, Transition::Applied);
        assert_eq!(second, Transition::Unchanged);
        assert_eq!(trial.value, Some(0.0));

        let conflict = storage.finish_trial(study.id, 0, TrialOutcome::Complete(1.0));
        assert!(conflict.is_err());
    }

    #[test]
    fn unknown_trial_reports_not_found() {
        let storage = InMemoryStorage::new();
        let study = storage.create_study("colors", ObjectiveDirection::Minimize).unwrap();
        let err = storage.get_trial(study.id, 9).unwrap_err();
        assert!(matches!(
            err,
            HitlError::Storage(StorageError::TrialNotFound { number: 9, .. })
        ));
    }

    #[test]
    fn attrs_overwrite() {
        let storage = InMemoryStorage::new();
        let study = storage.create_study("colors", ObjectiveDirection::Minimize).unwrap();
        storage.create_trial(study.id, &params(0.5)).unwrap();

        storage
            .set_trial_attr(study.id, 0, "note", serde_json::json!("a"))
            .unwrap();
        storage
            .set_trial_attr(study.id, 0, "note", serde_json::json!("b"))
            .unwrap();
        let trial = storage.get_trial(study.id, 0).unwrap();
        assert_eq!(trial.attr("note"), Some(&serde_json::json!("b")));

        storage
            .set_study_attr(study.id, "widgets", serde_json::json!([1]))
            .unwrap();
        assert_eq!(storage.study_attrs(study.id).unwrap().len(), 1);
    }
}
