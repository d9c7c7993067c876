//! SQLite-backed study storage.
//!
//! One database file can be shared by the optimization loop and the feedback
//! service: the journal runs in WAL mode, writers wait on `busy_timeout`, and
//! trial creation / completion run inside `BEGIN IMMEDIATE` transactions so
//! trial numbers stay unique and a score is applied at most once.

use chrono::{DateTime, Utc};
use hitl_types::{HitlError, HitlResult, StorageError};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::search::Params;
use crate::storage::{study_not_found, trial_not_found, StudyRecord, StudyStorage};
use crate::trial::{ObjectiveDirection, StudyId, Transition, Trial, TrialOutcome, TrialState};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS studies (
        study_id TEXT PRIMARY KEY,
        study_name TEXT NOT NULL UNIQUE,
        direction TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS study_metric_names (
        study_id TEXT NOT NULL REFERENCES studies(study_id),
        objective INTEGER NOT NULL,
        name TEXT NOT NULL,
        PRIMARY KEY (study_id, objective)
    );

    CREATE TABLE IF NOT EXISTS study_attrs (
        study_id TEXT NOT NULL REFERENCES studies(study_id),
        key TEXT NOT NULL,
        value_json TEXT NOT NULL,
        PRIMARY KEY (study_id, key)
    );

    CREATE TABLE IF NOT EXISTS trials (
        trial_id TEXT PRIMARY KEY,
        study_id TEXT NOT NULL REFERENCES studies(study_id),
        number INTEGER NOT NULL,
        state TEXT NOT NULL,
        value REAL,
        params_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        finished_at TEXT,
        UNIQUE (study_id, number)
    );

    CREATE INDEX IF NOT EXISTS idx_trials_study_state ON trials(study_id, state);

    CREATE TABLE IF NOT EXISTS trial_attrs (
        trial_id TEXT NOT NULL REFERENCES trials(trial_id),
        key TEXT NOT NULL,
        value_json TEXT NOT NULL,
        PRIMARY KEY (trial_id, key)
    );
";

const TRIAL_COLUMNS: &str =
    "trial_id, number, state, value, params_json, created_at, finished_at";

fn db_err(e: rusqlite::Error) -> HitlError {
    StorageError::DatabaseConnection {
        message: e.to_string(),
    }
    .into()
}

fn query_err(query: &'static str) -> impl Fn(rusqlite::Error) -> HitlError {
    move |e| {
        StorageError::QueryFailed {
            query: query.to_string(),
            error: e.to_string(),
        }
        .into()
    }
}

fn corruption(message: impl Into<String>) -> HitlError {
    StorageError::Corruption {
        message: message.into(),
    }
    .into()
}

fn parse_time(raw: &str) -> HitlResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corruption(format!("bad timestamp {raw}: {e}")))
}

fn parse_uuid(raw: &str) -> HitlResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| corruption(format!("bad id {raw}: {e}")))
}

/// Raw `trials` row before conversion.
struct TrialRow {
    trial_id: String,
    number: i64,
    state: String,
    value: Option<f64>,
    params_json: String,
    created_at: String,
    finished_at: Option<String>,
}

impl TrialRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            trial_id: row.get(0)?,
            number: row.get(1)?,
            state: row.get(2)?,
            value: row.get(3)?,
            params_json: row.get(4)?,
            created_at: row.get(5)?,
            finished_at: row.get(6)?,
        })
    }

    fn into_trial(
        self,
        study_id: StudyId,
        attrs: HashMap<String, serde_json::Value>,
    ) -> HitlResult<Trial> {
        let state = TrialState::parse(&self.state)
            .ok_or_else(|| corruption(format!("unknown trial state {}", self.state)))?;
        let parameters: Params = serde_json::from_str(&self.params_json)?;
        Ok(Trial {
            id: parse_uuid(&self.trial_id)?,
            study_id,
            number: usize::try_from(self.number)
                .map_err(|_| corruption(format!("negative trial number {}", self.number)))?,
            parameters,
            state,
            value: self.value,
            attrs,
            created_at: parse_time(&self.created_at)?,
            finished_at: self.finished_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

/// Persistent storage in a single SQLite database.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> HitlResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )
        .map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        info!(path = %path.display(), "opened study storage");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> HitlResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> HitlResult<()> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!("study storage schema ready");
        Ok(())
    }

    fn ensure_study(conn: &Connection, study_id: StudyId) -> HitlResult<()> {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM studies WHERE study_id = ?1",
                params![study_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match exists {
            Some(_) => Ok(()),
            None => Err(study_not_found(study_id).into()),
        }
    }

    fn trial_attrs(
        conn: &Connection,
        trial_id: &str,
    ) -> HitlResult<HashMap<String, serde_json::Value>> {
        let mut stmt = conn
            .prepare("SELECT key, value_json FROM trial_attrs WHERE trial_id = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![trial_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(query_err("select trial_attrs"))?;

        let mut attrs = HashMap::new();
        for row in rows {
            let (key, raw) = row.map_err(db_err)?;
            attrs.insert(key, serde_json::from_str(&raw)?);
        }
        Ok(attrs)
    }

    fn load_trial(conn: &Connection, study_id: StudyId, number: usize) -> HitlResult<Trial> {
        let sql = format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE study_id = ?1 AND number = ?2");
        let row = conn
            .query_row(&sql, params![study_id.to_string(), number as i64], TrialRow::from_row)
            .optional()
            .map_err(query_err("select trial"))?
            .ok_or_else(|| trial_not_found(study_id, number))?;
        let attrs = Self::trial_attrs(conn, &row.trial_id)?;
        row.into_trial(study_id, attrs)
    }
}

impl StudyStorage for SqliteStorage {
    fn create_study(&self, name: &str, direction: ObjectiveDirection) -> HitlResult<StudyRecord> {
        let conn = self.conn.lock();
        if find_study_in(&conn, name)?.is_some() {
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
        conn.execute(
            "INSERT INTO studies (study_id, study_name, direction, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.to_string(),
                record.name,
                direction.as_str(),
                record.created_at.to_rfc3339()
            ],
        )
        .map_err(query_err("insert study"))?;
        info!(study = %record.name, id = %record.id, "created study");
        Ok(record)
    }

    fn find_study(&self, name: &str) -> HitlResult<Option<StudyRecord>> {
        let conn = self.conn.lock();
        find_study_in(&conn, name)
    }

    fn set_metric_names(&self, study_id: StudyId, names: &[String]) -> HitlResult<()> {
        let mut conn = self.conn.lock();
        Self::ensure_study(&conn, study_id)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute(
            "DELETE FROM study_metric_names WHERE study_id = ?1",
            params![study_id.to_string()],
        )
        .map_err(query_err("delete metric names"))?;
        for (i, name) in names.iter().enumerate() {
            tx.execute(
                "INSERT INTO study_metric_names (study_id, objective, name) VALUES (?1, ?2, ?3)",
                params![study_id.to_string(), i as i64, name],
            )
            .map_err(query_err("insert metric name"))?;
        }
        tx.commit().map_err(db_err)
    }

    fn metric_names(&self, study_id: StudyId) -> HitlResult<Vec<String>> {
        let conn = self.conn.lock();
        Self::ensure_study(&conn, study_id)?;
        let mut stmt = conn
            .prepare("SELECT name FROM study_metric_names WHERE study_id = ?1 ORDER BY objective")
            .map_err(db_err)?;
        let names = stmt
            .query_map(params![study_id.to_string()], |row| row.get::<_, String>(0))
            .map_err(query_err("select metric names"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(names)
    }

    fn set_study_attr(&self, study_id: StudyId, key: &str, value: serde_json::Value) -> HitlResult<()> {
        let conn = self.conn.lock();
        Self::ensure_study(&conn, study_id)?;
        conn.execute(
            "INSERT OR REPLACE INTO study_attrs (study_id, key, value_json) VALUES (?1, ?2, ?3)",
            params![study_id.to_string(), key, serde_json::to_string(&value)?],
        )
        .map_err(query_err("upsert study attr"))?;
        Ok(())
    }

    fn study_attrs(&self, study_id: StudyId) -> HitlResult<HashMap<String, serde_json::Value>> {
        let conn = self.conn.lock();
        Self::ensure_study(&conn, study_id)?;
        let mut stmt = conn
            .prepare("SELECT key, value_json FROM study_attrs WHERE study_id = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![study_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(query_err("select study attrs"))?;

        let mut attrs = HashMap::new();
        for row in rows {
            let (key, raw) = row.map_err(db_err)?;
            attrs.insert(key, serde_json::from_str(&raw)?);
        }
        Ok(attrs)
    }

    fn create_trial(&self, study_id: StudyId, params: &Params) -> HitlResult<Trial> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        Self::ensure_study(&tx, study_id)?;

        let next: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(number) + 1, 0) FROM trials WHERE study_id = ?1",
                params![study_id.to_string()],
                |row| row.get(0),
            )
            .map_err(query_err("next trial number"))?;

        let trial = Trial::new(study_id, next as usize, params.clone());
        tx.execute(
            "INSERT INTO trials (trial_id, study_id, number, state, value, params_json, created_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)",
            params![
                trial.id.to_string(),
                study_id.to_string(),
                next,
                trial.state.as_str(),
                serde_json::to_string(&trial.parameters)?,
                trial.created_at.to_rfc3339()
            ],
        )
        .map_err(query_err("insert trial"))?;
        tx.commit().map_err(db_err)?;

        debug!(number = trial.number, "created trial");
        Ok(trial)
    }

    fn finish_trial(
        &self,
        study_id: StudyId,
        number: usize,
        outcome: TrialOutcome,
    ) -> HitlResult<(Trial, Transition)> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let current = Self::load_trial(&tx, study_id, number)?;
        let transition = current.state.transition(current.value, &outcome);
        match transition {
            Transition::Applied => {
                tx.execute(
                    "UPDATE trials SET state = ?1, value = ?2, finished_at = ?3
                     WHERE study_id = ?4 AND number = ?5",
                    params![
                        outcome.state().as_str(),
                        outcome.value(),
                        Utc::now().to_rfc3339(),
                        study_id.to_string(),
                        number as i64
                    ],
                )
                .map_err(query_err("finish trial"))?;
            }
            Transition::Unchanged => {}
            Transition::Conflict => {
                return Err(StorageError::TrialAlreadyFinished {
                    number,
                    state: current.state.to_string(),
                }
                .into());
            }
        }

        let trial = Self::load_trial(&tx, study_id, number)?;
        tx.commit().map_err(db_err)?;
        Ok((trial, transition))
    }

    fn set_trial_attr(
        &self,
        study_id: StudyId,
        number: usize,
        key: &str,
        value: serde_json::Value,
    ) -> HitlResult<()> {
        let conn = self.conn.lock();
        let trial_id: String = conn
            .query_row(
                "SELECT trial_id FROM trials WHERE study_id = ?1 AND number = ?2",
                params![study_id.to_string(), number as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_err("select trial id"))?
            .ok_or_else(|| trial_not_found(study_id, number))?;

        conn.execute(
            "INSERT OR REPLACE INTO trial_attrs (trial_id, key, value_json) VALUES (?1, ?2, ?3)",
            params![trial_id, key, serde_json::to_string(&value)?],
        )
        .map_err(query_err("upsert trial attr"))?;
        Ok(())
    }

    fn get_trial(&self, study_id: StudyId, number: usize) -> HitlResult<Trial> {
        let conn = self.conn.lock();
        Self::load_trial(&conn, study_id, number)
    }

    fn get_trials(&self, study_id: StudyId, states: Option<&[TrialState]>) -> HitlResult<Vec<Trial>> {
        let conn = self.conn.lock();
        Self::ensure_study(&conn, study_id)?;

        let mut args = vec![study_id.to_string()];
        let mut sql = format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE study_id = ?1");
        if let Some(states) = states {
            if states.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders: Vec<String> = (0..states.len()).map(|i| format!("?{}", i + 2)).collect();
            sql.push_str(&format!(" AND state IN ({})", placeholders.join(", ")));
            args.extend(states.iter().map(|s| s.as_str().to_string()));
        }
        sql.push_str(" ORDER BY number");

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), TrialRow::from_row)
            .map_err(query_err("select trials"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let attrs = Self::trial_attrs(&conn, &row.trial_id)?;
                row.into_trial(study_id, attrs)
            })
            .collect()
    }
}

fn find_study_in(conn: &Connection, name: &str) -> HitlResult<Option<StudyRecord>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT study_id, direction, created_at FROM studies WHERE study_name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(query_err("select study"))?;

    row.map(|(id, direction, created_at)| -> HitlResult<StudyRecord> {
        Ok(StudyRecord {
            id: parse_uuid(&id)?,
            name: name.to_string(),
            direction: ObjectiveDirection::parse(&direction)
                .ok_or_else(|| corruption(format!("unknown direction {direction}")))?,
            created_at: parse_time(&created_at)?,
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ParameterValue;
    use tempfile::tempdir;

    fn params(r: f64) -> Params {
        let mut p = Params::new();
        p.insert("r".into(), ParameterValue::Float(r));
        p.insert("g".into(), ParameterValue::Float(0.5));
        p.insert("b".into(), ParameterValue::Float(1.0));
        p
    }

    #[test]
    fn trials_round_trip_through_sqlite() {
        let storage = SqliteStorage::in_memory().unwrap();
        let study = storage.create_study("colors", ObjectiveDirection::Minimize).unwrap();

        let created = storage.create_trial(study.id, &params(0.25)).unwrap();
        storage
            .set_trial_attr(study.id, 0, "dashboard:note", serde_json::json!({"version": 1}))
            .unwrap();

        let loaded = storage.get_trial(study.id, 0).unwrap();
        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.parameters, created.parameters);
        assert_eq!(loaded.state, TrialState::Running);
        assert_eq!(
            loaded.attr("dashboard:note"),
            Some(&serde_json::json!({"version": 1}))
        );
    }

    #[test]
    fn state_filter_and_ordering() {
        let storage = SqliteStorage::in_memory().unwrap();
        let study = storage.create_study("colors", ObjectiveDirection::Minimize).unwrap();
        for i in 0..4 {
            storage.create_trial(study.id, &params(i as f64 / 4.0)).unwrap();
        }
        storage.finish_trial(study.id, 0, TrialOutcome::Complete(1.0)).unwrap();
        storage.finish_trial(study.id, 2, TrialOutcome::Pruned).unwrap();

        let running = storage.get_trials(study.id, Some(&[TrialState::Running])).unwrap();
        assert_eq!(running.iter().map(|t| t.number).collect::<Vec<_>>(), vec![1, 3]);

        let finished = storage
            .get_trials(study.id, Some(&[TrialState::Complete, TrialState::Pruned]))
            .unwrap();
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].value, Some(1.0));
        assert!(finished[0].finished_at.is_some());

        assert!(storage.get_trials(study.id, Some(&[])).unwrap().is_empty());
    }

    #[test]
    fn finish_is_idempotent_and_conflicts_are_rejected() {
        let storage = SqliteStorage::in_memory().unwrap();
        let study = storage.create_study("colors", ObjectiveDirection::Minimize).unwrap();
        storage.create_trial(study.id, &params(0.1)).unwrap();

        let (_, t1) = storage.finish_trial(study.id, 0, TrialOutcome::Complete(-1.0)).unwrap();
        let (trial, t2) = storage.finish_trial(study.id, 0, TrialOutcome::Complete(-1.0)).unwrap();
        assert_eq!(t1, Transition::Applied);
        assert_eq!(t2, Transition::Unchanged);
        assert_eq!(trial.state, TrialState::Complete);

        let err = storage.finish_trial(study.id, 0, TrialOutcome::Failed).unwrap_err();
        assert!(matches!(
            err,
            HitlError::Storage(StorageError::TrialAlreadyFinished { number: 0, .. })
        ));
    }

    #[test]
    fn study_survives_reopen_and_numbering_continues() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.sqlite3");

        let study_id = {
            let storage = SqliteStorage::open(&path).unwrap();
            let study = storage.create_study("colors", ObjectiveDirection::Minimize).unwrap();
            storage
                .set_metric_names(study.id, &["Do you like this color?".to_string()])
                .unwrap();
            for _ in 0..3 {
                storage.create_trial(study.id, &params(0.5)).unwrap();
            }
            study.id
        };

        let storage = SqliteStorage::open(&path).unwrap();
        let study = storage.find_study("colors").unwrap().unwrap();
        assert_eq!(study.id, study_id);
        assert_eq!(study.direction, ObjectiveDirection::Minimize);
        assert_eq!(
            storage.metric_names(study.id).unwrap(),
            vec!["Do you like this color?".to_string()]
        );

        let next = storage.create_trial(study.id, &params(0.5)).unwrap();
        assert_eq!(next.number, 3);
    }

    #[test]
    fn concurrent_handles_on_one_file_number_trials_uniquely() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.sqlite3");
        let study_id = SqliteStorage::open(&path)
            .unwrap()
            .create_study("colors", ObjectiveDirection::Minimize)
            .unwrap()
            .id;

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let storage = SqliteStorage::open(&path).unwrap();
                    let mut numbers = Vec::new();
                    for i in 0..25 {
                        let trial = storage.create_trial(study_id, &params(i as f64 / 25.0)).unwrap();
                        if i % 2 == 0 {
                            storage
                                .finish_trial(study_id, trial.number, TrialOutcome::Complete(worker as f64))
                                .unwrap();
                        }
                        numbers.push(trial.number);
                    }
                    numbers
                })
            })
            .collect();

        let mut numbers: Vec<usize> = workers
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (0..100).collect::<Vec<_>>());

        let storage = SqliteStorage::open(&path).unwrap();
        let trials = storage.get_trials(study_id, None).unwrap();
        assert_eq!(trials.len(), 100);
        let complete = trials.iter().filter(|t| t.state == TrialState::Complete).count();
        assert_eq!(complete, 50);
    }

    #[test]
    fn score_from_another_handle_is_seen_and_not_overwritten() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.sqlite3");
        let service = SqliteStorage::open(&path).unwrap();
        let study = service.create_study("colors", ObjectiveDirection::Minimize).unwrap();
        let looper = SqliteStorage::open(&path).unwrap();

        looper.create_trial(study.id, &params(0.3)).unwrap();
        service.finish_trial(study.id, 0, TrialOutcome::Complete(-1.0)).unwrap();

        assert!(looper
            .get_trials(study.id, Some(&[TrialState::Running]))
            .unwrap()
            .is_empty());
        assert!(looper
            .finish_trial(study.id, 0, TrialOutcome::Complete(1.0))
            .is_err());
        assert_eq!(looper.get_trial(study.id, 0).unwrap().value, Some(-1.0));
    }

    #[test]
    fn duplicate_study_rejected() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.create_study("colors", ObjectiveDirection::Maximize).unwrap();
        assert!(storage.create_study("colors", ObjectiveDirection::Maximize).is_err());
    }

    #[test]
    fn unknown_study_is_reported() {
        let storage = SqliteStorage::in_memory().unwrap();
        let err = storage.create_trial(Uuid::new_v4(), &params(0.5)).unwrap_err();
        assert!(matches!(err, HitlError::Storage(StorageError::StudyNotFound { .. })));
    }
}
