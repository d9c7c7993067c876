//! Loop configuration.

use hitl_feedback::ObjectiveFormWidget;
use hitl_optimizer::StudyConfig;
use hitl_render::{DrawOptions, DORAVIRINE_SMILES};
use hitl_types::{config_error, HitlResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_N_BATCH: usize = 4;
pub const STORAGE_FILE: &str = "db.sqlite3";
pub const ARTIFACT_DIR: &str = "artifact";
pub const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub study: StudyConfig,

    /// Maximum number of trials awaiting a score at once.
    pub n_batch: usize,

    /// Sleep between capacity checks while the batch is full.
    pub backoff: Duration,

    pub storage_path: PathBuf,
    pub artifact_dir: PathBuf,

    /// Scratch directory for rendered images before upload.
    pub tmp_dir: PathBuf,

    /// SMILES of the structure to depict.
    pub structure: String,
    pub highlight_atoms: Vec<usize>,
    pub legend_prefix: String,
    pub draw: DrawOptions,

    /// How raters score a trial.
    pub widget: ObjectiveFormWidget,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            study: StudyConfig::default(),
            n_batch: DEFAULT_N_BATCH,
            backoff: Duration::from_secs(1),
            storage_path: PathBuf::from(STORAGE_FILE),
            artifact_dir: PathBuf::from(ARTIFACT_DIR),
            tmp_dir: PathBuf::from(TMP_DIR),
            structure: DORAVIRINE_SMILES.to_string(),
            highlight_atoms: (0..=6).collect(),
            legend_prefix: "trial".to_string(),
            draw: DrawOptions::default(),
            widget: ObjectiveFormWidget::rating(),
        }
    }
}

impl LoopConfig {
    /// Defaults with the database and directories placed under `root`.
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            storage_path: root.join(STORAGE_FILE),
            artifact_dir: root.join(ARTIFACT_DIR),
            tmp_dir: root.join(TMP_DIR),
            ..Self::default()
        }
    }

    pub fn with_n_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_study(mut self, study: StudyConfig) -> Self {
        self.study = study;
        self
    }

    pub fn with_structure(mut self, smiles: impl Into<String>, highlight_atoms: Vec<usize>) -> Self {
        self.structure = smiles.into();
        self.highlight_atoms = highlight_atoms;
        self
    }

    pub fn legend(&self, trial_number: usize) -> String {
        format!("{} {}", self.legend_prefix, trial_number)
    }

    pub fn validate(&self) -> HitlResult<()> {
        if self.n_batch == 0 {
            return Err(config_error!("n_batch must be at least 1"));
        }
        if self.structure.trim().is_empty() {
            return Err(config_error!("structure must not be empty"));
        }
        if self.draw.width == 0 || self.draw.height == 0 {
            return Err(config_error!(
                "canvas {}x{} has no pixels",
                self.draw.width,
                self.draw.height
            ));
        }
        self.widget.validate()?;
        self.study.validate()
    }
}
