//! Batch loop controller.
//!
//! Keeps at most `n_batch` trials waiting for a human score. Each dispatch
//! runs one propose/render/store/annotate cycle; while the batch is full the
//! controller sleeps and re-checks.

use hitl_feedback::{
    get_artifact_path, register_objective_form_widgets, save_note, trial_note_template,
    upload_artifact, FileSystemBackend, NOTE_ATTR_KEY,
};
use hitl_optimizer::{SqliteStorage, Study, StudyStorage};
use hitl_render::{smiles, HighlightColor, MoleculeRenderer};
use hitl_types::{internal_error, HitlResult, RenderError};
use std::convert::Infallible;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::LoopConfig;

/// Long-lived state shared by every cycle.
pub struct LoopContext {
    config: LoopConfig,
    study: Study,
    backend: FileSystemBackend,
    renderer: MoleculeRenderer,
}

impl std::fmt::Debug for LoopContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopContext")
            .field("study", &self.study.name())
            .field("n_batch", &self.config.n_batch)
            .field("artifact_dir", &self.backend.base_path())
            .finish()
    }
}

impl LoopContext {
    /// Open (or create) the SQLite database at `config.storage_path` and
    /// prepare the study for rating.
    pub fn bootstrap(config: LoopConfig) -> HitlResult<Self> {
        config.validate()?;
        let storage: Arc<dyn StudyStorage> = Arc::new(SqliteStorage::open(&config.storage_path)?);
        Self::with_storage(config, storage)
    }

    /// Like [`LoopContext::bootstrap`] over an already opened storage.
    pub fn with_storage(config: LoopConfig, storage: Arc<dyn StudyStorage>) -> HitlResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.tmp_dir)?;
        let backend = FileSystemBackend::new(&config.artifact_dir)?;

        let study = Study::create(&config.study, storage)?;
        study.set_metric_names(&config.study.metric_names)?;
        register_objective_form_widgets(&study, std::slice::from_ref(&config.widget))?;

        let molecule = smiles::parse(&config.structure)?;
        let atom_count = molecule.atom_count();
        if let Some(&index) = config.highlight_atoms.iter().find(|&&i| i >= atom_count) {
            return Err(RenderError::AtomOutOfRange { index, atom_count }.into());
        }
        let renderer = MoleculeRenderer::new(molecule, config.draw.clone());

        let orphans = study.orphaned_trials(NOTE_ATTR_KEY)?;
        if !orphans.is_empty() {
            warn!(
                count = orphans.len(),
                trials = ?orphans.iter().map(|t| t.number).collect::<Vec<_>>(),
                "running trials without a note were left by an interrupted cycle; \
                 they hold batch capacity until skipped"
            );
        }

        info!(
            study = %study.name(),
            n_batch = config.n_batch,
            storage = %config.storage_path.display(),
            "loop context ready"
        );
        Ok(Self {
            config,
            study,
            backend,
            renderer,
        })
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn study(&self) -> &Study {
        &self.study
    }

    pub fn study_mut(&mut self) -> &mut Study {
        &mut self.study
    }

    pub fn backend(&self) -> &FileSystemBackend {
        &self.backend
    }

    pub fn renderer(&self) -> &MoleculeRenderer {
        &self.renderer
    }

    /// The study and artifact store, for serving feedback.
    pub fn into_parts(self) -> (Study, FileSystemBackend) {
        (self.study, self.backend)
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedTrial {
    pub number: usize,
    pub color: HighlightColor,
    pub artifact_id: String,
    pub artifact_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopStep {
    /// The batch was full; the controller slept for the backoff.
    Waited { running: usize },
    Dispatched(DispatchedTrial),
}

#[derive(Debug)]
pub struct BatchController {
    ctx: LoopContext,
}

impl BatchController {
    pub fn new(ctx: LoopContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &LoopContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut LoopContext {
        &mut self.ctx
    }

    fn running_count(&self) -> HitlResult<usize> {
        Ok(self.ctx.study.running_trials()?.len())
    }

    /// Whether another trial may be dispatched. Read-only.
    pub fn has_capacity(&self) -> HitlResult<bool> {
        Ok(self.running_count()? < self.ctx.config.n_batch)
    }

    /// One iteration of the loop.
    pub fn step(&mut self) -> HitlResult<LoopStep> {
        let running = self.running_count()?;
        if running >= self.ctx.config.n_batch {
            debug!(running, n_batch = self.ctx.config.n_batch, "batch full, waiting");
            std::thread::sleep(self.ctx.config.backoff);
            return Ok(LoopStep::Waited { running });
        }
        self.dispatch().map(LoopStep::Dispatched)
    }

    /// Propose a trial, render it, store the image and annotate the trial.
    ///
    /// A failure part-way leaves the trial running without a note; it is
    /// reported as orphaned on the next start.
    pub fn dispatch(&mut self) -> HitlResult<DispatchedTrial> {
        let ctx = &mut self.ctx;
        let trial = ctx.study.ask(&ctx.config.study.search_space)?;
        let number = trial.number;

        let channel = |name: &str| {
            trial
                .param_f64(name)
                .ok_or_else(|| internal_error!("trial {number} has no parameter '{name}'"))
        };
        let color = HighlightColor::new(channel("r")?, channel("g")?, channel("b")?);

        let png = ctx
            .renderer
            .render(color, &ctx.config.legend(number), &ctx.config.highlight_atoms)?;

        let mut scratch = tempfile::Builder::new()
            .prefix(&format!("trial-{number}-"))
            .suffix(".png")
            .tempfile_in(&ctx.config.tmp_dir)?;
        scratch.write_all(&png)?;
        scratch.flush()?;

        let artifact_id = upload_artifact(&ctx.backend, &ctx.study, number, scratch.path())?;
        scratch.close()?;

        let artifact_path = get_artifact_path(&trial, &artifact_id);
        save_note(&ctx.study, number, &trial_note_template(number, &artifact_path))?;

        for event in ctx.study.drain_events() {
            debug!(?event, "trial event");
        }
        info!(
            trial = number,
            r = color.r,
            g = color.g,
            b = color.b,
            artifact_id = %artifact_id,
            "trial dispatched for rating"
        );

        Ok(DispatchedTrial {
            number,
            color,
            artifact_id,
            artifact_path,
        })
    }

    /// Run until an error occurs.
    pub fn run(&mut self) -> HitlResult<Infallible> {
        info!(n_batch = self.ctx.config.n_batch, "starting batch loop");
        loop {
            self.step()?;
        }
    }
}
