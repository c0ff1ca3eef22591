use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{
    load_compatible, CheckpointField, CheckpointRecord, CheckpointSelector, CheckpointStore,
    LoadOptions, NetTypeMatch, ResolvedCheckpoint, RetentionPolicy, FORMAT_VERSION,
};
use crate::config::{Device, EnvSettings};
use crate::error::{CheckpointError, TrainingError};
use crate::training::actor::{
    DataLoader, EpochContext, EpochOutcome, LrScheduler, Optimizer, StateDict, TrainableActor,
};
use crate::training::state::TrainingState;

/// Name of the checkpoint holding the best validation score so far.
pub const BEST_CHECKPOINT: &str = "best";

/// Trainer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub max_epochs: u32,
    /// Resume from the last checkpoint when an epoch fails.
    pub fail_safe: bool,
    /// Upper bound on attempts per run, the first one included.
    pub max_attempts: u32,
    pub seed: u64,
    /// Run the validation loaders once before the first epoch.
    pub initial_validation: bool,
    pub net_type_match: NetTypeMatch,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            max_epochs: 100,
            fail_safe: true,
            max_attempts: 2,
            seed: 0,
            initial_validation: false,
            net_type_match: NetTypeMatch::Substring,
        }
    }
}

enum RunPhase {
    Running { attempt: u32, resume: bool },
    Recovering { attempt: u32, error: TrainingError },
    Failed(TrainingError),
    Completed,
}

/// Drives an actor through epochs, checkpointing after each one and
/// restarting from the last checkpoint when an epoch fails.
pub struct Trainer<A: TrainableActor> {
    actor: A,
    loaders: Vec<Box<dyn DataLoader>>,
    optimizer: Box<dyn Optimizer>,
    lr_scheduler: Option<Box<dyn LrScheduler>>,
    store: Option<CheckpointStore>,
    retention: RetentionPolicy,
    resume_options: LoadOptions,
    config: TrainerConfig,
    device: Device,
    state: TrainingState,
}

impl<A: TrainableActor> Trainer<A> {
    pub fn new(
        mut actor: A,
        loaders: Vec<Box<dyn DataLoader>>,
        optimizer: Box<dyn Optimizer>,
        env: &EnvSettings,
        config: TrainerConfig,
    ) -> Result<Self, TrainingError> {
        let device = Device::select(env.device, env.use_gpu, actor.gpu_available());
        actor
            .to_device(device)
            .map_err(|source| TrainingError::Device {
                device: device.to_string(),
                source,
            })?;

        let store = env.workspace().map(|workspace| {
            CheckpointStore::new(&workspace, &env.project_path, actor.model_type().clone())
        });
        match &store {
            Some(store) => info!(dir = %store.dir().display(), %device, "checkpoints enabled"),
            None => warn!(%device, "no workspace configured, checkpoints disabled"),
        }

        Ok(Trainer {
            actor,
            loaders,
            optimizer,
            lr_scheduler: None,
            store,
            retention: env.retention(),
            resume_options: LoadOptions::default(),
            config,
            device,
            state: TrainingState::new(),
        })
    }

    pub fn with_lr_scheduler(mut self, scheduler: Box<dyn LrScheduler>) -> Self {
        self.lr_scheduler = Some(scheduler);
        self
    }

    /// Fields to leave alone when resuming, on top of the ones never loaded.
    pub fn with_resume_options(mut self, options: LoadOptions) -> Self {
        self.resume_options = options;
        self
    }

    pub fn actor(&self) -> &A {
        &self.actor
    }

    pub fn actor_mut(&mut self) -> &mut A {
        &mut self.actor
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn lr_scheduler(&self) -> Option<&dyn LrScheduler> {
        self.lr_scheduler.as_deref()
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn store(&self) -> Option<&CheckpointStore> {
        self.store.as_ref()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Train with the configured epoch limit and fail-safe setting.
    pub fn train(&mut self, load_latest: bool) -> Result<TrainingState, TrainingError> {
        self.run(self.config.max_epochs, load_latest, self.config.fail_safe)
    }

    /// Train until `max_epochs` is reached.
    ///
    /// With `resume` set, the latest checkpoint of this model type is loaded
    /// first; a missing checkpoint only produces a warning. With `fail_safe`
    /// set, a failed epoch is rolled back and the run restarts from the latest
    /// checkpoint, up to `max_attempts` attempts in total. Checkpoint errors
    /// are never retried.
    pub fn run(
        &mut self,
        max_epochs: u32,
        resume: bool,
        fail_safe: bool,
    ) -> Result<TrainingState, TrainingError> {
        let max_attempts = if fail_safe {
            self.config.max_attempts.max(1)
        } else {
            1
        };
        self.transition(TrainingState::start_run);

        let mut phase = RunPhase::Running { attempt: 1, resume };
        loop {
            phase = match phase {
                RunPhase::Running { attempt, resume } => match self.attempt(max_epochs, resume) {
                    Ok(()) => RunPhase::Completed,
                    Err(error) if fail_safe && error.is_recoverable() => {
                        RunPhase::Recovering { attempt, error }
                    }
                    Err(error) => RunPhase::Failed(error),
                },
                RunPhase::Recovering { attempt, error } => {
                    error!(
                        epoch = self.state.epoch(),
                        attempt,
                        max_attempts,
                        error = ?error,
                        "training crashed"
                    );
                    self.transition(TrainingState::rollback_epoch);
                    if attempt < max_attempts {
                        info!(epoch = self.state.epoch(), "restarting training from last epoch");
                        RunPhase::Running {
                            attempt: attempt + 1,
                            resume: true,
                        }
                    } else {
                        RunPhase::Failed(TrainingError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(error),
                        })
                    }
                }
                RunPhase::Failed(error) => return Err(error),
                RunPhase::Completed => {
                    info!(epoch = self.state.epoch(), "finished training");
                    return Ok(self.state.clone());
                }
            };
        }
    }

    fn attempt(&mut self, max_epochs: u32, resume: bool) -> Result<(), TrainingError> {
        if resume {
            self.resume_latest()?;
        }

        if self.config.initial_validation
            && self.state.epoch() == 0
            && !self.state.stats().contains_key(&0)
        {
            self.initial_validation()?;
        }

        let next = self.state.epoch().checked_add(1).filter(|&next| next <= max_epochs);
        let Some(first) = next else {
            info!(epoch = self.state.epoch(), max_epochs, "nothing left to train");
            return Ok(());
        };
        for epoch in first..=max_epochs {
            self.train_epoch(epoch, max_epochs)?;
        }
        Ok(())
    }

    fn resume_latest(&mut self) -> Result<(), TrainingError> {
        let options = self.resume_options.clone();
        match self.load_checkpoint(&CheckpointSelector::Latest, &options) {
            Ok(_) => Ok(()),
            Err(CheckpointError::NotFound { location }) => {
                warn!(
                    location = %location.display(),
                    epoch = self.state.epoch(),
                    "no matching checkpoint file found, continuing from current state"
                );
                Ok(())
            }
            Err(CheckpointError::NoWorkspace) => {
                warn!(
                    epoch = self.state.epoch(),
                    "no workspace to resume from, continuing from current state"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn initial_validation(&mut self) -> Result<(), TrainingError> {
        let epoch = self.state.epoch();
        info!(epoch, "running initial validation");
        for (name, outcome) in self.run_passes(epoch, true)? {
            self.transition(|state| state.record_stats(epoch, &name, outcome.metrics));
        }
        Ok(())
    }

    fn train_epoch(&mut self, epoch: u32, max_epochs: u32) -> Result<(), TrainingError> {
        self.transition(|state| state.begin_epoch(epoch));

        let mut score = None;
        for (name, outcome) in self.run_passes(epoch, false)? {
            if outcome.validation_score.is_some() {
                score = outcome.validation_score;
            }
            self.transition(|state| state.record_stats(epoch, &name, outcome.metrics));
        }

        if let Some(scheduler) = self.lr_scheduler.as_mut() {
            scheduler.step(self.optimizer.as_mut());
        }
        if let Some(score) = score {
            self.consider_best(score)?;
        }
        self.transition(TrainingState::finish_epoch);

        if self.store.is_some() {
            self.save_checkpoint(None)?;
            self.prune_checkpoints()?;
        }

        info!(
            epoch,
            max_epochs,
            lr = self.optimizer.learning_rate(),
            stats = ?self.state.stats().get(&epoch),
            "epoch finished"
        );
        Ok(())
    }

    /// Run every loader once, or only the validation loaders.
    fn run_passes(
        &mut self,
        epoch: u32,
        validation_only: bool,
    ) -> Result<Vec<(String, EpochOutcome)>, TrainingError> {
        let just_started = self.state.just_started();
        let seed = self.config.seed.wrapping_add(u64::from(epoch));
        let fail = |source: anyhow::Error| TrainingError::EpochFailed { epoch, source };

        let mut outcomes = Vec::with_capacity(self.loaders.len());
        for loader in self
            .loaders
            .iter_mut()
            .filter(|loader| !(validation_only && loader.is_training()))
        {
            let ctx = EpochContext {
                epoch,
                is_training: loader.is_training(),
                just_started,
                seed,
            };
            loader.begin_epoch(&ctx).map_err(fail)?;
            if ctx.is_training {
                self.optimizer.zero_grad();
            }
            let outcome = self
                .actor
                .run_epoch(loader.as_mut(), self.optimizer.as_mut(), &ctx)
                .map_err(fail)?;
            outcomes.push((loader.name().to_string(), outcome));
        }
        Ok(outcomes)
    }

    fn consider_best(&mut self, score: f64) -> Result<(), TrainingError> {
        if score.is_nan() {
            warn!(epoch = self.state.epoch(), "validation score is NaN");
        }
        let previous = self.state.best_val();
        let (state, promoted) = std::mem::take(&mut self.state).consider_validation(score);
        self.state = state;

        if promoted {
            info!(epoch = self.state.epoch(), previous, best = score, "validation improved");
            if self.store.is_some() {
                self.save_checkpoint(Some(BEST_CHECKPOINT))?;
            }
        }
        Ok(())
    }

    fn prune_checkpoints(&self) -> Result<(), CheckpointError> {
        if let Some(store) = &self.store {
            let removed = store.prune(self.retention)?;
            if !removed.is_empty() {
                debug!(count = removed.len(), "pruned old checkpoints");
            }
        }
        Ok(())
    }

    /// Write the current actor, optimizer and progress to the store, as a
    /// numbered checkpoint or under `name`.
    pub fn save_checkpoint(&self, name: Option<&str>) -> Result<PathBuf, CheckpointError> {
        let store = self.store.as_ref().ok_or(CheckpointError::NoWorkspace)?;
        let record = self.capture()?;
        store.save(&record, name)
    }

    fn capture(&self) -> Result<CheckpointRecord, CheckpointError> {
        let state_dict = self
            .actor
            .state_dict()
            .map_err(|source| CheckpointError::StateCapture {
                field: "state_dict",
                source,
            })?;
        let optimizer = self
            .optimizer
            .state_dict()
            .map_err(|source| CheckpointError::StateCapture {
                field: "optimizer",
                source,
            })?;
        let lr_scheduler = self
            .lr_scheduler
            .as_ref()
            .map(|scheduler| scheduler.state_dict())
            .transpose()
            .map_err(|source| CheckpointError::StateCapture {
                field: "lr_scheduler",
                source,
            })?;

        Ok(CheckpointRecord {
            format_version: FORMAT_VERSION,
            epoch: self.state.epoch(),
            actor_type: self.actor.actor_type().to_string(),
            net_type: self.actor.model_type().to_string(),
            state_dict,
            net_info: self.actor.net_info(),
            constructor: self.actor.constructor(),
            optimizer,
            lr_scheduler,
            stats: self.state.stats().clone(),
            best_val: self.state.best_val(),
            epoch_of_best_val: self.state.epoch_of_best_val(),
        })
    }

    /// Resolve `selector`, check the recorded net type and restore the fields
    /// `options` selects.
    ///
    /// A checkpoint given as a file path only contributes weights and
    /// optimizer state: progress is reset to epoch 0 afterwards.
    pub fn load_checkpoint(
        &mut self,
        selector: &CheckpointSelector,
        options: &LoadOptions,
    ) -> Result<ResolvedCheckpoint, CheckpointError> {
        let resolved = selector.resolve(
            self.store.as_ref(),
            self.actor.model_type(),
            self.config.net_type_match,
        )?;
        info!(path = %resolved.path.display(), mode = ?resolved.mode, "loading checkpoint");

        let record = load_compatible(
            &resolved.path,
            self.actor.model_type(),
            self.config.net_type_match,
        )?;
        self.apply_record(&record, &resolved, options)?;

        info!(epoch = self.state.epoch(), "checkpoint loaded");
        Ok(resolved)
    }

    fn apply_record(
        &mut self,
        record: &CheckpointRecord,
        resolved: &ResolvedCheckpoint,
        options: &LoadOptions,
    ) -> Result<(), CheckpointError> {
        for field in options.selected() {
            match field {
                CheckpointField::StateDict => self
                    .actor
                    .load_state_dict(&record.state_dict)
                    .map_err(|source| CheckpointError::StateRestore {
                        field: "state_dict",
                        source,
                    })?,
                CheckpointField::Optimizer if !record.optimizer.is_empty() => self
                    .optimizer
                    .load_state_dict(&record.optimizer)
                    .map_err(|source| CheckpointError::StateRestore {
                        field: "optimizer",
                        source,
                    })?,
                // Progress fields go through the state transition below.
                CheckpointField::Optimizer
                | CheckpointField::Epoch
                | CheckpointField::Stats
                | CheckpointField::BestVal
                | CheckpointField::EpochOfBestVal
                | CheckpointField::ActorType
                | CheckpointField::NetType
                | CheckpointField::NetInfo
                | CheckpointField::Constructor
                | CheckpointField::LrScheduler => {}
            }
        }

        self.transition(|state| state.restore_from(record, options, resolved.mode));

        if let Some(info) = &record.net_info {
            self.actor.set_net_info(info.clone());
        }
        if options.load_constructor {
            if let Some(constructor) = &record.constructor {
                self.actor.set_constructor(constructor.clone());
            }
        }
        if options.loads(CheckpointField::Epoch) {
            if let Some(scheduler) = self.lr_scheduler.as_mut() {
                scheduler.set_last_epoch(self.state.epoch());
            }
        }
        Ok(())
    }

    fn transition(&mut self, next: impl FnOnce(TrainingState) -> TrainingState) {
        self.state = next(std::mem::take(&mut self.state));
    }
}
