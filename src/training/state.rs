use std::collections::BTreeMap;

use crate::checkpoint::{CheckpointField, CheckpointRecord, LoadMode, LoadOptions};
use crate::training::best::BestModelTracker;

/// Named scalar metrics produced by one pass over one loader.
pub type Metrics = BTreeMap<String, f64>;
/// Metrics of one epoch, keyed by loader name.
pub type EpochStats = BTreeMap<String, Metrics>;
/// Metrics of a whole run, keyed by epoch.
pub type Stats = BTreeMap<u32, EpochStats>;

/// Progress of a training run.
///
/// Values are never mutated in place: every transition consumes the state
/// and returns the next one, so the controller and the checkpoint store
/// always exchange a complete snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    epoch: u32,
    stats: Stats,
    best: BestModelTracker,
    just_started: bool,
}

impl Default for TrainingState {
    fn default() -> Self {
        TrainingState {
            epoch: 0,
            stats: Stats::new(),
            best: BestModelTracker::default(),
            just_started: false,
        }
    }
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn best_val(&self) -> f64 {
        self.best.best_val()
    }

    pub fn epoch_of_best_val(&self) -> u32 {
        self.best.epoch_of_best_val()
    }

    /// True until the first epoch of the current run has finished. Loaders
    /// use this to skip resampling on the first epoch.
    pub fn just_started(&self) -> bool {
        self.just_started
    }

    pub fn start_run(self) -> Self {
        TrainingState {
            just_started: true,
            ..self
        }
    }

    pub fn begin_epoch(self, epoch: u32) -> Self {
        TrainingState { epoch, ..self }
    }

    pub fn record_stats(mut self, epoch: u32, loader: &str, metrics: Metrics) -> Self {
        self.stats
            .entry(epoch)
            .or_default()
            .insert(loader.to_string(), metrics);
        self
    }

    /// Offer a validation score for the current epoch. The flag is true when
    /// the score became the new best.
    pub fn consider_validation(mut self, score: f64) -> (Self, bool) {
        let promoted = self.best.consider(self.epoch, score);
        (self, promoted)
    }

    pub fn finish_epoch(self) -> Self {
        TrainingState {
            just_started: false,
            ..self
        }
    }

    /// Undo an epoch that did not complete: the counter goes back by one and
    /// any stats recorded for the failed epoch are dropped.
    pub fn rollback_epoch(mut self) -> Self {
        self.stats.remove(&self.epoch);
        TrainingState {
            epoch: self.epoch.saturating_sub(1),
            ..self
        }
    }

    /// Copy the whitelisted progress fields of `record` into the state. Fresh
    /// loads keep the weights but reset all progress afterwards.
    pub fn restore_from(self, record: &CheckpointRecord, options: &LoadOptions, mode: LoadMode) -> Self {
        let mut next = self;
        for field in options.selected() {
            match field {
                CheckpointField::Epoch => next.epoch = record.epoch,
                CheckpointField::Stats => next.stats = record.stats.clone(),
                CheckpointField::BestVal => {
                    next.best = BestModelTracker::restore(record.best_val, next.best.epoch_of_best_val())
                }
                CheckpointField::EpochOfBestVal => {
                    next.best = BestModelTracker::restore(next.best.best_val(), record.epoch_of_best_val)
                }
                CheckpointField::StateDict
                | CheckpointField::Optimizer
                | CheckpointField::ActorType
                | CheckpointField::NetType
                | CheckpointField::NetInfo
                | CheckpointField::Constructor
                | CheckpointField::LrScheduler => {}
            }
        }
        match mode {
            LoadMode::Resume => next,
            LoadMode::Fresh => next.reset_progress(),
        }
    }

    fn reset_progress(self) -> Self {
        TrainingState {
            epoch: 0,
            stats: Stats::new(),
            best: BestModelTracker::default(),
            ..self
        }
    }
}
