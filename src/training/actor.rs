use crate::checkpoint::{ModelTag, NetConstructor};
use crate::config::Device;
use crate::training::state::Metrics;

/// Component whose internal state can be captured into and restored from
/// an opaque byte blob.
pub trait StateDict {
    fn state_dict(&self) -> anyhow::Result<Vec<u8>>;

    fn load_state_dict(&mut self, data: &[u8]) -> anyhow::Result<()>;
}

/// Everything a collaborator needs to know about the pass it is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochContext {
    pub epoch: u32,
    pub is_training: bool,
    /// True on the first epoch of a run; loaders should not resample then.
    pub just_started: bool,
    /// Seed for epoch-local randomness. Derived from the run seed and the
    /// epoch, so a redone epoch sees the same samples.
    pub seed: u64,
}

/// Result of one pass over one loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochOutcome {
    pub metrics: Metrics,
    /// Score to minimize; only validation passes produce one.
    pub validation_score: Option<f64>,
}

impl EpochOutcome {
    pub fn new(metrics: Metrics) -> Self {
        EpochOutcome {
            metrics,
            validation_score: None,
        }
    }

    pub fn with_validation_score(mut self, score: f64) -> Self {
        self.validation_score = Some(score);
        self
    }
}

/// A source of batches for one split (training or validation).
pub trait DataLoader {
    /// Key under which this loader's metrics are stored.
    fn name(&self) -> &str;

    fn is_training(&self) -> bool;

    /// Called before every pass. Loaders that draw a new sample set per
    /// epoch should do so here unless `ctx.just_started` is set.
    fn begin_epoch(&mut self, _ctx: &EpochContext) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait Optimizer: StateDict {
    /// Apply the accumulated gradients.
    fn step(&mut self) -> anyhow::Result<()>;

    fn zero_grad(&mut self) {}

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

pub trait LrScheduler: StateDict {
    /// Advance the schedule by one epoch and apply the new rate.
    fn step(&mut self, optimizer: &mut dyn Optimizer);

    fn last_epoch(&self) -> u32;

    /// Re-align the schedule after a load. Does not touch the optimizer,
    /// whose restored state already carries the rate.
    fn set_last_epoch(&mut self, epoch: u32);
}

/// Wraps a network together with its loss and runs it over a loader.
pub trait TrainableActor: StateDict {
    /// Name of the actor implementation, recorded in checkpoints.
    fn actor_type(&self) -> &str;

    /// Identifier of the wrapped network variant.
    fn model_type(&self) -> &ModelTag;

    /// One full pass over `loader`. Training passes step `optimizer`.
    fn run_epoch(
        &mut self,
        loader: &mut dyn DataLoader,
        optimizer: &mut dyn Optimizer,
        ctx: &EpochContext,
    ) -> anyhow::Result<EpochOutcome>;

    fn to_device(&mut self, _device: Device) -> anyhow::Result<()> {
        Ok(())
    }

    fn gpu_available(&self) -> bool {
        false
    }

    /// JSON description of the network, stored alongside the weights.
    fn net_info(&self) -> Option<String> {
        None
    }

    fn set_net_info(&mut self, _info: String) {}

    fn constructor(&self) -> Option<NetConstructor> {
        None
    }

    fn set_constructor(&mut self, _constructor: NetConstructor) {}
}
