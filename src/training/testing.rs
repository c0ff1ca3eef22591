//! Deterministic collaborators for exercising the controller.
//!
//! The actor fits a single scalar weight to a batch of samples drawn from
//! the epoch seed. A training pass moves the weight towards every sample; a
//! validation pass reports the mean squared distance as its score.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{ModelTag, NetConstructor};
use crate::config::Device;
use crate::training::actor::{
    DataLoader, EpochContext, EpochOutcome, Optimizer, StateDict, TrainableActor,
};
use crate::training::state::Metrics;

/// `(epoch, just_started)` for every `begin_epoch` a loader received.
pub type LoaderLog = Rc<RefCell<Vec<(u32, bool)>>>;

pub struct MockLoader {
    name: String,
    training: bool,
    log: LoaderLog,
}

impl MockLoader {
    pub fn recording(name: &str, training: bool) -> (Box<dyn DataLoader>, LoaderLog) {
        let log = LoaderLog::default();
        let loader = MockLoader {
            name: name.to_string(),
            training,
            log: Rc::clone(&log),
        };
        (Box::new(loader), log)
    }

    pub fn train() -> Box<dyn DataLoader> {
        Self::recording("train", true).0
    }

    pub fn val() -> Box<dyn DataLoader> {
        Self::recording("val", false).0
    }
}

impl DataLoader for MockLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn begin_epoch(&mut self, ctx: &EpochContext) -> anyhow::Result<()> {
        self.log.borrow_mut().push((ctx.epoch, ctx.just_started));
        Ok(())
    }
}

/// Samples depend only on the epoch seed, so a redone epoch and an
/// uninterrupted one see the same batch.
fn batch(seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..4).map(|_| 1.0 + rng.random_range(-0.5..0.5)).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ActorWeights {
    w: f64,
}

pub struct MockActor {
    tag: ModelTag,
    weights: ActorWeights,
    fail_once_at: BTreeSet<u32>,
    fail_always: bool,
    scripted_scores: BTreeMap<u32, f64>,
    info: Option<String>,
    constructor: Option<NetConstructor>,
    pub device: Option<Device>,
    pub gpu: bool,
    /// Every pass started, as `(epoch, is_training)`.
    pub passes: Vec<(u32, bool)>,
}

impl MockActor {
    pub fn new(tag: &str) -> Self {
        MockActor {
            tag: ModelTag::new(tag).expect("valid tag"),
            weights: ActorWeights { w: 0.0 },
            fail_once_at: BTreeSet::new(),
            fail_always: false,
            scripted_scores: BTreeMap::new(),
            info: Some(r#"{"pyramid_levels":4}"#.to_string()),
            constructor: None,
            device: None,
            gpu: false,
            passes: Vec::new(),
        }
    }

    /// Fail the training pass of `epoch` the first time it runs, after the
    /// weights have already been disturbed.
    pub fn crash_once_at(mut self, epoch: u32) -> Self {
        self.fail_once_at.insert(epoch);
        self
    }

    pub fn crash_always(mut self) -> Self {
        self.fail_always = true;
        self
    }

    /// Report `score` from the validation pass of `epoch` instead of the
    /// computed one.
    pub fn with_scores(mut self, scores: &[(u32, f64)]) -> Self {
        self.scripted_scores.extend(scores.iter().copied());
        self
    }

    pub fn with_constructor(mut self, constructor: NetConstructor) -> Self {
        self.constructor = Some(constructor);
        self
    }

    pub fn weight(&self) -> f64 {
        self.weights.w
    }

    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    pub fn clear_metadata(&mut self) {
        self.info = None;
        self.constructor = None;
    }

    pub fn loaded_constructor(&self) -> Option<&NetConstructor> {
        self.constructor.as_ref()
    }

    pub fn trained_epochs(&self) -> Vec<u32> {
        self.passes
            .iter()
            .filter(|(_, training)| *training)
            .map(|(epoch, _)| *epoch)
            .collect()
    }
}

impl StateDict for MockActor {
    fn state_dict(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(&self.weights)?)
    }

    fn load_state_dict(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.weights = bincode::deserialize(data).context("decoding actor weights")?;
        Ok(())
    }
}

impl TrainableActor for MockActor {
    fn actor_type(&self) -> &str {
        "MockActor"
    }

    fn model_type(&self) -> &ModelTag {
        &self.tag
    }

    fn run_epoch(
        &mut self,
        _loader: &mut dyn DataLoader,
        optimizer: &mut dyn Optimizer,
        ctx: &EpochContext,
    ) -> anyhow::Result<EpochOutcome> {
        self.passes.push((ctx.epoch, ctx.is_training));
        let samples = batch(ctx.seed);

        if ctx.is_training {
            let lr = optimizer.learning_rate();
            let mut loss = 0.0;
            for (i, s) in samples.iter().enumerate() {
                let err = self.weights.w - s;
                loss += err * err;
                self.weights.w -= lr * err;
                optimizer.step()?;
                if i == 1 && (self.fail_always || self.fail_once_at.remove(&ctx.epoch)) {
                    self.weights.w = f64::NAN;
                    bail!("CUDA out of memory at epoch {}", ctx.epoch);
                }
            }
            let metrics = Metrics::from([("loss".to_string(), loss / samples.len() as f64)]);
            return Ok(EpochOutcome::new(metrics));
        }

        let score = match self.scripted_scores.get(&ctx.epoch) {
            Some(score) => *score,
            None => {
                samples
                    .iter()
                    .map(|s| (self.weights.w - s).powi(2))
                    .sum::<f64>()
                    / samples.len() as f64
            }
        };
        let metrics = Metrics::from([("epe".to_string(), score)]);
        Ok(EpochOutcome::new(metrics).with_validation_score(score))
    }

    fn to_device(&mut self, device: Device) -> anyhow::Result<()> {
        self.device = Some(device);
        Ok(())
    }

    fn gpu_available(&self) -> bool {
        self.gpu
    }

    fn net_info(&self) -> Option<String> {
        self.info.clone()
    }

    fn set_net_info(&mut self, info: String) {
        self.info = Some(info);
    }

    fn constructor(&self) -> Option<NetConstructor> {
        self.constructor.clone()
    }

    fn set_constructor(&mut self, constructor: NetConstructor) {
        self.constructor = Some(constructor);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OptimizerState {
    lr: f64,
    steps: u64,
}

pub struct MockOptimizer {
    state: OptimizerState,
}

impl MockOptimizer {
    pub fn new(lr: f64) -> Self {
        MockOptimizer {
            state: OptimizerState { lr, steps: 0 },
        }
    }
}

impl StateDict for MockOptimizer {
    fn state_dict(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(&self.state)?)
    }

    fn load_state_dict(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.state = bincode::deserialize(data)?;
        Ok(())
    }
}

impl Optimizer for MockOptimizer {
    fn step(&mut self) -> anyhow::Result<()> {
        self.state.steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.state.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.state.lr = lr;
    }
}

/// Read the step counter back out of a mock optimizer's state blob.
pub fn optimizer_steps(blob: &[u8]) -> u64 {
    bincode::deserialize::<OptimizerState>(blob)
        .map(|state| state.steps)
        .unwrap_or_default()
}
