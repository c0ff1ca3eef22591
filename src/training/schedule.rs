//! Epoch-based learning rate decay schedules.

use serde::{Deserialize, Serialize};

use crate::training::actor::{LrScheduler, Optimizer, StateDict};

/// Multiply the rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLr {
    base_lr: f64,
    step_size: u32,
    gamma: f64,
    last_epoch: u32,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: u32, gamma: f64) -> Self {
        StepLr {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            last_epoch: 0,
        }
    }

    pub fn lr_at(&self, epoch: u32) -> f64 {
        self.base_lr * self.gamma.powi((epoch / self.step_size) as i32)
    }
}

impl StateDict for StepLr {
    fn state_dict(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn load_state_dict(&mut self, data: &[u8]) -> anyhow::Result<()> {
        *self = bincode::deserialize(data)?;
        Ok(())
    }
}

impl LrScheduler for StepLr {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;
        optimizer.set_learning_rate(self.lr_at(self.last_epoch));
    }

    fn last_epoch(&self) -> u32 {
        self.last_epoch
    }

    fn set_last_epoch(&mut self, epoch: u32) {
        self.last_epoch = epoch;
    }
}

/// Multiply the rate by `gamma` each time a milestone epoch is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<u32>,
    gamma: f64,
    last_epoch: u32,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, mut milestones: Vec<u32>, gamma: f64) -> Self {
        milestones.sort_unstable();
        milestones.dedup();
        MultiStepLr {
            base_lr,
            milestones,
            gamma,
            last_epoch: 0,
        }
    }

    pub fn lr_at(&self, epoch: u32) -> f64 {
        let passed = self.milestones.partition_point(|&m| m <= epoch);
        self.base_lr * self.gamma.powi(passed as i32)
    }
}

impl StateDict for MultiStepLr {
    fn state_dict(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn load_state_dict(&mut self, data: &[u8]) -> anyhow::Result<()> {
        *self = bincode::deserialize(data)?;
        Ok(())
    }
}

impl LrScheduler for MultiStepLr {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;
        optimizer.set_learning_rate(self.lr_at(self.last_epoch));
    }

    fn last_epoch(&self) -> u32 {
        self.last_epoch
    }

    fn set_last_epoch(&mut self, epoch: u32) {
        self.last_epoch = epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::testing::MockOptimizer;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_step_lr_decays_every_step_size() {
        let mut sched = StepLr::new(1e-2, 2, 0.5);
        let mut opt = MockOptimizer::new(1e-2);
        let mut seen = Vec::new();
        for _ in 0..5 {
            sched.step(&mut opt);
            seen.push(opt.learning_rate());
        }
        let expected = [1e-2, 5e-3, 5e-3, 2.5e-3, 2.5e-3];
        for (got, want) in seen.iter().zip(expected) {
            assert!(close(*got, want), "{got} != {want}");
        }
        assert_eq!(sched.last_epoch(), 5);
    }

    #[test]
    fn test_multi_step_lr_milestones() {
        let sched = MultiStepLr::new(1.0, vec![30, 10, 10], 0.1);
        assert!(close(sched.lr_at(0), 1.0));
        assert!(close(sched.lr_at(9), 1.0));
        assert!(close(sched.lr_at(10), 0.1));
        assert!(close(sched.lr_at(29), 0.1));
        assert!(close(sched.lr_at(30), 0.01));
    }

    #[test]
    fn test_set_last_epoch_realigns_schedule() {
        let mut sched = MultiStepLr::new(1.0, vec![3], 0.5);
        let mut opt = MockOptimizer::new(1.0);
        sched.set_last_epoch(2);
        sched.step(&mut opt);
        assert_eq!(sched.last_epoch(), 3);
        assert!(close(opt.learning_rate(), 0.5));
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let mut sched = StepLr::new(0.1, 3, 0.1);
        let mut opt = MockOptimizer::new(0.1);
        sched.step(&mut opt);
        sched.step(&mut opt);

        let blob = sched.state_dict().unwrap();
        let mut restored = StepLr::new(1.0, 1, 1.0);
        restored.load_state_dict(&blob).unwrap();
        assert_eq!(restored, sched);
        assert!(restored.load_state_dict(b"\x01").is_err());
    }
}
