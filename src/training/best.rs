
/// Tracks the lowest validation score seen so far and the epoch it came from.
///
/// Scores are minimized. A candidate is promoted only when it is strictly
/// lower than the current best, so `epoch_of_best_val` always names the last
/// epoch at which `best_val` decreased.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestModelTracker {
    best_val: f64,
    epoch_of_best_val: u32,
}

impl Default for BestModelTracker {
    fn default() -> Self {
        BestModelTracker {
            best_val: f64::INFINITY,
            epoch_of_best_val: 0,
        }
    }
}

impl BestModelTracker {
    pub fn restore(best_val: f64, epoch_of_best_val: u32) -> Self {
        BestModelTracker {
            best_val,
            epoch_of_best_val,
        }
    }

    pub fn best_val(&self) -> f64 {
        self.best_val
    }

    pub fn epoch_of_best_val(&self) -> u32 {
        self.epoch_of_best_val
    }

    /// Returns true when `candidate` improves on the best score, in which case
    /// the tracker now points at `current_epoch`. NaN never improves.
    pub fn consider(&mut self, current_epoch: u32, candidate: f64) -> bool {
        if candidate < self.best_val {
            self.best_val = candidate;
            self.epoch_of_best_val = current_epoch;
            true
        } else {
            false
        }
    }
}
