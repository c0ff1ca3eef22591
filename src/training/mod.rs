//! The training loop: collaborator traits, immutable run state, best-model
//! tracking, learning rate schedules and the fail-safe controller.

pub mod actor;
pub mod best;
pub mod controller;
pub mod schedule;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{Trainer, TrainerConfig, BEST_CHECKPOINT};
pub use state::TrainingState;
