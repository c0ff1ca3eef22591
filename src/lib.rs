//! # Flow Trainer
//!
//! Training orchestration for dense optical-flow networks. Drives an actor
//! through epochs, writes a checkpoint after every epoch, keeps the model
//! with the lowest validation score, and restarts from the last durable
//! checkpoint when an epoch crashes.
//!
//! ## Modules
//!
//! - [`training`]: Controller, run state, best-model tracker, collaborator traits
//! - [`checkpoint`]: Checkpoint records, atomic store with retention, resume resolver
//! - [`config`]: TOML configuration loading and validation
//! - [`error`]: Structured error types

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod training;
