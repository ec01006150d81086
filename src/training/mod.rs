//! Persistence of loss parameters across training runs

pub mod checkpoints;

pub use checkpoints::{Checkpoint, CheckpointManager};
