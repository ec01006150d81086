//! Checkpoint management for loss parameters

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{
    error::{LossError, LossResult},
    nn::{losses::MetricLoss, parameter::StateDict},
};

/// Snapshot of a loss's trainable parameters at some training step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: usize,
    pub loss: f64,
    /// `MetricLoss::name` of the loss the state belongs to
    pub loss_name: String,
    pub state: StateDict,
}

impl Checkpoint {
    pub fn capture<M: MetricLoss + ?Sized>(module: &M, step: usize, loss: f64) -> Self {
        Self {
            step,
            loss,
            loss_name: module.name().to_string(),
            state: module.state_dict(),
        }
    }

    /// Load the stored parameters into `module`; nothing changes on failure.
    ///
    /// Variants sharing a parameter layout are told apart by name.
    pub fn restore<M: MetricLoss + ?Sized>(&self, module: &mut M) -> LossResult<()> {
        if self.loss_name != module.name() {
            return Err(LossError::InvalidInput(format!(
                "checkpoint holds {} parameters, cannot restore into {}",
                self.loss_name,
                module.name()
            )));
        }
        module.load_state_dict(&self.state)
    }
}

/// Checkpoint manager
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
            max_checkpoints: 5,
        }
    }

    /// Older checkpoints beyond this count are removed after each save.
    /// The checkpoint just written is always kept.
    pub fn with_max_checkpoints(mut self, max_checkpoints: usize) -> Self {
        self.max_checkpoints = max_checkpoints.max(1);
        self
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{}.ckpt", name))
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint, name: &str) -> LossResult<()> {
        std::fs::create_dir_all(&self.checkpoint_dir).map_err(|e| {
            LossError::IoError(format!("Failed to create checkpoint directory: {}", e))
        })?;

        let checkpoint_path = self.path_for(name);
        let serialized = bincode::serialize(checkpoint)?;
        std::fs::write(&checkpoint_path, serialized)
            .map_err(|e| LossError::IoError(format!("Failed to write checkpoint: {}", e)))?;

        tracing::info!(step = checkpoint.step, loss = checkpoint.loss, "Saved checkpoint: {:?}", checkpoint_path);
        self.cleanup_old_checkpoints(self.max_checkpoints)
    }

    fn read_checkpoint(&self, name: &str) -> LossResult<Checkpoint> {
        let checkpoint_path = self.path_for(name);
        let serialized = std::fs::read(&checkpoint_path)
            .map_err(|e| LossError::IoError(format!("Failed to read checkpoint {:?}: {}", checkpoint_path, e)))?;
        Ok(bincode::deserialize(&serialized)?)
    }

    pub fn load_checkpoint(&self, name: &str) -> LossResult<Checkpoint> {
        let checkpoint_path = self.path_for(name);
        let checkpoint = self.read_checkpoint(name)?;

        tracing::info!(step = checkpoint.step, "Loaded checkpoint: {:?}", checkpoint_path);
        Ok(checkpoint)
    }

    /// Names of stored checkpoints, sorted
    pub fn list_checkpoints(&self) -> LossResult<Vec<String>> {
        let mut checkpoints = Vec::new();

        if self.checkpoint_dir.exists() {
            for entry in std::fs::read_dir(&self.checkpoint_dir)? {
                let path = entry?.path();
                if path.extension().map_or(false, |ext| ext == "ckpt") {
                    if let Some(name) = path.file_stem().and_then(|n| n.to_str()) {
                        checkpoints.push(name.to_string());
                    }
                }
            }
        }

        checkpoints.sort();
        Ok(checkpoints)
    }

    /// Keep only the `keep_count` newest checkpoints
    pub fn cleanup_old_checkpoints(&self, keep_count: usize) -> LossResult<()> {
        let names = self.list_checkpoints()?;
        if names.len() <= keep_count {
            return Ok(());
        }

        let mut checkpoints = Vec::with_capacity(names.len());
        for name in names {
            let modified = std::fs::metadata(self.path_for(&name))?.modified()?;
            let step = self.read_checkpoint(&name)?.step;
            checkpoints.push((modified, step, name));
        }
        // newest first; equal timestamps fall back to the training step
        checkpoints.sort_by(|a, b| b.cmp(a));

        for (_, _, checkpoint) in checkpoints.iter().skip(keep_count) {
            let checkpoint_path = self.path_for(checkpoint);
            std::fs::remove_file(&checkpoint_path)
                .map_err(|e| LossError::IoError(format!("Failed to remove old checkpoint: {}", e)))?;
            tracing::info!("Removed old checkpoint: {:?}", checkpoint_path);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::AutogradEngine;
    use crate::config::ProxyAnchorConfig;
    use crate::nn::init::{kaiming_normal_fan_out, seeded_rng};
    use crate::nn::losses::{AdaptiveProxyAnchorLoss, AutoscaledProxyAnchorLoss, MetricLoss};
    use crate::nn::parameter::Module;
    use crate::tensor::{Device, Shape};
    use tempfile::tempdir;

    fn loss(seed: u64) -> AdaptiveProxyAnchorLoss {
        let config = ProxyAnchorConfig::new(3, 4).with_num_proxy_sets(2).with_seed(seed);
        AdaptiveProxyAnchorLoss::from_config(&config).unwrap()
    }

    #[test]
    fn test_round_trip_restores_loss_values() {
        let temp_dir = tempdir().unwrap();
        let manager = CheckpointManager::new(temp_dir.path());

        let trained = loss(1);
        let checkpoint = Checkpoint::capture(&trained, 40, 1.25);
        manager.save_checkpoint(&checkpoint, "step-40").unwrap();

        let mut fresh = loss(2);
        let loaded = manager.load_checkpoint("step-40").unwrap();
        assert_eq!(loaded, checkpoint);
        loaded.restore(&mut fresh).unwrap();

        let batch = kaiming_normal_fan_out(Shape::new([5, 4]), Device::Cpu, &mut seeded_rng(Some(3)));
        let labels = [0, 1, 2, 1, 0];
        let evaluate = |l: &AdaptiveProxyAnchorLoss| {
            let engine = AutogradEngine::new();
            l.forward(&engine.variable(batch.clone(), false), &labels).unwrap().item().unwrap()
        };
        assert_eq!(evaluate(&trained), evaluate(&fresh));
    }

    #[test]
    fn test_restore_rejects_other_layout() {
        let checkpoint = Checkpoint::capture(&loss(1), 0, 0.0);
        let config = ProxyAnchorConfig::new(3, 4).with_num_proxy_sets(3);
        let mut other = AdaptiveProxyAnchorLoss::from_config(&config).unwrap();
        assert!(checkpoint.restore(&mut other).is_err());
    }

    #[test]
    fn test_restore_rejects_other_variant() {
        let config = ProxyAnchorConfig::new(3, 4).with_num_proxy_sets(2).with_seed(1);
        let autoscaled = AutoscaledProxyAnchorLoss::from_config(&config).unwrap();
        let checkpoint = Checkpoint::capture(&autoscaled, 10, 0.5);
        assert_eq!(checkpoint.loss_name, "autoscaled_proxy_anchor");

        let mut adaptive = loss(2);
        let before = adaptive.state_dict();
        let err = checkpoint.restore(&mut adaptive).unwrap_err();
        assert!(matches!(err, LossError::InvalidInput(_)));
        assert_eq!(adaptive.state_dict(), before);
    }

    #[test]
    fn test_list_and_cleanup() {
        let temp_dir = tempdir().unwrap();
        let manager = CheckpointManager::new(temp_dir.path()).with_max_checkpoints(2);
        let source = loss(1);
        for step in 1..=4 {
            let checkpoint = Checkpoint::capture(&source, step, 0.0);
            manager.save_checkpoint(&checkpoint, &format!("step-{}", step)).unwrap();
        }
        assert_eq!(manager.list_checkpoints().unwrap(), vec!["step-3", "step-4"]);
    }

    #[test]
    fn test_cleanup_orders_equal_timestamps_by_step() {
        let temp_dir = tempdir().unwrap();
        let manager = CheckpointManager::new(temp_dir.path()).with_max_checkpoints(10);
        let source = loss(1);
        for step in [9, 10, 11] {
            let checkpoint = Checkpoint::capture(&source, step, 0.0);
            manager.save_checkpoint(&checkpoint, &format!("step-{}", step)).unwrap();
        }
        let stamp = std::fs::metadata(temp_dir.path().join("step-9.ckpt")).unwrap().modified().unwrap();
        for name in ["step-9", "step-10", "step-11"] {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(temp_dir.path().join(format!("{}.ckpt", name)))
                .unwrap();
            file.set_modified(stamp).unwrap();
        }

        manager.cleanup_old_checkpoints(2).unwrap();
        assert_eq!(manager.list_checkpoints().unwrap(), vec!["step-10", "step-11"]);
    }

    #[test]
    fn test_zero_max_checkpoints_keeps_latest() {
        let temp_dir = tempdir().unwrap();
        let manager = CheckpointManager::new(temp_dir.path()).with_max_checkpoints(0);
        let source = loss(1);
        let checkpoint = Checkpoint::capture(&source, 3, 0.0);
        manager.save_checkpoint(&checkpoint, "latest").unwrap();
        assert_eq!(manager.load_checkpoint("latest").unwrap(), checkpoint);
    }

    #[test]
    fn test_missing_checkpoint_is_io_error() {
        let temp_dir = tempdir().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().join("none"));
        assert!(manager.list_checkpoints().unwrap().is_empty());
        assert!(matches!(manager.load_checkpoint("x"), Err(LossError::IoError(_))));
    }
}
