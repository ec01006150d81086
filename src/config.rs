//! Configuration for the loss evaluators

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{LossError, LossResult};
use crate::tensor::Device;

fn default_margin() -> f64 {
    0.1
}

fn default_alpha() -> f64 {
    32.0
}

fn default_num_proxy_sets() -> usize {
    1
}

fn default_margin_regularization_weight() -> f64 {
    10.0
}

/// Hyperparameters shared by the proxy-anchor family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyAnchorConfig {
    pub num_classes: usize,
    pub embedding_dim: usize,
    #[serde(default = "default_margin")]
    pub margin: f64,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Independently initialised proxy sets per class (adaptive variants)
    #[serde(default = "default_num_proxy_sets")]
    pub num_proxy_sets: usize,
    /// Weight of the margin regulariser (adaptive variants)
    #[serde(default = "default_margin_regularization_weight")]
    pub margin_regularization_weight: f64,
    #[serde(default)]
    pub device: Device,
    /// Seed for proxy initialisation; entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ProxyAnchorConfig {
    pub fn new(num_classes: usize, embedding_dim: usize) -> Self {
        Self {
            num_classes,
            embedding_dim,
            margin: default_margin(),
            alpha: default_alpha(),
            num_proxy_sets: default_num_proxy_sets(),
            margin_regularization_weight: default_margin_regularization_weight(),
            device: Device::Cpu,
            seed: None,
        }
    }

    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_num_proxy_sets(mut self, num_proxy_sets: usize) -> Self {
        self.num_proxy_sets = num_proxy_sets;
        self
    }

    pub fn with_margin_regularization_weight(mut self, weight: f64) -> Self {
        self.margin_regularization_weight = weight;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Every count and scalar must be strictly positive and the device usable
    pub fn validate(&self) -> LossResult<()> {
        if self.num_classes == 0 {
            return Err(LossError::ConfigurationError("num_classes must be positive".to_string()));
        }
        if self.embedding_dim == 0 {
            return Err(LossError::ConfigurationError("embedding_dim must be positive".to_string()));
        }
        if self.num_proxy_sets == 0 {
            return Err(LossError::ConfigurationError("num_proxy_sets must be positive".to_string()));
        }
        for (name, value) in [
            ("margin", self.margin),
            ("alpha", self.alpha),
            ("margin_regularization_weight", self.margin_regularization_weight),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(LossError::ConfigurationError(format!(
                    "{} must be a positive finite number, got {}",
                    name, value
                )));
            }
        }
        self.device.ensure_available()
    }
}

/// Which loss to build, with its hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "loss", rename_all = "snake_case")]
pub enum LossConfig {
    ProxyAnchor(ProxyAnchorConfig),
    AdaptiveProxyAnchor(ProxyAnchorConfig),
    AutoscaledProxyAnchor(ProxyAnchorConfig),
    NewtonProxyAnchor(ProxyAnchorConfig),
    ProxyNca {
        num_classes: usize,
        embedding_dim: usize,
        #[serde(default = "default_alpha")]
        scale: f64,
    },
    MultiSimilarity,
    Contrastive {
        #[serde(default = "default_contrastive_margin")]
        margin: f64,
    },
    Triplet {
        #[serde(default = "default_margin")]
        margin: f64,
    },
    NPair {
        #[serde(default)]
        l2_reg: f64,
    },
}

fn default_contrastive_margin() -> f64 {
    0.5
}

impl LossConfig {
    pub fn name(&self) -> &'static str {
        match self {
            LossConfig::ProxyAnchor(_) => "proxy_anchor",
            LossConfig::AdaptiveProxyAnchor(_) => "adaptive_proxy_anchor",
            LossConfig::AutoscaledProxyAnchor(_) => "autoscaled_proxy_anchor",
            LossConfig::NewtonProxyAnchor(_) => "newton_proxy_anchor",
            LossConfig::ProxyNca { .. } => "proxy_nca",
            LossConfig::MultiSimilarity => "multi_similarity",
            LossConfig::Contrastive { .. } => "contrastive",
            LossConfig::Triplet { .. } => "triplet",
            LossConfig::NPair { .. } => "n_pair",
        }
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> LossResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LossError::operation_error("config", &format!("Failed to read config file: {}", e)))?;
        let config: LossConfig = serde_json::from_str(&content)
            .map_err(|e| LossError::operation_error("config", &format!("Failed to parse config file: {}", e)))?;
        tracing::info!(loss = config.name(), "Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> LossResult<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| LossError::operation_error("config", &format!("Failed to write config file: {}", e)))?;
        tracing::info!(loss = self.name(), "Configuration saved to {:?}", path);
        Ok(())
    }
}

/// Closure-style builder for a `ProxyAnchorConfig`
pub struct ConfigBuilder {
    config: ProxyAnchorConfig,
}

impl ConfigBuilder {
    pub fn new(num_classes: usize, embedding_dim: usize) -> Self {
        Self {
            config: ProxyAnchorConfig::new(num_classes, embedding_dim),
        }
    }

    pub fn configure(mut self, f: impl FnOnce(&mut ProxyAnchorConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> LossResult<ProxyAnchorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_follow_reference_hyperparameters() {
        let config = ProxyAnchorConfig::new(100, 512);
        assert_eq!(config.margin, 0.1);
        assert_eq!(config.alpha, 32.0);
        assert_eq!(config.num_proxy_sets, 1);
        assert_eq!(config.margin_regularization_weight, 10.0);
        assert_eq!(config.device, Device::Cpu);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new(10, 64)
            .configure(|c| {
                c.alpha = 16.0;
                c.num_proxy_sets = 3;
            })
            .build()
            .unwrap();
        assert_eq!(config.alpha, 16.0);
        assert_eq!(config.num_proxy_sets, 3);
    }

    #[test]
    fn test_validation_rejects_non_positive_values() {
        assert!(ProxyAnchorConfig::new(0, 8).validate().is_err());
        assert!(ProxyAnchorConfig::new(4, 0).validate().is_err());
        assert!(ProxyAnchorConfig::new(4, 8).with_margin(0.0).validate().is_err());
        assert!(ProxyAnchorConfig::new(4, 8).with_alpha(-1.0).validate().is_err());
        assert!(ProxyAnchorConfig::new(4, 8).with_num_proxy_sets(0).validate().is_err());
        assert!(ProxyAnchorConfig::new(4, 8).with_margin_regularization_weight(f64::NAN).validate().is_err());
        let err = ProxyAnchorConfig::new(4, 8).with_device(Device::Cuda(0)).validate().unwrap_err();
        assert!(matches!(err, LossError::DeviceError(_)));
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let json = r#"{ "loss": "adaptive_proxy_anchor", "num_classes": 5, "embedding_dim": 16, "num_proxy_sets": 2 }"#;
        let config: LossConfig = serde_json::from_str(json).unwrap();
        match config {
            LossConfig::AdaptiveProxyAnchor(c) => {
                assert_eq!(c.num_proxy_sets, 2);
                assert_eq!(c.margin, 0.1);
                assert_eq!(c.seed, None);
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_config_file_io() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("loss.json");

        let config = LossConfig::NewtonProxyAnchor(ProxyAnchorConfig::new(3, 4).with_seed(11));
        config.save_to_file(&path).unwrap();
        assert_eq!(LossConfig::load_from_file(&path).unwrap(), config);

        let triplet: LossConfig = serde_json::from_str(r#"{ "loss": "triplet" }"#).unwrap();
        assert_eq!(triplet, LossConfig::Triplet { margin: 0.1 });
    }
}
