//! Metric-learning loss functions with automatic differentiation support
//!
//! The proxy-anchor family lives in `proxy_anchor`, `adaptive` and `newton`;
//! `adapters` wraps losses supplied by an injected metric-learning library.

pub mod adapters;
pub mod adaptive;
pub mod newton;
pub mod proxy_anchor;

pub use adapters::*;
pub use adaptive::{AdaptiveProxyAnchorLoss, AutoscaledProxyAnchorLoss};
pub use newton::NewtonProxyAnchorLoss;
pub use proxy_anchor::ProxyAnchorLoss;

use std::sync::Arc;

use crate::{
    autograd::Variable,
    config::LossConfig,
    error::{LossError, LossResult},
    nn::parameter::Module,
};

/// Base trait for all metric losses
pub trait MetricLoss: Module + Send + Sync {
    /// Scalar loss for a batch of `[N, D]` embeddings and their class labels
    fn forward(&self, embeddings: &Variable, labels: &[usize]) -> LossResult<Variable>;

    /// Get the name of the loss function
    fn name(&self) -> &'static str;
}

/// Normalisation and encoding helpers shared by the proxy losses
pub mod utils {
    use crate::{
        autograd::Variable,
        error::{LossError, LossResult},
        tensor::{Device, Shape, Tensor},
    };

    /// Added to the squared norm before the square root
    pub const NORM_EPS: f64 = 1e-12;

    /// Scale every row to unit L2 norm: `x / sqrt(Σ x² + 1e-12)`
    pub fn l2_norm(input: &Variable) -> LossResult<Variable> {
        let norm = input.mul(input)?.sum_axis(1)?.shift(NORM_EPS)?.sqrt()?;
        input.div(&norm)
    }

    /// Cosine similarity of every row of `x` with every row of `proxies`, `[N, C]`
    pub fn cosine_similarity(x: &Variable, proxies: &Variable) -> LossResult<Variable> {
        l2_norm(x)?.linear(&l2_norm(proxies)?)
    }

    /// One-hot `[N, num_classes]` membership matrix.
    ///
    /// Labels are validated before anything is encoded.
    pub fn binarize(labels: &[usize], num_classes: usize, device: Device) -> LossResult<Tensor> {
        if let Some(&label) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(LossError::InvalidLabel { label, num_classes });
        }
        let mut one_hot = Tensor::zeros(Shape::new([labels.len(), num_classes]), device);
        let data = one_hot.as_slice_mut();
        for (row, &label) in labels.iter().enumerate() {
            data[row * num_classes + label] = 1.0;
        }
        Ok(one_hot)
    }

    /// Number of classes with at least one positive sample
    pub fn count_classes_present(one_hot: &Tensor) -> usize {
        (0..one_hot.cols())
            .filter(|&k| (0..one_hot.rows()).any(|i| one_hot.get(i, k) != 0.0))
            .count()
    }
}

/// Loss function factory for building a boxed loss from its configuration
pub struct LossFactory;

impl LossFactory {
    /// Build the configured loss. Adapter losses need `library`.
    pub fn create(
        config: &LossConfig,
        library: Option<Arc<dyn MetricLearningLibrary>>,
    ) -> LossResult<Box<dyn MetricLoss>> {
        let require_library = || {
            library.clone().ok_or_else(|| {
                LossError::ConfigurationError(format!(
                    "loss '{}' delegates to a metric-learning library, but none was provided",
                    config.name()
                ))
            })
        };
        let loss: Box<dyn MetricLoss> = match config {
            LossConfig::ProxyAnchor(c) => Box::new(ProxyAnchorLoss::from_config(c)?),
            LossConfig::AdaptiveProxyAnchor(c) => Box::new(AdaptiveProxyAnchorLoss::from_config(c)?),
            LossConfig::AutoscaledProxyAnchor(c) => Box::new(AutoscaledProxyAnchorLoss::from_config(c)?),
            LossConfig::NewtonProxyAnchor(c) => Box::new(NewtonProxyAnchorLoss::from_config(c)?),
            LossConfig::ProxyNca {
                num_classes,
                embedding_dim,
                scale,
            } => Box::new(ProxyNcaLoss::new(require_library()?.as_ref(), *num_classes, *embedding_dim, *scale)?),
            LossConfig::MultiSimilarity => Box::new(MultiSimilarityLoss::new(require_library()?.as_ref())?),
            LossConfig::Contrastive { margin } => Box::new(ContrastiveLoss::new(require_library()?.as_ref(), *margin)?),
            LossConfig::Triplet { margin } => Box::new(TripletLoss::new(require_library()?.as_ref(), *margin)?),
            LossConfig::NPair { l2_reg } => Box::new(NPairLoss::new(require_library()?.as_ref(), *l2_reg)?),
        };
        tracing::debug!(loss = loss.name(), "created loss");
        Ok(loss)
    }

    /// List all available loss functions
    pub fn available_losses() -> Vec<&'static str> {
        vec![
            "proxy_anchor",
            "adaptive_proxy_anchor",
            "autoscaled_proxy_anchor",
            "newton_proxy_anchor",
            "proxy_nca",
            "multi_similarity",
            "contrastive",
            "triplet",
            "n_pair",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::utils::*;
    use super::*;
    use crate::autograd::AutogradEngine;
    use crate::config::ProxyAnchorConfig;
    use crate::tensor::{Device, Tensor};

    #[test]
    fn test_l2_norm_rows_are_unit_length() {
        let engine = AutogradEngine::new();
        let x = engine.variable(Tensor::from_rows(&[vec![3.0, 4.0], vec![0.0, -2.0]]).unwrap(), false);
        let n = l2_norm(&x).unwrap();
        let t = n.tensor();
        assert!((t.get(0, 0) - 0.6).abs() < 1e-12);
        assert!((t.get(0, 1) - 0.8).abs() < 1e-12);
        assert!((t.get(1, 1) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_l2_norm_of_zero_row_is_finite() {
        let engine = AutogradEngine::new();
        let x = engine.variable(Tensor::from_rows(&[vec![0.0, 0.0]]).unwrap(), true);
        let n = l2_norm(&x).unwrap();
        assert!(n.tensor().is_finite());
        assert_eq!(n.tensor().as_slice(), &[0.0, 0.0]);
    }

    #[test]
    fn test_binarize() {
        let one_hot = binarize(&[2, 0, 2], 3, Device::Cpu).unwrap();
        assert_eq!(one_hot.as_slice(), &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(count_classes_present(&one_hot), 2);
    }

    #[test]
    fn test_binarize_rejects_out_of_range_label() {
        let err = binarize(&[0, 3], 3, Device::Cpu).unwrap_err();
        assert_eq!(err, LossError::InvalidLabel { label: 3, num_classes: 3 });
    }

    #[test]
    fn test_factory_builds_proxy_anchor_family_without_library() {
        let base = ProxyAnchorConfig::new(4, 8).with_seed(3);
        for config in [
            LossConfig::ProxyAnchor(base.clone()),
            LossConfig::AdaptiveProxyAnchor(base.clone()),
            LossConfig::AutoscaledProxyAnchor(base.clone()),
            LossConfig::NewtonProxyAnchor(base.clone()),
        ] {
            let loss = LossFactory::create(&config, None).unwrap();
            assert_eq!(loss.name(), config.name());
            assert!(LossFactory::available_losses().contains(&loss.name()));
        }
    }

    #[test]
    fn test_factory_requires_library_for_adapters() {
        let err = LossFactory::create(&LossConfig::MultiSimilarity, None).err().unwrap();
        assert!(matches!(err, LossError::ConfigurationError(_)));
    }
}
