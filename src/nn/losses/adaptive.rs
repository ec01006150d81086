//! Proxy Anchor losses with a learned per-class margin
//!
//! Both variants average the cosine similarity over several independently
//! initialised proxy sets and train a `[1, C]` margin alongside the proxies.
//! They differ only in how the margin is regularised:
//!
//! * adaptive: `w / mean(mrg)`
//! * autoscaled: `-w * mean(mrg) * |pos - neg|`

use crate::{
    autograd::Variable,
    config::ProxyAnchorConfig,
    error::{LossError, LossResult},
    nn::{
        init::seeded_rng,
        parameter::{Module, Parameter},
    },
    tensor::{Device, Shape, Tensor},
};

use super::{
    proxy_anchor::{anchor_terms, ensure_finite, init_proxies, validate_batch, AnchorTerms},
    utils::*,
    MetricLoss,
};

/// The three summands of an adaptive-margin loss, each `[1, 1]`
#[derive(Debug, Clone)]
pub struct AdaptiveTerms {
    pub pos: Variable,
    pub neg: Variable,
    pub regularizer: Variable,
}

impl AdaptiveTerms {
    pub fn total(&self) -> LossResult<Variable> {
        self.pos.add(&self.neg)?.add(&self.regularizer)
    }
}

/// Parameters and similarity pipeline shared by both margin regularisers
#[derive(Debug, Clone)]
struct AdaptiveCore {
    proxy_sets: Box<[Parameter]>,
    margin: Parameter,
    num_classes: usize,
    embedding_dim: usize,
    alpha: f64,
    margin_regularization_weight: f64,
    device: Device,
}

impl AdaptiveCore {
    fn from_config(config: &ProxyAnchorConfig) -> LossResult<Self> {
        config.validate()?;
        let mut rng = seeded_rng(config.seed);
        let proxy_sets = (0..config.num_proxy_sets)
            .map(|i| Parameter::new(format!("proxies.{}", i), init_proxies(config, &mut rng)))
            .collect();
        let margin = Tensor::full(Shape::new([1, config.num_classes]), config.margin, config.device);
        Ok(Self {
            proxy_sets,
            margin: Parameter::new("margin", margin),
            num_classes: config.num_classes,
            embedding_dim: config.embedding_dim,
            alpha: config.alpha,
            margin_regularization_weight: config.margin_regularization_weight,
            device: config.device,
        })
    }

    /// Anchor terms against the set-averaged similarity, plus the bound margin
    fn compute(&self, embeddings: &Variable, labels: &[usize], operation: &str) -> LossResult<(AnchorTerms, Variable)> {
        validate_batch(embeddings, labels, self.embedding_dim, self.device, operation)?;
        let one_hot = binarize(labels, self.num_classes, self.device)?;

        let engine = embeddings.engine();
        let (first, rest) = self
            .proxy_sets
            .split_first()
            .ok_or_else(|| LossError::InternalError("loss has no proxy sets".to_string()))?;
        let mut cos = cosine_similarity(embeddings, &engine.parameter(first))?;
        for set in rest {
            cos = cos.add(&cosine_similarity(embeddings, &engine.parameter(set))?)?;
        }
        let cos = cos.scale(1.0 / self.proxy_sets.len() as f64)?;

        let margin = engine.parameter(&self.margin);
        let terms = anchor_terms(&cos, &margin, &one_hot, self.alpha)?;
        Ok((terms, margin))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.proxy_sets.iter().chain(std::iter::once(&self.margin)).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.proxy_sets
            .iter_mut()
            .chain(std::iter::once(&mut self.margin))
            .collect()
    }
}

macro_rules! adaptive_loss {
    ($(#[$meta:meta])* $name:ident, $loss_name:literal, $regularizer:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            core: AdaptiveCore,
        }

        impl $name {
            pub fn new(
                num_classes: usize,
                embedding_dim: usize,
                margin: f64,
                alpha: f64,
                num_proxy_sets: usize,
                margin_regularization_weight: f64,
            ) -> LossResult<Self> {
                Self::from_config(
                    &ProxyAnchorConfig::new(num_classes, embedding_dim)
                        .with_margin(margin)
                        .with_alpha(alpha)
                        .with_num_proxy_sets(num_proxy_sets)
                        .with_margin_regularization_weight(margin_regularization_weight),
                )
            }

            pub fn from_config(config: &ProxyAnchorConfig) -> LossResult<Self> {
                Ok(Self {
                    core: AdaptiveCore::from_config(config)?,
                })
            }

            pub fn proxy_sets(&self) -> &[Parameter] {
                &self.core.proxy_sets
            }

            /// The `[1, C]` per-class margin
            pub fn margin(&self) -> &Parameter {
                &self.core.margin
            }

            pub fn margin_regularization_weight(&self) -> f64 {
                self.core.margin_regularization_weight
            }

            /// Positive, negative and regularisation terms separately
            pub fn terms(&self, embeddings: &Variable, labels: &[usize]) -> LossResult<AdaptiveTerms> {
                let (terms, margin) = self.core.compute(embeddings, labels, $loss_name)?;
                let regularizer = $regularizer(&terms, &margin, self.core.margin_regularization_weight)?;
                tracing::debug!(
                    loss = $loss_name,
                    batch_size = labels.len(),
                    num_valid_proxies = terms.num_valid_proxies,
                    pos_term = terms.pos.item()?,
                    neg_term = terms.neg.item()?,
                    regularizer = regularizer.item()?,
                    "adaptive margin forward"
                );
                Ok(AdaptiveTerms {
                    pos: terms.pos,
                    neg: terms.neg,
                    regularizer,
                })
            }
        }

        impl Module for $name {
            fn parameters(&self) -> Vec<&Parameter> {
                self.core.parameters()
            }

            fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
                self.core.parameters_mut()
            }
        }

        impl MetricLoss for $name {
            fn forward(&self, embeddings: &Variable, labels: &[usize]) -> LossResult<Variable> {
                ensure_finite(self.terms(embeddings, labels)?.total()?, self.name())
            }

            fn name(&self) -> &'static str {
                $loss_name
            }
        }
    };
}

/// `w / mean(mrg)`: shrinking margins are penalised
fn inverse_mean_margin(_terms: &AnchorTerms, margin: &Variable, weight: f64) -> LossResult<Variable> {
    margin.mean()?.reciprocal()?.scale(weight)
}

/// `-w * mean(mrg) * |pos - neg|`
fn scaled_imbalance(terms: &AnchorTerms, margin: &Variable, weight: f64) -> LossResult<Variable> {
    let imbalance = terms.pos.sub(&terms.neg)?.abs()?;
    margin.mean()?.mul(&imbalance)?.scale(-weight)
}

adaptive_loss!(
    /// Proxy Anchor with a trainable per-class margin and an inverse-mean
    /// margin regulariser
    AdaptiveProxyAnchorLoss,
    "adaptive_proxy_anchor",
    inverse_mean_margin
);

adaptive_loss!(
    /// Proxy Anchor with a trainable per-class margin whose regulariser
    /// grows with the margin and the positive/negative imbalance
    AutoscaledProxyAnchorLoss,
    "autoscaled_proxy_anchor",
    scaled_imbalance
);
