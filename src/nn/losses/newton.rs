//! Proxy Anchor with a margin derived from embedding and proxy norms
//!
//! For every sample `i` and class `k`,
//! `margin[i,k] = ‖x_i‖ · ‖p_k‖ / sim(x_i, p_k)`, where `sim` is the cosine
//! similarity with norms clamped to at least `1e-8`. The per-sample mean over
//! classes replaces the fixed margin. Nothing bounds this value: it scales
//! with the raw norms and changes sign with the similarity. A non-finite
//! margin is an error; near-zero and negative similarities are logged.

use crate::{
    autograd::Variable,
    config::ProxyAnchorConfig,
    error::{LossError, LossResult},
    nn::{
        init::seeded_rng,
        parameter::{Module, Parameter},
    },
    tensor::Device,
};

use super::{
    proxy_anchor::{anchor_terms, ensure_finite, init_proxies, validate_batch},
    utils::*,
    MetricLoss,
};

/// Lower bound on a norm inside the similarity denominator
pub const SIMILARITY_NORM_EPS: f64 = 1e-8;

/// Similarities below this magnitude are reported as near zero
const NEAR_ZERO_SIMILARITY: f64 = 1e-3;

/// Proxy Anchor whose margin is recomputed from vector norms on every call
#[derive(Debug, Clone)]
pub struct NewtonProxyAnchorLoss {
    proxies: Parameter,
    num_classes: usize,
    embedding_dim: usize,
    alpha: f64,
    device: Device,
}

impl NewtonProxyAnchorLoss {
    pub fn new(num_classes: usize, embedding_dim: usize, alpha: f64) -> LossResult<Self> {
        Self::from_config(&ProxyAnchorConfig::new(num_classes, embedding_dim).with_alpha(alpha))
    }

    /// `margin` and the adaptive-only fields of `config` are ignored
    pub fn from_config(config: &ProxyAnchorConfig) -> LossResult<Self> {
        config.validate()?;
        let mut rng = seeded_rng(config.seed);
        Ok(Self {
            proxies: Parameter::new("proxies", init_proxies(config, &mut rng)),
            num_classes: config.num_classes,
            embedding_dim: config.embedding_dim,
            alpha: config.alpha,
            device: config.device,
        })
    }

    pub fn proxies(&self) -> &Parameter {
        &self.proxies
    }

    /// Per-sample margin `[N, 1]` for `embeddings` against the current proxies
    pub fn variable_margin(&self, embeddings: &Variable) -> LossResult<Variable> {
        let proxies = embeddings.engine().parameter(&self.proxies);
        norm_margin(embeddings, &proxies)
    }
}

/// Row norms as an `[rows, 1]` column
fn row_norms(x: &Variable) -> LossResult<Variable> {
    x.mul(x)?.sum_axis(1)?.sqrt()
}

fn norm_margin(x: &Variable, proxies: &Variable) -> LossResult<Variable> {
    let x_norm = row_norms(x)?;
    let p_norm = row_norms(proxies)?;

    // outer products of the norm columns, [N, C]
    let norm_product = x_norm.linear(&p_norm)?;
    let clamped_product = x_norm
        .clamp_min(SIMILARITY_NORM_EPS)?
        .linear(&p_norm.clamp_min(SIMILARITY_NORM_EPS)?)?;
    let similarity = x.linear(proxies)?.div(&clamped_product)?;

    let sims = similarity.tensor().as_slice();
    let negative = sims.iter().filter(|&&s| s < 0.0).count();
    let near_zero = sims.iter().filter(|&&s| s.abs() < NEAR_ZERO_SIMILARITY).count();
    if negative > 0 || near_zero > 0 {
        tracing::warn!(
            negative,
            near_zero,
            total = sims.len(),
            "norm-derived margin uses negative or near-zero similarities"
        );
    }

    let margin = norm_product.div(&similarity)?;
    if !margin.tensor().is_finite() {
        return Err(LossError::NumericInstability(
            "norm-derived margin is not finite: an embedding is orthogonal to a proxy or has zero norm".to_string(),
        ));
    }
    let margin = margin.mean_axis(1)?;
    tracing::debug!(mean_margin = margin.tensor().mean(), "norm-derived margin");
    Ok(margin)
}

impl Module for NewtonProxyAnchorLoss {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.proxies]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.proxies]
    }
}

impl MetricLoss for NewtonProxyAnchorLoss {
    fn forward(&self, embeddings: &Variable, labels: &[usize]) -> LossResult<Variable> {
        validate_batch(embeddings, labels, self.embedding_dim, self.device, self.name())?;
        let one_hot = binarize(labels, self.num_classes, self.device)?;

        let proxies = embeddings.engine().parameter(&self.proxies);
        let margin = norm_margin(embeddings, &proxies)?;
        let cos = cosine_similarity(embeddings, &proxies)?;
        let terms = anchor_terms(&cos, &margin, &one_hot, self.alpha)?;

        tracing::debug!(
            batch_size = labels.len(),
            num_valid_proxies = terms.num_valid_proxies,
            pos_term = terms.pos.item()?,
            neg_term = terms.neg.item()?,
            "newton proxy anchor forward"
        );
        ensure_finite(terms.pos.add(&terms.neg)?, self.name())
    }

    fn name(&self) -> &'static str {
        "newton_proxy_anchor"
    }
}
