//! Proxy Anchor loss with a fixed scalar margin

use crate::{
    autograd::Variable,
    config::ProxyAnchorConfig,
    error::{ErrorContext, LossError, LossResult, WithContext},
    nn::{
        init::{kaiming_normal_fan_out, seeded_rng},
        parameter::{Module, Parameter},
    },
    tensor::{Device, Shape, Tensor},
};

use super::{utils::*, MetricLoss};

/// Positive and negative halves of the proxy-anchor objective
pub(crate) struct AnchorTerms {
    pub pos: Variable,
    pub neg: Variable,
    pub num_valid_proxies: usize,
}

/// Boundary checks shared by every proxy loss, run before any computation
pub(crate) fn validate_batch(
    embeddings: &Variable,
    labels: &[usize],
    embedding_dim: usize,
    device: Device,
    operation: &str,
) -> LossResult<()> {
    let shape = embeddings.shape();
    if labels.len() != shape.rows() {
        return Err(LossError::shape_error(
            &format!("{} labels", shape.rows()),
            &format!("{} labels", labels.len()),
            Some("pass exactly one label per embedding row"),
        ));
    }
    if shape.cols() != embedding_dim {
        return Err(LossError::shape_error(
            &format!("[N, {}]", embedding_dim),
            &shape.to_string(),
            None,
        ))
        .with_context(|| {
            ErrorContext::new(operation)
                .with_shape(&shape.to_string())
                .with_suggestion("embedding dimension must match the proxy dimension")
        });
    }
    device.ensure_same(embeddings.device(), operation)?;
    if labels.is_empty() {
        return Err(LossError::DegenerateBatch(
            "empty batch: no class has a positive sample".to_string(),
        ));
    }
    Ok(())
}

/// Per-class soft-margin terms for a similarity matrix `cos` of shape `[N, C]`.
///
/// `margin` broadcasts against `cos`: `[1, 1]`, `[1, C]` or `[N, 1]`.
pub(crate) fn anchor_terms(cos: &Variable, margin: &Variable, one_hot: &Tensor, alpha: f64) -> LossResult<AnchorTerms> {
    let num_classes = one_hot.cols();
    let num_valid_proxies = count_classes_present(one_hot);
    if num_valid_proxies == 0 {
        return Err(LossError::DegenerateBatch(
            "no class has a positive sample in this batch".to_string(),
        ));
    }
    let negative_mask = one_hot.map(|v| 1.0 - v);

    let pos_logits = cos.sub(margin)?.scale(-alpha)?;
    let neg_logits = cos.add(margin)?.scale(alpha)?;

    let pos = pos_logits
        .masked_log_sum_exp(one_hot)?
        .sum()?
        .scale(1.0 / num_valid_proxies as f64)?;
    let neg = neg_logits
        .masked_log_sum_exp(&negative_mask)?
        .sum()?
        .scale(1.0 / num_classes as f64)?;

    Ok(AnchorTerms {
        pos,
        neg,
        num_valid_proxies,
    })
}

/// Reject a loss that came out NaN or infinite
pub(crate) fn ensure_finite(loss: Variable, name: &str) -> LossResult<Variable> {
    let value = loss.item()?;
    if !value.is_finite() {
        return Err(LossError::NumericInstability(format!("{} evaluated to {}", name, value)));
    }
    Ok(loss)
}

/// `[C, D]` proxy matrix drawn with Kaiming-normal fan-out initialisation
pub(crate) fn init_proxies(config: &ProxyAnchorConfig, rng: &mut rand::rngs::StdRng) -> Tensor {
    kaiming_normal_fan_out(
        Shape::new([config.num_classes, config.embedding_dim]),
        config.device,
        rng,
    )
}

/// Proxy Anchor loss: one learned proxy per class and a fixed margin
#[derive(Debug, Clone)]
pub struct ProxyAnchorLoss {
    proxies: Parameter,
    num_classes: usize,
    embedding_dim: usize,
    margin: f64,
    alpha: f64,
    device: Device,
}

impl ProxyAnchorLoss {
    pub fn new(num_classes: usize, embedding_dim: usize, margin: f64, alpha: f64) -> LossResult<Self> {
        Self::from_config(
            &ProxyAnchorConfig::new(num_classes, embedding_dim)
                .with_margin(margin)
                .with_alpha(alpha),
        )
    }

    pub fn from_config(config: &ProxyAnchorConfig) -> LossResult<Self> {
        config.validate()?;
        let mut rng = seeded_rng(config.seed);
        Ok(Self {
            proxies: Parameter::new("proxies", init_proxies(config, &mut rng)),
            num_classes: config.num_classes,
            embedding_dim: config.embedding_dim,
            margin: config.margin,
            alpha: config.alpha,
            device: config.device,
        })
    }

    pub fn proxies(&self) -> &Parameter {
        &self.proxies
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Positive and negative terms separately, both `[1, 1]`
    pub fn terms(&self, embeddings: &Variable, labels: &[usize]) -> LossResult<(Variable, Variable)> {
        let terms = self.compute(embeddings, labels)?;
        Ok((terms.pos, terms.neg))
    }

    fn compute(&self, embeddings: &Variable, labels: &[usize]) -> LossResult<AnchorTerms> {
        validate_batch(embeddings, labels, self.embedding_dim, self.device, "proxy_anchor")?;
        let one_hot = binarize(labels, self.num_classes, self.device)?;

        let proxies = embeddings.engine().parameter(&self.proxies);
        let cos = cosine_similarity(embeddings, &proxies)?;
        let margin = embeddings.constant(Tensor::full(Shape::scalar(), self.margin, self.device));
        anchor_terms(&cos, &margin, &one_hot, self.alpha)
    }
}

impl Module for ProxyAnchorLoss {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.proxies]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.proxies]
    }
}

impl MetricLoss for ProxyAnchorLoss {
    fn forward(&self, embeddings: &Variable, labels: &[usize]) -> LossResult<Variable> {
        let terms = self.compute(embeddings, labels)?;
        let loss = terms.pos.add(&terms.neg)?;
        tracing::debug!(
            batch_size = labels.len(),
            num_valid_proxies = terms.num_valid_proxies,
            pos_term = terms.pos.item()?,
            neg_term = terms.neg.item()?,
            "proxy anchor forward"
        );
        ensure_finite(loss, self.name())
    }

    fn name(&self) -> &'static str {
        "proxy_anchor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::AutogradEngine;
    use crate::nn::parameter::StateDict;
    use crate::verification::check_gradients;
    use rand::seq::SliceRandom;

    fn naive_loss(x: &Tensor, p: &Tensor, labels: &[usize], margin: f64, alpha: f64) -> f64 {
        let normalize = |t: &Tensor, r: usize| -> Vec<f64> {
            let row: Vec<f64> = (0..t.cols()).map(|c| t.get(r, c)).collect();
            let norm = (row.iter().map(|v| v * v).sum::<f64>() + 1e-12).sqrt();
            row.into_iter().map(|v| v / norm).collect()
        };
        let num_classes = p.rows();
        let mut pos = 0.0;
        let mut neg = 0.0;
        let mut valid = 0;
        for k in 0..num_classes {
            let pk = normalize(p, k);
            let (mut p_sum, mut n_sum) = (0.0, 0.0);
            let mut present = false;
            for (i, &label) in labels.iter().enumerate() {
                let xi = normalize(x, i);
                let cos: f64 = xi.iter().zip(&pk).map(|(a, b)| a * b).sum();
                if label == k {
                    present = true;
                    p_sum += (-alpha * (cos - margin)).exp();
                } else {
                    n_sum += (alpha * (cos + margin)).exp();
                }
            }
            if present {
                valid += 1;
            }
            pos += (1.0 + p_sum).ln();
            neg += (1.0 + n_sum).ln();
        }
        pos / valid as f64 + neg / num_classes as f64
    }

    fn random_tensor(rows: usize, cols: usize, seed: u64) -> Tensor {
        kaiming_normal_fan_out(Shape::new([rows, cols]), Device::Cpu, &mut seeded_rng(Some(seed)))
    }

    fn with_proxies(mut loss: ProxyAnchorLoss, proxies: Tensor) -> ProxyAnchorLoss {
        let mut state = StateDict::new();
        state.insert("proxies".to_string(), proxies);
        loss.load_state_dict(&state).unwrap();
        loss
    }

    fn evaluate(loss: &ProxyAnchorLoss, x: &Tensor, labels: &[usize]) -> f64 {
        let engine = AutogradEngine::new();
        let x = engine.variable(x.clone(), true);
        loss.forward(&x, labels).unwrap().item().unwrap()
    }

    #[test]
    fn test_construction_validates_hyperparameters() {
        assert!(ProxyAnchorLoss::new(4, 8, 0.1, 32.0).is_ok());
        assert!(matches!(
            ProxyAnchorLoss::new(4, 8, -0.1, 32.0),
            Err(LossError::ConfigurationError(_))
        ));
        assert!(ProxyAnchorLoss::new(0, 8, 0.1, 32.0).is_err());
        let config = ProxyAnchorConfig::new(4, 8).with_device(Device::Metal(0));
        assert!(matches!(ProxyAnchorLoss::from_config(&config), Err(LossError::DeviceError(_))));
    }

    #[test]
    fn test_proxies_have_fixed_shape() {
        let loss = ProxyAnchorLoss::new(5, 3, 0.1, 32.0).unwrap();
        assert_eq!(loss.proxies().value().shape(), Shape::new([5, 3]));
        assert_eq!(loss.num_parameters(), 15);
        assert_eq!(loss.state_dict().keys().collect::<Vec<_>>(), vec!["proxies"]);
    }

    #[test]
    fn test_matches_direct_formula() {
        let config = ProxyAnchorConfig::new(4, 6).with_alpha(4.0).with_seed(1);
        let loss = ProxyAnchorLoss::from_config(&config).unwrap();
        let x = random_tensor(7, 6, 2);
        let labels = [0, 1, 1, 3, 0, 3, 1];
        let expected = naive_loss(&x, loss.proxies().value(), &labels, 0.1, 4.0);
        assert!((evaluate(&loss, &x, &labels) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_embeddings_equal_to_proxies() {
        let (alpha, margin): (f64, f64) = (32.0, 0.1);
        let loss = ProxyAnchorLoss::from_config(&ProxyAnchorConfig::new(3, 5).with_seed(9)).unwrap();
        let proxies = loss.proxies().value().clone();
        let engine = AutogradEngine::new();
        let x = engine.variable(proxies.clone(), false);
        let (pos, neg) = loss.terms(&x, &[0, 1, 2]).unwrap();

        let expected_pos = (1.0 + (-alpha * (1.0 - margin)).exp()).ln();
        assert!((pos.item().unwrap() - expected_pos).abs() < 1e-9);

        let full = naive_loss(&proxies, &proxies, &[0, 1, 2], margin, alpha);
        assert!((pos.item().unwrap() + neg.item().unwrap() - full).abs() < 1e-9);
    }

    #[test]
    fn test_two_orthogonal_classes_scenario() {
        let loss = ProxyAnchorLoss::new(2, 2, 0.1, 32.0).unwrap();
        let proxies = Tensor::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let loss = with_proxies(loss, proxies.clone());
        let engine = AutogradEngine::new();
        let x = engine.variable(proxies, true);
        let (pos, neg) = loss.terms(&x, &[0, 1]).unwrap();

        // pos = log(1 + e^{-28.8}), neg = log(1 + e^{3.2})
        assert!(pos.item().unwrap() < 1e-12);
        assert!((neg.item().unwrap() - (1.0 + 3.2_f64.exp()).ln()).abs() < 1e-9);
        let total = loss.forward(&x, &[0, 1]).unwrap().item().unwrap();
        assert!((total - 3.239_953_3).abs() < 1e-6, "total {}", total);
    }

    #[test]
    fn test_label_permutation_invariance() {
        let loss = ProxyAnchorLoss::from_config(&ProxyAnchorConfig::new(3, 4).with_seed(5)).unwrap();
        let x = random_tensor(6, 4, 6);
        let labels = vec![2, 0, 1, 1, 0, 2];
        let baseline = evaluate(&loss, &x, &labels);

        let mut order: Vec<usize> = (0..labels.len()).collect();
        order.shuffle(&mut seeded_rng(Some(7)));
        let rows: Vec<Vec<f64>> = order
            .iter()
            .map(|&i| (0..x.cols()).map(|c| x.get(i, c)).collect())
            .collect();
        let permuted_labels: Vec<usize> = order.iter().map(|&i| labels[i]).collect();
        let permuted = evaluate(&loss, &Tensor::from_rows(&rows).unwrap(), &permuted_labels);
        assert!((baseline - permuted).abs() < 1e-9);
    }

    #[test]
    fn test_loss_is_non_negative() {
        for seed in 0..10 {
            let loss = ProxyAnchorLoss::from_config(&ProxyAnchorConfig::new(4, 3).with_seed(seed)).unwrap();
            let x = random_tensor(5, 3, seed + 100);
            let labels: Vec<usize> = (0..5).map(|i| (i * 3 + seed as usize) % 4).collect();
            assert!(evaluate(&loss, &x, &labels) >= 0.0);
        }
    }

    #[test]
    fn test_large_alpha_stays_finite() {
        let loss = ProxyAnchorLoss::from_config(&ProxyAnchorConfig::new(3, 4).with_alpha(2000.0).with_seed(3)).unwrap();
        let engine = AutogradEngine::new();
        let x = engine.variable(random_tensor(4, 4, 4), true);
        let value = loss.forward(&x, &[0, 1, 2, 0]).unwrap();
        assert!(value.item().unwrap().is_finite());
        let grads = value.backward().unwrap();
        assert!(grads.wrt(&x).unwrap().is_finite());
        assert!(loss.proxies().grad(&grads).unwrap().is_finite());
    }

    #[test]
    fn test_empty_batch_is_degenerate() {
        let loss = ProxyAnchorLoss::new(3, 4, 0.1, 32.0).unwrap();
        let engine = AutogradEngine::new();
        let x = engine.variable(Tensor::zeros(Shape::new([0, 4]), Device::Cpu), true);
        let err = loss.forward(&x, &[]).unwrap_err();
        assert!(matches!(err, LossError::DegenerateBatch(_)));
    }

    #[test]
    fn test_boundary_errors() {
        let loss = ProxyAnchorLoss::new(3, 4, 0.1, 32.0).unwrap();
        let engine = AutogradEngine::new();
        let x = engine.variable(random_tensor(2, 4, 1), true);
        assert_eq!(
            loss.forward(&x, &[0, 3]).unwrap_err(),
            LossError::InvalidLabel { label: 3, num_classes: 3 }
        );
        assert!(matches!(loss.forward(&x, &[0]).unwrap_err(), LossError::ShapeError(_)));

        let wide = engine.variable(random_tensor(2, 5, 1), true);
        assert!(matches!(loss.forward(&wide, &[0, 1]).unwrap_err(), LossError::ShapeError(_)));
    }

    #[test]
    fn test_gradients_reach_embeddings_and_proxies() {
        let loss = ProxyAnchorLoss::from_config(&ProxyAnchorConfig::new(4, 6).with_seed(21)).unwrap();
        let engine = AutogradEngine::new();
        let x = engine.variable(random_tensor(8, 6, 22), true);
        let labels = [0, 1, 2, 3, 0, 1, 2, 3];
        let grads = loss.forward(&x, &labels).unwrap().backward().unwrap();

        for grad in [grads.wrt(&x).unwrap(), loss.proxies().grad(&grads).unwrap()] {
            assert!(grad.is_finite());
            assert!(grad.as_slice().iter().any(|g| g.abs() > 1e-8));
        }
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let config = ProxyAnchorConfig::new(3, 4).with_alpha(3.0).with_seed(31);
        let loss = ProxyAnchorLoss::from_config(&config).unwrap();
        let labels = [0, 2, 2, 1, 0];
        let x = random_tensor(5, 4, 32);

        let report = check_gradients(&x, |x| loss.forward(x, &labels), 1e-6).unwrap();
        assert!(report.max_abs_error < 1e-6, "{:?}", report);

        let proxies = loss.proxies().value().clone();
        let report = check_gradients(
            &proxies,
            |p| {
                let x = p.constant(x.clone());
                let cos = cosine_similarity(&x, p)?;
                let margin = p.constant(Tensor::scalar(0.1));
                let one_hot = binarize(&labels, 3, Device::Cpu)?;
                let terms = anchor_terms(&cos, &margin, &one_hot, 3.0)?;
                terms.pos.add(&terms.neg)
            },
            1e-6,
        )
        .unwrap();
        assert!(report.max_abs_error < 1e-6, "{:?}", report);
    }
}
