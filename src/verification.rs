//! Gradient verification against central finite differences

use crate::{
    autograd::{AutogradEngine, Variable},
    error::{LossError, LossResult},
    tensor::Tensor,
};

/// Largest disagreement between analytic and numeric gradients
#[derive(Debug, Clone, PartialEq)]
pub struct GradientReport {
    pub max_abs_error: f64,
    pub max_rel_error: f64,
    /// Flat index of the element with the largest absolute error
    pub worst_index: usize,
    pub checked: usize,
}

impl GradientReport {
    pub fn passed(&self, tolerance: f64) -> bool {
        self.max_abs_error <= tolerance || self.max_rel_error <= tolerance
    }
}

fn evaluate<F>(f: &F, input: Tensor) -> LossResult<f64>
where
    F: Fn(&Variable) -> LossResult<Variable>,
{
    let engine = AutogradEngine::new();
    f(&engine.variable(input, false))?.item()
}

/// Compare the gradient of the scalar `f` at `input` with
/// `(f(x + εe_i) - f(x - εe_i)) / 2ε` for every element `i`.
///
/// `f` is evaluated on a fresh graph for every perturbation.
pub fn check_gradients<F>(input: &Tensor, f: F, epsilon: f64) -> LossResult<GradientReport>
where
    F: Fn(&Variable) -> LossResult<Variable>,
{
    if !(epsilon.is_finite() && epsilon > 0.0) {
        return Err(LossError::InvalidInput(format!("epsilon must be positive, got {}", epsilon)));
    }

    let engine = AutogradEngine::new();
    let x = engine.variable(input.clone(), true);
    let grads = f(&x)?.backward()?;
    let analytic = match grads.wrt(&x) {
        Some(grad) => grad.clone(),
        None => Tensor::zeros(input.shape(), input.device()),
    };

    let mut report = GradientReport {
        max_abs_error: 0.0,
        max_rel_error: 0.0,
        worst_index: 0,
        checked: input.numel(),
    };
    for i in 0..input.numel() {
        let mut plus = input.clone();
        plus.as_slice_mut()[i] += epsilon;
        let mut minus = input.clone();
        minus.as_slice_mut()[i] -= epsilon;

        let numeric = (evaluate(&f, plus)? - evaluate(&f, minus)?) / (2.0 * epsilon);
        let expected = analytic.as_slice()[i];
        let abs_error = (numeric - expected).abs();
        let rel_error = abs_error / numeric.abs().max(expected.abs()).max(1e-12);

        if abs_error > report.max_abs_error {
            report.max_abs_error = abs_error;
            report.worst_index = i;
        }
        report.max_rel_error = report.max_rel_error.max(rel_error);
    }

    if report.max_abs_error > 1e-4 {
        tracing::warn!(?report, "gradient mismatch against finite differences");
    }
    Ok(report)
}
