//! Function trait and the differentiable primitives recorded on the tape

use std::sync::Arc;

use crate::{
    error::{LossError, LossResult},
    tensor::Tensor,
};

/// Trait for functions that can be differentiated.
///
/// The forward value is computed by the caller in `ops`; a function only
/// knows how to map the output gradient back onto its inputs. Returned
/// gradients may still have the broadcast output shape, the graph sums them
/// down to each input's shape.
pub trait Function: Send + Sync {
    fn backward(
        &self,
        grad_output: &Tensor,
        inputs: &[Arc<Tensor>],
        output: &Tensor,
    ) -> LossResult<Vec<Option<Tensor>>>;

    /// Get function name for debugging
    fn name(&self) -> &'static str;
}

fn expect_inputs(name: &str, inputs: &[Arc<Tensor>], n: usize) -> LossResult<()> {
    if inputs.len() != n {
        return Err(LossError::InternalError(format!(
            "{} expects {} inputs, got {}",
            name,
            n,
            inputs.len()
        )));
    }
    Ok(())
}

/// Addition function: d/dx (x + y) = 1, d/dy (x + y) = 1
#[derive(Debug, Clone, Copy)]
pub struct AddFunction;

impl Function for AddFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], _output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 2)?;
        Ok(vec![Some(grad_output.clone()), Some(grad_output.clone())])
    }

    fn name(&self) -> &'static str {
        "AddFunction"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubFunction;

impl Function for SubFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], _output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 2)?;
        Ok(vec![Some(grad_output.clone()), Some(grad_output.scale(-1.0))])
    }

    fn name(&self) -> &'static str {
        "SubFunction"
    }
}

/// Multiplication function: d/dx (x * y) = y, d/dy (x * y) = x
#[derive(Debug, Clone, Copy)]
pub struct MulFunction;

impl Function for MulFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], _output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 2)?;
        Ok(vec![
            Some(grad_output.mul(&inputs[1])?),
            Some(grad_output.mul(&inputs[0])?),
        ])
    }

    fn name(&self) -> &'static str {
        "MulFunction"
    }
}

/// Division: d/dx (x / y) = 1 / y, d/dy (x / y) = -x / y²
#[derive(Debug, Clone, Copy)]
pub struct DivFunction;

impl Function for DivFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 2)?;
        let grad_lhs = grad_output.div(&inputs[1])?;
        let grad_rhs = grad_lhs.mul(output)?.scale(-1.0);
        Ok(vec![Some(grad_lhs), Some(grad_rhs)])
    }

    fn name(&self) -> &'static str {
        "DivFunction"
    }
}

/// Multiplication by a constant
#[derive(Debug, Clone, Copy)]
pub struct ScaleFunction {
    pub factor: f64,
}

impl Function for ScaleFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], _output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        Ok(vec![Some(grad_output.scale(self.factor))])
    }

    fn name(&self) -> &'static str {
        "ScaleFunction"
    }
}

/// Addition of a constant
#[derive(Debug, Clone, Copy)]
pub struct ShiftFunction;

impl Function for ShiftFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], _output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        Ok(vec![Some(grad_output.clone())])
    }

    fn name(&self) -> &'static str {
        "ShiftFunction"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExpFunction;

impl Function for ExpFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        Ok(vec![Some(grad_output.mul(output)?)])
    }

    fn name(&self) -> &'static str {
        "ExpFunction"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogFunction;

impl Function for LogFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], _output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        Ok(vec![Some(grad_output.div(&inputs[0])?)])
    }

    fn name(&self) -> &'static str {
        "LogFunction"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SqrtFunction;

impl Function for SqrtFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        Ok(vec![Some(grad_output.zip_with(output, |g, s| 0.5 * g / s)?)])
    }

    fn name(&self) -> &'static str {
        "SqrtFunction"
    }
}

/// |x|, with a zero subgradient at 0
#[derive(Debug, Clone, Copy)]
pub struct AbsFunction;

impl Function for AbsFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], _output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        let sign = inputs[0].map(|v| if v > 0.0 { 1.0 } else if v < 0.0 { -1.0 } else { 0.0 });
        Ok(vec![Some(grad_output.mul(&sign)?)])
    }

    fn name(&self) -> &'static str {
        "AbsFunction"
    }
}

/// max(x, floor); the gradient only flows where x is above the floor
#[derive(Debug, Clone, Copy)]
pub struct ClampMinFunction {
    pub floor: f64,
}

impl Function for ClampMinFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], _output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        let floor = self.floor;
        let pass = inputs[0].map(|v| if v > floor { 1.0 } else { 0.0 });
        Ok(vec![Some(grad_output.mul(&pass)?)])
    }

    fn name(&self) -> &'static str {
        "ClampMinFunction"
    }
}

/// `A · Bᵀ`: dA = G · B, dB = Gᵀ · A
#[derive(Debug, Clone, Copy)]
pub struct LinearFunction;

impl Function for LinearFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], _output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 2)?;
        let grad_a = grad_output.matmul(&inputs[1])?;
        let grad_b = grad_output.transpose().matmul(&inputs[0])?;
        Ok(vec![Some(grad_a), Some(grad_b)])
    }

    fn name(&self) -> &'static str {
        "LinearFunction"
    }
}

/// Sum along one axis or over everything; the gradient broadcasts back
#[derive(Debug, Clone, Copy)]
pub struct SumFunction;

impl Function for SumFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], _output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        Ok(vec![Some(grad_output.broadcast_to(inputs[0].shape())?)])
    }

    fn name(&self) -> &'static str {
        "SumFunction"
    }
}

/// Column-wise `log(1 + Σ_i mask[i,k] · exp(z[i,k]))`.
///
/// Evaluated as a shifted log-sum-exp with an implicit zero logit, so the
/// exponent never exceeds 0. The gradient w.r.t. `z[i,k]` is
/// `mask[i,k] · exp(z[i,k] - out[k])`.
#[derive(Debug, Clone)]
pub struct MaskedLogSumExpFunction {
    pub mask: Tensor,
}

impl MaskedLogSumExpFunction {
    pub fn forward(&self, logits: &Tensor) -> LossResult<Tensor> {
        if logits.shape() != self.mask.shape() {
            return Err(LossError::shape_error(
                &self.mask.shape().to_string(),
                &logits.shape().to_string(),
                Some("logits and membership mask must have the same shape"),
            ));
        }
        let (rows, cols) = (logits.rows(), logits.cols());
        let mut out = Vec::with_capacity(cols);
        for k in 0..cols {
            let mut shift = 0.0_f64;
            for i in 0..rows {
                if self.mask.get(i, k) != 0.0 {
                    shift = shift.max(logits.get(i, k));
                }
            }
            let mut acc = (-shift).exp();
            for i in 0..rows {
                let m = self.mask.get(i, k);
                if m != 0.0 {
                    acc += m * (logits.get(i, k) - shift).exp();
                }
            }
            out.push(shift + acc.ln());
        }
        Tensor::from_vec(out, crate::tensor::Shape::new([1, cols]), logits.device())
    }
}

impl Function for MaskedLogSumExpFunction {
    fn backward(&self, grad_output: &Tensor, inputs: &[Arc<Tensor>], output: &Tensor) -> LossResult<Vec<Option<Tensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        // masked-out logits may overflow exp; they must contribute exactly 0
        let weights = inputs[0]
            .sub(output)?
            .zip_with(&self.mask, |d, m| if m != 0.0 { m * d.exp() } else { 0.0 })?;
        Ok(vec![Some(weights.mul(grad_output)?)])
    }

    fn name(&self) -> &'static str {
        "MaskedLogSumExpFunction"
    }
}
