//! High-level operations that integrate with automatic differentiation

use std::sync::Arc;

use super::{function::*, variable::Variable};
use crate::{
    error::{LossError, LossResult},
    tensor::{Shape, Tensor},
};

impl Variable {
    /// Record an already computed `value` as the output of `grad_fn` applied to `parents`
    fn record<F>(&self, value: Tensor, parents: &[&Variable], grad_fn: F) -> LossResult<Variable>
    where
        F: Function + 'static,
    {
        for parent in parents {
            if !Arc::ptr_eq(self.graph(), parent.graph()) {
                return Err(LossError::InvalidInput(format!(
                    "{} combines variables from different computation graphs",
                    grad_fn.name()
                )));
            }
        }
        let ids = parents.iter().map(|p| p.node_id()).collect();
        let value = Arc::new(value);
        let mut graph = self.graph().write();
        let node_id = graph.create_op_node(value.clone(), ids, Box::new(grad_fn))?;
        let requires_grad = graph.requires_grad(node_id);
        drop(graph);
        Ok(Variable::new(self.graph().clone(), node_id, value, requires_grad))
    }

    /// Element-wise addition with broadcasting
    pub fn add(&self, other: &Variable) -> LossResult<Variable> {
        let value = self.tensor().add(other.tensor())?;
        self.record(value, &[self, other], AddFunction)
    }

    /// Element-wise subtraction with broadcasting
    pub fn sub(&self, other: &Variable) -> LossResult<Variable> {
        let value = self.tensor().sub(other.tensor())?;
        self.record(value, &[self, other], SubFunction)
    }

    /// Element-wise multiplication with broadcasting
    pub fn mul(&self, other: &Variable) -> LossResult<Variable> {
        let value = self.tensor().mul(other.tensor())?;
        self.record(value, &[self, other], MulFunction)
    }

    /// Element-wise division with broadcasting
    pub fn div(&self, other: &Variable) -> LossResult<Variable> {
        let value = self.tensor().div(other.tensor())?;
        self.record(value, &[self, other], DivFunction)
    }

    pub fn scale(&self, factor: f64) -> LossResult<Variable> {
        let value = self.tensor().scale(factor);
        self.record(value, &[self], ScaleFunction { factor })
    }

    /// Add a constant to every element
    pub fn shift(&self, offset: f64) -> LossResult<Variable> {
        let value = self.tensor().map(|v| v + offset);
        self.record(value, &[self], ShiftFunction)
    }

    /// `1 / x`
    pub fn reciprocal(&self) -> LossResult<Variable> {
        let one = self.constant(Tensor::full(Shape::scalar(), 1.0, self.device()));
        one.div(self)
    }

    pub fn exp(&self) -> LossResult<Variable> {
        let value = self.tensor().map(f64::exp);
        self.record(value, &[self], ExpFunction)
    }

    pub fn log(&self) -> LossResult<Variable> {
        let value = self.tensor().map(f64::ln);
        self.record(value, &[self], LogFunction)
    }

    pub fn sqrt(&self) -> LossResult<Variable> {
        let value = self.tensor().map(f64::sqrt);
        self.record(value, &[self], SqrtFunction)
    }

    pub fn abs(&self) -> LossResult<Variable> {
        let value = self.tensor().map(f64::abs);
        self.record(value, &[self], AbsFunction)
    }

    pub fn clamp_min(&self, floor: f64) -> LossResult<Variable> {
        let value = self.tensor().map(|v| v.max(floor));
        self.record(value, &[self], ClampMinFunction { floor })
    }

    /// `self · otherᵀ`
    pub fn linear(&self, other: &Variable) -> LossResult<Variable> {
        let value = self.tensor().matmul_transposed(other.tensor())?;
        self.record(value, &[self, other], LinearFunction)
    }

    /// Sum along `axis`, keeping it with size 1
    pub fn sum_axis(&self, axis: usize) -> LossResult<Variable> {
        let value = self.tensor().sum_axis(axis)?;
        self.record(value, &[self], SumFunction)
    }

    /// Sum reduction to a `[1, 1]` variable
    pub fn sum(&self) -> LossResult<Variable> {
        let value = Tensor::full(Shape::scalar(), self.tensor().sum(), self.device());
        self.record(value, &[self], SumFunction)
    }

    /// Mean along `axis`, keeping it with size 1
    pub fn mean_axis(&self, axis: usize) -> LossResult<Variable> {
        let count = self.shape().dims.get(axis).copied().unwrap_or(0);
        if count == 0 {
            return Err(LossError::InvalidInput(format!(
                "mean over empty axis {} of {}",
                axis,
                self.shape()
            )));
        }
        self.sum_axis(axis)?.scale(1.0 / count as f64)
    }

    /// Mean reduction to a `[1, 1]` variable
    pub fn mean(&self) -> LossResult<Variable> {
        let count = self.tensor().numel();
        if count == 0 {
            return Err(LossError::InvalidInput("mean of an empty tensor".to_string()));
        }
        self.sum()?.scale(1.0 / count as f64)
    }

    /// Column-wise `log(1 + Σ_i mask[i,k] · exp(self[i,k]))`, shape `[1, cols]`
    pub fn masked_log_sum_exp(&self, mask: &Tensor) -> LossResult<Variable> {
        let function = MaskedLogSumExpFunction { mask: mask.clone() };
        let value = function.forward(self.tensor())?;
        self.record(value, &[self], function)
    }

    /// A non-differentiable constant on the same graph
    pub fn constant(&self, tensor: Tensor) -> Variable {
        let value = Arc::new(tensor);
        let node_id = self.graph().write().create_leaf_node(value.clone(), false);
        Variable::new(self.graph().clone(), node_id, value, false)
    }
}
