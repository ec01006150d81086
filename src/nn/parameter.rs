//! Trainable parameters and the registry trait exposed to optimizers

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    autograd::Gradients,
    error::{LossError, LossResult},
    tensor::Tensor,
};

static NEXT_PARAMETER_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a parameter, used to find its node on a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId(u64);

impl ParameterId {
    fn next() -> Self {
        ParameterId(NEXT_PARAMETER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Named tensor snapshot of a module's parameters
pub type StateDict = BTreeMap<String, Tensor>;

/// A named tensor owned by a loss and updated by an external optimizer
#[derive(Debug)]
pub struct Parameter {
    id: ParameterId,
    name: String,
    value: Tensor,
    requires_grad: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            id: ParameterId::next(),
            name: name.into(),
            value,
            requires_grad: true,
        }
    }

    pub fn id(&self) -> ParameterId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Freeze or unfreeze; frozen parameters are bound as constants
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// This parameter's gradient from a backward pass, if it took part in it
    pub fn grad<'a>(&self, grads: &'a Gradients) -> Option<&'a Tensor> {
        grads.for_parameter(self.id)
    }

    /// `value -= update`, the hook an optimizer steps through
    pub fn apply_update(&mut self, update: &Tensor) -> LossResult<()> {
        self.check_compatible(update)?;
        if !update.is_finite() {
            return Err(LossError::NumericInstability(format!(
                "update for parameter '{}' contains NaN or infinity",
                self.name
            )));
        }
        self.value = self.value.sub(update)?;
        Ok(())
    }

    /// Replace the value, e.g. when restoring a checkpoint
    pub fn load(&mut self, value: Tensor) -> LossResult<()> {
        self.check_compatible(&value)?;
        self.value = value;
        Ok(())
    }

    fn check_compatible(&self, other: &Tensor) -> LossResult<()> {
        if other.shape() != self.value.shape() {
            return Err(LossError::shape_error(
                &self.value.shape().to_string(),
                &other.shape().to_string(),
                Some(&format!("parameter '{}' has a fixed shape", self.name)),
            ));
        }
        self.value.device().ensure_same(other.device(), &self.name)
    }
}

impl Clone for Parameter {
    /// A clone is a distinct parameter with its own identity
    fn clone(&self) -> Self {
        Self {
            id: ParameterId::next(),
            name: self.name.clone(),
            value: self.value.clone(),
            requires_grad: self.requires_grad,
        }
    }
}

/// Parameter registry of a loss, as seen by an optimizer or checkpointing
pub trait Module {
    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.value().numel()).sum()
    }

    fn state_dict(&self) -> StateDict {
        self.parameters()
            .into_iter()
            .map(|p| (p.name().to_string(), p.value().clone()))
            .collect()
    }

    /// Restore every parameter from `state`; nothing is written unless all
    /// entries are present and shape-compatible
    fn load_state_dict(&mut self, state: &StateDict) -> LossResult<()> {
        let expected: Vec<String> = self.parameters().iter().map(|p| p.name().to_string()).collect();
        if let Some(extra) = state.keys().find(|k| !expected.contains(k)) {
            return Err(LossError::InvalidInput(format!("unexpected parameter '{}' in state dict", extra)));
        }
        for param in self.parameters() {
            let tensor = state.get(param.name()).ok_or_else(|| {
                LossError::InvalidInput(format!("missing parameter '{}' in state dict", param.name()))
            })?;
            param.check_compatible(tensor)?;
        }
        for param in self.parameters_mut() {
            if let Some(tensor) = state.get(param.name()) {
                param.load(tensor.clone())?;
            }
        }
        Ok(())
    }
}
