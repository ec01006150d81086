//! Variable wrapper for tensors in the computation graph

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use super::graph::{ComputationGraph, Gradients, NodeId};
use crate::{
    error::LossResult,
    tensor::{Device, Shape, Tensor},
};

/// A tensor recorded on a computation graph.
///
/// Cloning is cheap: the value is shared and the clone refers to the same node.
#[derive(Clone)]
pub struct Variable {
    graph: Arc<RwLock<ComputationGraph>>,
    node_id: NodeId,
    value: Arc<Tensor>,
    requires_grad: bool,
}

impl Variable {
    pub(crate) fn new(
        graph: Arc<RwLock<ComputationGraph>>,
        node_id: NodeId,
        value: Arc<Tensor>,
        requires_grad: bool,
    ) -> Self {
        Self {
            graph,
            node_id,
            value,
            requires_grad,
        }
    }

    pub(crate) fn graph(&self) -> &Arc<RwLock<ComputationGraph>> {
        &self.graph
    }

    /// Get reference to underlying tensor
    pub fn tensor(&self) -> &Tensor {
        &self.value
    }

    /// Get node ID in computation graph
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Check if variable requires gradients
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn shape(&self) -> Shape {
        self.value.shape()
    }

    pub fn device(&self) -> Device {
        self.value.device()
    }

    /// Value of a `[1, 1]` variable
    pub fn item(&self) -> LossResult<f64> {
        self.value.item()
    }

    /// Run the backward pass with this variable as the scalar root
    pub fn backward(&self) -> LossResult<Gradients> {
        self.graph.read().backward(self.node_id)
    }

    /// Same value as a new leaf on the same graph, cut off from gradient flow
    pub fn detach(&self) -> Variable {
        let node_id = self.graph.write().create_leaf_node(self.value.clone(), false);
        Variable::new(self.graph.clone(), node_id, self.value.clone(), false)
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("node_id", &self.node_id)
            .field("shape", &self.value.shape())
            .field("device", &self.value.device())
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}

impl Gradients {
    /// Gradient of the root w.r.t. a leaf variable
    pub fn wrt(&self, var: &Variable) -> Option<&Tensor> {
        self.get(var.node_id())
    }
}
