//! Automatic differentiation system with computation graph
//!
//! This module implements reverse-mode automatic differentiation
//! (backpropagation) over a dynamic, append-only tape. It covers exactly the
//! primitives the proxy-anchor losses are composed from.

pub mod function;
pub mod graph;
pub mod ops;
pub mod variable;

pub use function::Function;
pub use graph::{ComputationGraph, Gradients, GraphNode, NodeId};
pub use variable::Variable;

use parking_lot::RwLock;
use std::sync::Arc;

use crate::{nn::parameter::Parameter, tensor::Tensor};

/// Handle to one computation graph; create one per training step
#[derive(Clone, Default)]
pub struct AutogradEngine {
    graph: Arc<RwLock<ComputationGraph>>,
}

impl AutogradEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a variable (leaf node)
    pub fn variable(&self, tensor: Tensor, requires_grad: bool) -> Variable {
        let value = Arc::new(tensor);
        let node_id = self.graph.write().create_leaf_node(value.clone(), requires_grad);
        Variable::new(self.graph.clone(), node_id, value, requires_grad)
    }

    /// Bind a trainable parameter as a leaf; binding it twice yields the same node
    pub fn parameter(&self, parameter: &Parameter) -> Variable {
        let mut graph = self.graph.write();
        let node_id = graph.bind_parameter(parameter.id(), parameter.value(), parameter.requires_grad());
        let value = graph
            .value(node_id)
            .unwrap_or_else(|| Arc::new(parameter.value().clone()));
        let requires_grad = graph.requires_grad(node_id);
        drop(graph);
        Variable::new(self.graph.clone(), node_id, value, requires_grad)
    }

    /// Number of nodes recorded so far
    pub fn num_nodes(&self) -> usize {
        self.graph.read().num_nodes()
    }
}

impl Variable {
    /// Engine owning the graph this variable lives on
    pub fn engine(&self) -> AutogradEngine {
        AutogradEngine {
            graph: self.graph().clone(),
        }
    }
}
