//! Computation graph for automatic differentiation

use std::collections::HashMap;
use std::sync::Arc;

use super::function::Function;
use crate::{
    error::{LossError, LossResult},
    nn::parameter::ParameterId,
    tensor::{Shape, Tensor},
};

pub type NodeId = usize;

/// A node in the computation graph representing a tensor and its gradient computation
pub struct GraphNode {
    pub id: NodeId,
    pub value: Arc<Tensor>,
    pub requires_grad: bool,
    pub parents: Vec<NodeId>,
    pub grad_fn: Option<Box<dyn Function>>,
}

impl GraphNode {
    pub fn is_leaf(&self) -> bool {
        self.grad_fn.is_none()
    }
}

/// Append-only tape of nodes.
///
/// Node ids are handed out in creation order and every op node is created
/// after its parents, so walking ids downwards is already a reverse
/// topological order.
#[derive(Default)]
pub struct ComputationGraph {
    nodes: Vec<GraphNode>,
    parameters: HashMap<ParameterId, NodeId>,
}

impl ComputationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a leaf node (variable)
    pub fn create_leaf_node(&mut self, tensor: impl Into<Arc<Tensor>>, requires_grad: bool) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(GraphNode {
            id,
            value: tensor.into(),
            requires_grad,
            parents: Vec::new(),
            grad_fn: None,
        });
        id
    }

    /// Leaf node for a trainable parameter, reused if the parameter is already bound
    pub fn bind_parameter(&mut self, id: ParameterId, tensor: &Tensor, requires_grad: bool) -> NodeId {
        if let Some(&node) = self.parameters.get(&id) {
            return node;
        }
        let node = self.create_leaf_node(tensor.clone(), requires_grad);
        self.parameters.insert(id, node);
        node
    }

    /// Create an operation node; it requires grad if any parent does
    pub fn create_op_node(
        &mut self,
        tensor: impl Into<Arc<Tensor>>,
        parents: Vec<NodeId>,
        grad_fn: Box<dyn Function>,
    ) -> LossResult<NodeId> {
        let mut requires_grad = false;
        for &parent in &parents {
            let node = self.nodes.get(parent).ok_or_else(|| {
                LossError::InternalError(format!("{} refers to unknown node {}", grad_fn.name(), parent))
            })?;
            requires_grad |= node.requires_grad;
        }
        let id = self.nodes.len();
        self.nodes.push(GraphNode {
            id,
            value: tensor.into(),
            requires_grad,
            parents,
            grad_fn: if requires_grad { Some(grad_fn) } else { None },
        });
        Ok(id)
    }

    pub fn value(&self, id: NodeId) -> Option<Arc<Tensor>> {
        self.nodes.get(id).map(|n| n.value.clone())
    }

    pub fn requires_grad(&self, id: NodeId) -> bool {
        self.nodes.get(id).map(|n| n.requires_grad).unwrap_or(false)
    }

    /// Reverse-mode pass from a scalar root, returning gradients of every leaf
    /// that requires them
    pub fn backward(&self, root: NodeId) -> LossResult<Gradients> {
        let root_node = self
            .nodes
            .get(root)
            .ok_or_else(|| LossError::InternalError(format!("unknown root node {}", root)))?;
        if !root_node.value.shape().is_scalar() {
            return Err(LossError::shape_error(
                "a [1, 1] loss",
                &root_node.value.shape().to_string(),
                Some("reduce the output to a scalar before calling backward"),
            ));
        }

        let mut grads: Vec<Option<Tensor>> = vec![None; root + 1];
        grads[root] = Some(Tensor::ones(Shape::scalar(), root_node.value.device()));

        for id in (0..=root).rev() {
            let node = &self.nodes[id];
            let Some(grad_fn) = &node.grad_fn else {
                continue;
            };
            let Some(grad_output) = grads[id].take() else {
                continue;
            };
            let inputs: Vec<Arc<Tensor>> = node.parents.iter().map(|&p| self.nodes[p].value.clone()).collect();
            let input_grads = grad_fn.backward(&grad_output, &inputs, &node.value)?;
            if input_grads.len() != node.parents.len() {
                return Err(LossError::InternalError(format!(
                    "{} returned {} gradients for {} inputs",
                    grad_fn.name(),
                    input_grads.len(),
                    node.parents.len()
                )));
            }
            for (&parent, grad) in node.parents.iter().zip(input_grads) {
                let Some(grad) = grad else { continue };
                if !self.nodes[parent].requires_grad {
                    continue;
                }
                let grad = grad.sum_to(self.nodes[parent].value.shape())?;
                grads[parent] = Some(match grads[parent].take() {
                    Some(existing) => existing.add(&grad)?,
                    None => grad,
                });
            }
        }

        let leaves = grads
            .into_iter()
            .enumerate()
            .filter_map(|(id, grad)| {
                let node = &self.nodes[id];
                match grad {
                    Some(g) if node.is_leaf() && node.requires_grad => Some((id, g)),
                    _ => None,
                }
            })
            .collect();

        Ok(Gradients {
            leaves,
            parameters: self.parameters.clone(),
        })
    }

    /// Get number of nodes in graph
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Clear the computation graph
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.parameters.clear();
    }
}

/// Leaf gradients produced by one backward pass
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    leaves: HashMap<NodeId, Tensor>,
    parameters: HashMap<ParameterId, NodeId>,
}

impl Gradients {
    /// Gradient for a leaf node
    pub fn get(&self, node: NodeId) -> Option<&Tensor> {
        self.leaves.get(&node)
    }

    /// Gradient for a parameter that was bound on the graph
    pub fn for_parameter(&self, id: ParameterId) -> Option<&Tensor> {
        self.parameters.get(&id).and_then(|node| self.leaves.get(node))
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}
