// src/graph/gradients.rs
use super::NodeId;
use crate::backend::{CudaNumeric, Tensor};
use crate::error::Result;
use crate::math::add_in_place;
use std::collections::HashMap;

/// Result of a backward pass: the gradient of the loss w.r.t. every node it reached.
/// Contributions from several consumers are summed into one tensor per node.
#[derive(Debug)]
pub struct GradientTable<T: CudaNumeric> {
    grads: HashMap<NodeId, Tensor<T>>,
}

impl<T: CudaNumeric> Default for GradientTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CudaNumeric> GradientTable<T> {
    pub fn new() -> Self {
        Self {
            grads: HashMap::new(),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Tensor<T>> {
        self.grads.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.grads.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Tensor<T>)> {
        self.grads.iter().map(|(id, grad)| (*id, grad))
    }

    /// Adds `grad` to the entry of `id`, creating it on first contribution.
    pub fn accumulate(&mut self, id: NodeId, grad: &Tensor<T>) -> Result<()> {
        match self.grads.get_mut(&id) {
            Some(existing) => add_in_place(T::one(), grad, T::one(), existing),
            None => {
                self.grads.insert(id, grad.clone());
                Ok(())
            }
        }
    }

    pub(crate) fn take(&mut self, id: NodeId) -> Option<Tensor<T>> {
        self.grads.remove(&id)
    }

    pub(crate) fn insert(&mut self, id: NodeId, grad: Tensor<T>) {
        self.grads.insert(id, grad);
    }
}
