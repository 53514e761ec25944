// src/graph/node.rs
use crate::backend::{CudaNumeric, Device, Tensor};
use crate::error::{GraphError, Result};
use crate::math::{add_in_place, synchronize};
use crate::ops::Operator;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Position of a node in the engine's arena.
/// Inputs are always created before their consumers, so a node's id is larger than the
/// id of every node it reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug)]
pub enum NodeKind<T: CudaNumeric> {
    /// Placeholder or parameter. Its value is set by the caller.
    Leaf,
    Op(Box<dyn Operator<T>>),
}

/// Arena entry of the computation graph.
#[derive(Debug)]
pub struct Node<T: CudaNumeric> {
    id: NodeId,
    kind: NodeKind<T>,
    inputs: Vec<NodeId>,
    requires_grad: bool,
    device: Device,
    shape: Vec<usize>,
    // Allocated on first evaluation for op nodes, always present for leaves.
    output: Option<Tensor<T>>,
    // Gradient of this node's output w.r.t. each input, reused across backward passes.
    gradients: HashMap<NodeId, Tensor<T>>,
    evaluations: usize,
    asynchronous: bool,
}

impl<T: CudaNumeric> Node<T> {
    pub(crate) fn leaf(id: NodeId, value: Tensor<T>, requires_grad: bool) -> Self {
        Self {
            id,
            kind: NodeKind::Leaf,
            inputs: Vec::new(),
            requires_grad,
            device: value.device(),
            shape: value.shape().to_vec(),
            output: Some(value),
            gradients: HashMap::new(),
            evaluations: 0,
            asynchronous: false,
        }
    }

    pub(crate) fn op(
        id: NodeId,
        op: Box<dyn Operator<T>>,
        inputs: Vec<NodeId>,
        shape: Vec<usize>,
        device: Device,
        requires_grad: bool,
        asynchronous: bool,
    ) -> Self {
        Self {
            id,
            kind: NodeKind::Op(op),
            inputs,
            requires_grad,
            device,
            shape,
            output: None,
            gradients: HashMap::new(),
            evaluations: 0,
            asynchronous,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind<T> {
        &self.kind
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf)
    }

    pub fn is_evaluated(&self) -> bool {
        self.output.is_some()
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    /// How many times the forward kernel of this node has run.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn output(&self) -> Option<&Tensor<T>> {
        self.output.as_ref()
    }

    /// Cached gradient w.r.t. `variable` from the last request, if any.
    pub fn cached_gradient(&self, variable: NodeId) -> Option<&Tensor<T>> {
        self.gradients.get(&variable)
    }

    pub fn op_name(&self) -> String {
        match &self.kind {
            NodeKind::Leaf => "Leaf".to_string(),
            NodeKind::Op(op) => op.name(),
        }
    }

    pub(crate) fn set_asynchronous(&mut self, asynchronous: bool) {
        self.asynchronous = asynchronous;
    }

    pub(crate) fn set_value(&mut self, value: Tensor<T>) -> Result<()> {
        if !self.is_leaf() {
            return Err(GraphError::invalid(format!(
                "cannot overwrite the value of {} ({})",
                self.id,
                self.op_name()
            )));
        }
        GraphError::check_shape(&self.shape, value.shape())?;
        GraphError::check_device(self.device, value.device())?;
        self.output = Some(value);
        Ok(())
    }

    /// Runs the forward kernel on already evaluated `inputs`. Leaves are left untouched.
    pub(crate) fn evaluate(&mut self, inputs: &[&Tensor<T>]) -> Result<()> {
        let NodeKind::Op(op) = &mut self.kind else {
            return Ok(());
        };
        if self.output.is_none() {
            self.output = Some(Tensor::zeros(&self.shape, self.device)?);
        }
        let output = self.output.as_mut().ok_or(GraphError::NotEvaluated(self.id))?;

        op.compute(inputs, output)?;
        if !self.asynchronous {
            synchronize::<T>(self.device)?;
        }
        self.evaluations += 1;
        debug!(node = %self.id, op = %op.name(), evaluations = self.evaluations, "evaluated node");
        Ok(())
    }

    /// Gradient of the loss w.r.t. `variable`, given the gradient w.r.t. this node's
    /// output. When `variable` feeds several inputs the contributions are summed.
    pub(crate) fn gradient(
        &mut self,
        variable: NodeId,
        inputs: &[&Tensor<T>],
        upstream: &Tensor<T>,
    ) -> Result<&Tensor<T>> {
        let positions: Vec<usize> = self
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, id)| **id == variable)
            .map(|(index, _)| index)
            .collect();
        let invalid = GraphError::InvalidVariable {
            node: self.id,
            variable,
        };
        let (Some(&first), NodeKind::Op(op)) = (positions.first(), &mut self.kind) else {
            return Err(invalid);
        };
        let output = self.output.as_ref().ok_or(GraphError::NotEvaluated(self.id))?;
        GraphError::check_shape(&self.shape, upstream.shape())?;
        GraphError::check_device(self.device, upstream.device())?;
        trace!(node = %self.id, %variable, op = %op.name(), "gradient request");

        let var_shape = inputs[first].shape().to_vec();
        if !self.gradients.contains_key(&variable) {
            self.gradients
                .insert(variable, Tensor::zeros(&var_shape, self.device)?);
        }
        let grad = self.gradients.get_mut(&variable).ok_or(invalid)?;

        op.gradient(first, inputs, output, upstream, grad)?;
        if positions.len() > 1 {
            let mut partial = Tensor::zeros(&var_shape, self.device)?;
            for &index in &positions[1..] {
                op.gradient(index, inputs, output, upstream, &mut partial)?;
                add_in_place(T::one(), &partial, T::one(), grad)?;
            }
        }
        if !self.asynchronous {
            synchronize::<T>(self.device)?;
        }
        Ok(grad)
    }
}
