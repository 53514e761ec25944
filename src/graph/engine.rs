// src/graph/engine.rs
use super::gradients::GradientTable;
use super::node::{Node, NodeId};
use crate::backend::{CudaNumeric, Device, Fill, Tensor};
use crate::config::EngineConfig;
use crate::error::{GraphError, Result};
use crate::math::{Conv2dParams, PoolParams};
use crate::ops::{Add, Conv2d, MatMul, Operator, Pooling, Sum};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashSet;
use tracing::debug;

/// Owner of the computation graph.
///
/// Nodes live in an arena and refer to their inputs by `NodeId`. Because a node can only
/// be built from nodes that already exist, ascending id order is a topological order,
/// which both evaluation and the backward pass rely on.
#[derive(Debug)]
pub struct Engine<T: CudaNumeric> {
    nodes: Vec<Node<T>>,
    config: EngineConfig,
    rng: StdRng,
}

impl<T: CudaNumeric> Default for Engine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CudaNumeric> Engine<T> {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            nodes: Vec::new(),
            config,
            rng,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node<T>> {
        self.nodes.get(id.0).ok_or(GraphError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<T>> {
        self.nodes.get_mut(id.0).ok_or(GraphError::NodeNotFound(id))
    }

    pub fn output_shape(&self, id: NodeId) -> Result<&[usize]> {
        Ok(self.node(id)?.shape())
    }

    pub fn evaluation_count(&self, id: NodeId) -> Result<usize> {
        Ok(self.node(id)?.evaluations())
    }

    /// Current value of a node without evaluating anything.
    pub fn value(&self, id: NodeId) -> Result<&Tensor<T>> {
        self.node(id)?.output().ok_or(GraphError::NotEvaluated(id))
    }

    // ============= GRAPH CONSTRUCTION =============

    /// Leaf holding `value`.
    pub fn variable(&mut self, value: Tensor<T>, requires_grad: bool) -> NodeId {
        let id = NodeId(self.nodes.len());
        debug!(node = %id, shape = ?value.shape(), device = %value.device(), "created variable");
        self.nodes.push(Node::leaf(id, value, requires_grad));
        id
    }

    /// Leaf allocated on the configured device and filled with the engine's RNG.
    pub fn tensor(&mut self, shape: &[usize], fill: Fill<T>, requires_grad: bool) -> Result<NodeId> {
        let value = Tensor::new_with_rng(shape, fill, self.config.device, &mut self.rng)?;
        Ok(self.variable(value, requires_grad))
    }

    /// Replaces the value of a leaf. Shape and device must match the current value.
    /// Consumers keep their cached outputs until they are evaluated with `recompute`.
    pub fn set_value(&mut self, id: NodeId, value: Tensor<T>) -> Result<()> {
        self.node_mut(id)?.set_value(value)
    }

    /// Overrides the sync mode of one node.
    pub fn set_asynchronous(&mut self, id: NodeId, asynchronous: bool) -> Result<()> {
        self.node_mut(id)?.set_asynchronous(asynchronous);
        Ok(())
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.push_op(Box::new(Add::new()), vec![a, b], None)
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.matmul_with(a, false, b, false)
    }

    /// `op(a) * op(b)` where `op` transposes when the matching flag is set.
    pub fn matmul_with(
        &mut self,
        a: NodeId,
        trans_a: bool,
        b: NodeId,
        trans_b: bool,
    ) -> Result<NodeId> {
        let op = MatMul::with_transposes(trans_a, trans_b);
        self.push_op(Box::new(op), vec![a, b], None)
    }

    /// 2D convolution of `input` with `filter`. On a CUDA device the node's algorithm is
    /// chosen and its workspaces allocated here.
    pub fn conv2d(
        &mut self,
        input: NodeId,
        filter: NodeId,
        params: Conv2dParams,
        needs_grad: bool,
    ) -> Result<NodeId> {
        let device = self.shared_device(&[input, filter])?;
        let op = Conv2d::<T>::new(
            self.node(input)?.shape(),
            self.node(filter)?.shape(),
            params,
            device,
            self.config.max_workspace_bytes,
        )?;
        self.push_op(Box::new(op), vec![input, filter], Some(needs_grad))
    }

    pub fn pooling(&mut self, x: NodeId, params: PoolParams, needs_grad: bool) -> Result<NodeId> {
        let device = self.shared_device(&[x])?;
        let op = Pooling::new::<T>(self.node(x)?.shape(), params, device)?;
        self.push_op(Box::new(op), vec![x], Some(needs_grad))
    }

    /// Sum of all elements, shaped `[1]`.
    pub fn sum(&mut self, x: NodeId) -> Result<NodeId> {
        self.push_op(Box::new(Sum::new()), vec![x], None)
    }

    fn shared_device(&self, inputs: &[NodeId]) -> Result<Device> {
        let mut device = None;
        for &id in inputs {
            let input_device = self.node(id)?.device();
            match device {
                None => device = Some(input_device),
                Some(expected) => GraphError::check_device(expected, input_device)?,
            }
        }
        device.ok_or_else(|| GraphError::invalid("operation without inputs"))
    }

    /// Validates and inserts an operation node. Nothing is inserted on failure.
    /// `requires_grad` defaults to whether any input requires a gradient.
    fn push_op(
        &mut self,
        op: Box<dyn Operator<T>>,
        inputs: Vec<NodeId>,
        requires_grad: Option<bool>,
    ) -> Result<NodeId> {
        if inputs.len() != op.num_inputs() {
            return Err(GraphError::invalid(format!(
                "{} expects {} inputs, got {}",
                op.name(),
                op.num_inputs(),
                inputs.len()
            )));
        }
        let device = self.shared_device(&inputs)?;
        let input_shapes = inputs
            .iter()
            .map(|&id| self.output_shape(id))
            .collect::<Result<Vec<_>>>()?;
        let shape = op.output_shape(&input_shapes)?;
        let requires_grad = match requires_grad {
            Some(flag) => flag,
            None => inputs.iter().any(|id| self.nodes[id.0].requires_grad()),
        };

        let id = NodeId(self.nodes.len());
        debug!(
            node = %id,
            op = %op.name(),
            inputs = ?inputs,
            shape = ?shape,
            %device,
            requires_grad,
            "created node"
        );
        let asynchronous = self.config.asynchronous;
        self.nodes.push(Node::op(
            id,
            op,
            inputs,
            shape,
            device,
            requires_grad,
            asynchronous,
        ));
        Ok(id)
    }

    // ============= EVALUATION =============

    /// Value of `id`, evaluating whatever is missing. With `recompute` every operation
    /// reachable from `id` runs again, once per call.
    pub fn eval(&mut self, id: NodeId, recompute: bool) -> Result<&Tensor<T>> {
        self.node(id)?;
        for node_id in self.evaluation_plan(id, recompute) {
            self.evaluate_node(node_id)?;
        }
        self.value(id)
    }

    // Operation nodes that must run for `root`, in ascending (topological) order.
    fn evaluation_plan(&self, root: NodeId, recompute: bool) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut stack = vec![root];
        let mut plan = Vec::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let node = &self.nodes[id.0];
            if node.is_leaf() || (!recompute && node.is_evaluated()) {
                continue;
            }
            plan.push(id);
            stack.extend(node.inputs().iter().copied());
        }
        plan.sort_unstable();
        plan
    }

    fn evaluate_node(&mut self, id: NodeId) -> Result<()> {
        let (before, rest) = self.nodes.split_at_mut(id.0);
        let node = rest.first_mut().ok_or(GraphError::NodeNotFound(id))?;
        let inputs = gather_inputs(before, node.inputs())?;
        node.evaluate(&inputs)
    }

    // ============= GRADIENTS =============

    /// Gradient of the loss w.r.t. `variable`, computed at `node` from `upstream` (the
    /// gradient w.r.t. `node`'s output). `node` is evaluated first if needed. When given,
    /// `consumer` must read from `node`.
    pub fn grad(
        &mut self,
        node: NodeId,
        consumer: Option<NodeId>,
        variable: NodeId,
        upstream: &Tensor<T>,
    ) -> Result<&Tensor<T>> {
        self.node(node)?;
        if let Some(consumer) = consumer {
            if !self.node(consumer)?.inputs().contains(&node) {
                return Err(GraphError::InvalidVariable {
                    node: consumer,
                    variable: node,
                });
            }
        }
        if !self.node(node)?.inputs().contains(&variable) {
            return Err(GraphError::InvalidVariable { node, variable });
        }
        self.eval(node, false)?;

        let (before, rest) = self.nodes.split_at_mut(node.0);
        let target = rest.first_mut().ok_or(GraphError::NodeNotFound(node))?;
        let inputs = gather_inputs(before, target.inputs())?;
        target.gradient(variable, &inputs, upstream)
    }

    /// Reverse-mode pass from `loss`, seeded with ones of the loss shape.
    ///
    /// Nodes are visited in descending id order, so every consumer of a node has added
    /// its contribution before the node propagates further. Inputs that do not require
    /// a gradient are skipped.
    pub fn backward(&mut self, loss: NodeId) -> Result<GradientTable<T>> {
        self.eval(loss, false)?;
        let seed = {
            let node = self.node(loss)?;
            Tensor::ones(node.shape(), node.device())?
        };
        let mut table = GradientTable::new();
        table.insert(loss, seed);

        for id in self.reachable_desc(loss) {
            let variables = {
                let node = &self.nodes[id.0];
                if node.is_leaf() || !node.requires_grad() {
                    continue;
                }
                let mut variables = node.inputs().to_vec();
                variables.sort_unstable();
                variables.dedup();
                variables.retain(|v| self.nodes[v.0].requires_grad());
                variables
            };
            let Some(upstream) = table.take(id) else {
                continue;
            };

            for variable in variables {
                let (before, rest) = self.nodes.split_at_mut(id.0);
                let node = rest.first_mut().ok_or(GraphError::NodeNotFound(id))?;
                let inputs = gather_inputs(before, node.inputs())?;
                let grad = node.gradient(variable, &inputs, &upstream)?;
                table.accumulate(variable, grad)?;
            }
            table.insert(id, upstream);
        }
        debug!(loss = %loss, gradients = table.len(), "backward pass finished");
        Ok(table)
    }

    fn reachable_desc(&self, root: NodeId) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if visited.insert(id) {
                stack.extend(self.nodes[id.0].inputs().iter().copied());
            }
        }
        let mut order: Vec<NodeId> = visited.into_iter().collect();
        order.sort_unstable_by(|a, b| b.cmp(a));
        order
    }
}

// Inputs of a node all live before it in the arena.
fn gather_inputs<'a, T: CudaNumeric>(
    before: &'a [Node<T>],
    inputs: &[NodeId],
) -> Result<Vec<&'a Tensor<T>>> {
    inputs
        .iter()
        .map(|&id| {
            before
                .get(id.0)
                .ok_or(GraphError::NodeNotFound(id))?
                .output()
                .ok_or(GraphError::NotEvaluated(id))
        })
        .collect()
}
