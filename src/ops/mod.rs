// src/ops/mod.rs
// Every node of the graph that computes something owns an operator. The engine takes
// care of evaluation order, output allocation, gradient caching and stream
// synchronisation; the operator only maps input tensors to its output (forward) and an
// upstream gradient to the gradient of one input (backward) through the kernel layer.
use crate::backend::{CudaNumeric, Tensor};
use crate::error::Result;
use std::any::type_name;

pub mod basic;
pub mod convolution;
pub mod matrix;
pub mod pooling;
pub mod reduction;

pub use basic::Add;
pub use convolution::Conv2d;
pub use matrix::MatMul;
pub use pooling::Pooling;
pub use reduction::Sum;

pub trait Operator<T: CudaNumeric>: std::fmt::Debug {
    /// Output shape for the given input shapes. Called once, when the node is built.
    fn output_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>>;

    /// Writes the result into `output`, which already has the shape returned by
    /// `output_shape` and lives on the node's device.
    fn compute(&mut self, inputs: &[&Tensor<T>], output: &mut Tensor<T>) -> Result<()>;

    /// Writes the gradient w.r.t. `inputs[index]` into `grad` (shaped like that input),
    /// given the gradient of the loss w.r.t. this operator's output.
    fn gradient(
        &mut self,
        index: usize,
        inputs: &[&Tensor<T>],
        output: &Tensor<T>,
        upstream: &Tensor<T>,
        grad: &mut Tensor<T>,
    ) -> Result<()>;

    // Number of inputs this operator expects
    fn num_inputs(&self) -> usize;

    fn name(&self) -> String {
        let full_name = type_name::<Self>();
        let base = full_name.split('<').next().unwrap_or(full_name);
        base.rsplit("::").next().unwrap_or(base).to_string()
    }
}

mod tests;
