// src/ops/reduction.rs
use super::Operator;
use crate::backend::{CudaNumeric, Tensor};
use crate::error::Result;
use crate::math::{broadcast_scalar, sum_all};

/// Sum of every element, as a tensor of shape `[1]`. Used to turn an output into a
/// scalar loss.
#[derive(Debug, Clone, Default)]
pub struct Sum;

impl Sum {
    pub fn new() -> Self {
        Self
    }
}

impl<T: CudaNumeric> Operator<T> for Sum {
    fn output_shape(&self, _inputs: &[&[usize]]) -> Result<Vec<usize>> {
        Ok(vec![1])
    }

    fn compute(&mut self, inputs: &[&Tensor<T>], output: &mut Tensor<T>) -> Result<()> {
        sum_all(inputs[0], output)
    }

    fn gradient(
        &mut self,
        _index: usize,
        _inputs: &[&Tensor<T>],
        _output: &Tensor<T>,
        upstream: &Tensor<T>,
        grad: &mut Tensor<T>,
    ) -> Result<()> {
        broadcast_scalar(T::one(), upstream, grad)
    }

    fn num_inputs(&self) -> usize {
        1
    }
}
