// src/ops/pooling.rs
use super::Operator;
use crate::backend::{CudaNumeric, Device, Tensor};
use crate::error::{GraphError, Result};
use crate::math::{PoolGeometry, PoolParams, pooling, pooling_grad};

/// 2D max or average pooling over the spatial axes. The operator owns the tensor of
/// winning positions filled by the forward pass and read by the backward pass. On a
/// device that tensor lives on the compute stream of the node's element type, the same
/// stream that runs the pooling kernels.
#[derive(Debug)]
pub struct Pooling {
    params: PoolParams,
    max_positions: Tensor<i32>,
}

impl Pooling {
    pub fn new<T: CudaNumeric>(
        input_shape: &[usize],
        params: PoolParams,
        device: Device,
    ) -> Result<Self> {
        let geometry = PoolGeometry::new(input_shape, params)?;
        let max_positions = Tensor::zeros_for::<T>(&geometry.output_shape(), device)?;
        Ok(Self {
            params,
            max_positions,
        })
    }

    pub fn params(&self) -> &PoolParams {
        &self.params
    }

    /// Flat input index of each window's maximum, as recorded by the last forward pass.
    /// On a device, read it only after the node's stream has been synchronized.
    pub fn max_positions(&self) -> &Tensor<i32> {
        &self.max_positions
    }
}

impl<T: CudaNumeric> Operator<T> for Pooling {
    fn output_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        let shape = PoolGeometry::new(inputs[0], self.params)?.output_shape();
        GraphError::check_shape(self.max_positions.shape(), &shape)?;
        Ok(shape)
    }

    fn compute(&mut self, inputs: &[&Tensor<T>], output: &mut Tensor<T>) -> Result<()> {
        pooling(inputs[0], output, &mut self.max_positions, &self.params)
    }

    fn gradient(
        &mut self,
        _index: usize,
        inputs: &[&Tensor<T>],
        output: &Tensor<T>,
        upstream: &Tensor<T>,
        grad: &mut Tensor<T>,
    ) -> Result<()> {
        pooling_grad(
            inputs[0],
            output,
            upstream,
            &self.max_positions,
            grad,
            &self.params,
        )
    }

    fn num_inputs(&self) -> usize {
        1
    }
}
