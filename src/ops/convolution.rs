// src/ops/convolution.rs
use super::Operator;
use crate::backend::{CudaNumeric, Device, Tensor};
use crate::error::{GraphError, Result};
use crate::math::{
    Conv2dParams, ConvGeometry, ConvSettings, conv2d, conv2d_grad_data, conv2d_grad_filter,
};

/// 2D convolution of an input (`[N, C, H, W]` or `[C, H, W]`) with a filter bank
/// (`[Co, C, Kh, Kw]` or `[C, Kh, Kw]`). The output is always `[N, Co, Ho, Wo]`.
///
/// Geometry and execution settings are resolved at construction: on a CUDA device the
/// algorithm is picked and the node's workspaces are allocated there, and released
/// when the operator is dropped.
#[derive(Debug)]
pub struct Conv2d<T: CudaNumeric> {
    params: Conv2dParams,
    geometry: ConvGeometry,
    settings: ConvSettings<T>,
}

impl<T: CudaNumeric> Conv2d<T> {
    pub fn new(
        input_shape: &[usize],
        filter_shape: &[usize],
        params: Conv2dParams,
        device: Device,
        max_workspace_bytes: usize,
    ) -> Result<Self> {
        let geometry = ConvGeometry::new(input_shape, filter_shape, params)?;
        let settings = ConvSettings::for_device(device, &geometry, max_workspace_bytes)?;
        Ok(Self {
            params,
            geometry,
            settings,
        })
    }

    pub fn params(&self) -> &Conv2dParams {
        &self.params
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    pub fn settings(&self) -> &ConvSettings<T> {
        &self.settings
    }
}

impl<T: CudaNumeric> Operator<T> for Conv2d<T> {
    fn output_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        let geometry = ConvGeometry::new(inputs[0], inputs[1], self.params)?;
        if geometry != self.geometry {
            return Err(GraphError::invalid(format!(
                "Conv2d built for {:?} but wired to {:?} * {:?}",
                self.geometry, inputs[0], inputs[1]
            )));
        }
        Ok(geometry.output_shape())
    }

    fn compute(&mut self, inputs: &[&Tensor<T>], output: &mut Tensor<T>) -> Result<()> {
        conv2d(inputs[0], inputs[1], output, &self.params, &mut self.settings)
    }

    fn gradient(
        &mut self,
        index: usize,
        inputs: &[&Tensor<T>],
        _output: &Tensor<T>,
        upstream: &Tensor<T>,
        grad: &mut Tensor<T>,
    ) -> Result<()> {
        match index {
            0 => conv2d_grad_data(inputs[1], upstream, grad, &self.params, &mut self.settings),
            1 => conv2d_grad_filter(inputs[0], upstream, grad, &self.params, &mut self.settings),
            _ => Err(GraphError::invalid(format!("Conv2d has no input {index}"))),
        }
    }

    fn num_inputs(&self) -> usize {
        2
    }
}
