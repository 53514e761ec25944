// src/math/pooling.rs
use super::conv::output_extent;
use super::device_mismatch;
use crate::backend::{CudaNumeric, Storage, Tensor};
use crate::error::{GraphError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolingMode {
    #[default]
    Max,
    /// Mean over the full window; padded taps count as zeros.
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParams {
    pub filter_h: usize,
    pub filter_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub mode: PoolingMode,
}

impl PoolParams {
    /// Non-overlapping windows: stride equals the window size, no padding.
    pub fn new(mode: PoolingMode, filter_h: usize, filter_w: usize) -> Self {
        Self {
            filter_h,
            filter_w,
            pad_h: 0,
            pad_w: 0,
            stride_h: filter_h,
            stride_w: filter_w,
            dilation_h: 1,
            dilation_w: 1,
            mode,
        }
    }

    pub fn max(filter_h: usize, filter_w: usize) -> Self {
        Self::new(PoolingMode::Max, filter_h, filter_w)
    }

    pub fn average(filter_h: usize, filter_w: usize) -> Self {
        Self::new(PoolingMode::Average, filter_h, filter_w)
    }

    pub fn with_padding(mut self, pad_h: usize, pad_w: usize) -> Self {
        self.pad_h = pad_h;
        self.pad_w = pad_w;
        self
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self
    }

    pub fn with_dilation(mut self, dilation_h: usize, dilation_w: usize) -> Self {
        self.dilation_h = dilation_h;
        self.dilation_w = dilation_w;
        self
    }
}

/// Resolved pooling dimensions. Inputs are `[C, H, W]` or `[N, C, H, W]`; the output
/// keeps the input's rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub batch: usize,
    pub channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub batched: bool,
    pub params: PoolParams,
}

impl PoolGeometry {
    pub fn new(input: &[usize], params: PoolParams) -> Result<Self> {
        let (batch, channels, in_h, in_w, batched) = match *input {
            [c, h, w] => (1, c, h, w, false),
            [n, c, h, w] => (n, c, h, w, true),
            _ => {
                return Err(GraphError::UnsupportedRank {
                    what: "pooling input",
                    rank: input.len(),
                    expected: "3 or 4",
                });
            }
        };
        let out_h = output_extent(
            in_h,
            params.filter_h,
            params.pad_h,
            params.stride_h,
            params.dilation_h,
            "pooling height",
        )?;
        let out_w = output_extent(
            in_w,
            params.filter_w,
            params.pad_w,
            params.stride_w,
            params.dilation_w,
            "pooling width",
        )?;
        Ok(Self {
            batch,
            channels,
            in_h,
            in_w,
            out_h,
            out_w,
            batched,
            params,
        })
    }

    /// Number of independent `H x W` planes.
    pub fn planes(&self) -> usize {
        self.batch * self.channels
    }

    pub fn input_shape(&self) -> Vec<usize> {
        if self.batched {
            vec![self.batch, self.channels, self.in_h, self.in_w]
        } else {
            vec![self.channels, self.in_h, self.in_w]
        }
    }

    pub fn output_shape(&self) -> Vec<usize> {
        if self.batched {
            vec![self.batch, self.channels, self.out_h, self.out_w]
        } else {
            vec![self.channels, self.out_h, self.out_w]
        }
    }
}

/// Pools `x` into `out`. For max pooling `max_positions` (shaped like `out`) receives
/// the flat index into `x` of each winner, -1 when the window only covered padding.
#[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
pub fn pooling<T: CudaNumeric>(
    x: &Tensor<T>,
    out: &mut Tensor<T>,
    max_positions: &mut Tensor<i32>,
    params: &PoolParams,
) -> Result<()> {
    let g = PoolGeometry::new(x.shape(), *params)?;
    GraphError::check_shape(&g.output_shape(), out.shape())?;
    GraphError::check_shape(&g.output_shape(), max_positions.shape())?;
    let device = out.device();
    GraphError::check_device(device, x.device())?;
    GraphError::check_device(device, max_positions.device())?;

    match (x.storage(), out.storage_mut(), max_positions.storage_mut()) {
        (Storage::Host(x), Storage::Host(y), Storage::Host(pos)) => y.pool2d_into(x, pos, &g),
        #[cfg(feature = "cuda")]
        (Storage::Cuda(x), Storage::Cuda(y), Storage::Cuda(pos)) => {
            crate::backend::with_cuda_ops(|ops| ops.pooling(x, y, pos, &g))
        }
        #[allow(unreachable_patterns)]
        (x, _, _) => Err(device_mismatch(device, x)),
    }
}

/// Pooling backward. `x` and `y` are the forward input and output, `dy` the upstream
/// gradient and `dx` receives the gradient w.r.t. `x`.
#[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
pub fn pooling_grad<T: CudaNumeric>(
    x: &Tensor<T>,
    y: &Tensor<T>,
    dy: &Tensor<T>,
    max_positions: &Tensor<i32>,
    dx: &mut Tensor<T>,
    params: &PoolParams,
) -> Result<()> {
    let g = PoolGeometry::new(x.shape(), *params)?;
    GraphError::check_shape(x.shape(), dx.shape())?;
    GraphError::check_shape(&g.output_shape(), y.shape())?;
    GraphError::check_shape(&g.output_shape(), dy.shape())?;
    GraphError::check_shape(&g.output_shape(), max_positions.shape())?;
    let device = dx.device();
    for other in [x.device(), y.device(), dy.device(), max_positions.device()] {
        GraphError::check_device(device, other)?;
    }

    match (dy.storage(), max_positions.storage(), dx.storage_mut()) {
        (Storage::Host(dy), Storage::Host(pos), Storage::Host(dx)) => {
            dx.pool2d_grad_into(dy, pos, &g)
        }
        #[cfg(feature = "cuda")]
        (Storage::Cuda(dy), Storage::Cuda(pos), Storage::Cuda(dx)) => {
            crate::backend::with_cuda_ops(|ops| ops.pooling_grad(dy, pos, dx, &g))
        }
        #[allow(unreachable_patterns)]
        (dy, _, _) => Err(device_mismatch(device, dy)),
    }
}
