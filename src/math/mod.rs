// src/math/mod.rs
//! Numeric kernel layer. Every entry point validates its operands, then branches on
//! the memory location of the output tensor: host buffers go through `ndarray`,
//! device buffers through the CUDA context of the element type.

mod add;
mod conv;
mod matmul;
mod pooling;
mod reduce;

pub use add::add_in_place;
pub use conv::{
    Conv2dParams, ConvAlgorithm, ConvGeometry, ConvMode, ConvSettings, conv2d,
    conv2d_grad_data, conv2d_grad_filter,
};
pub use matmul::{gemm_dims, matmul, matmul_output_shape};
pub use pooling::{PoolGeometry, PoolParams, PoolingMode, pooling, pooling_grad};
pub use reduce::{broadcast_scalar, sum_all};

use crate::backend::{CudaNumeric, Device, Storage, StorageBackend};
use crate::error::{GraphError, Result};

pub(crate) fn device_mismatch<T: CudaNumeric>(expected: Device, got: &Storage<T>) -> GraphError {
    GraphError::DeviceMismatch {
        expected,
        got: got.device(),
    }
}

/// Waits for the kernels queued for `device`. No-op on the host.
pub fn synchronize<T: CudaNumeric>(device: Device) -> Result<()> {
    match device {
        Device::CPU => Ok(()),
        #[cfg(feature = "cuda")]
        Device::CUDA(_) => crate::backend::with_cuda_context::<T, _, _>(|ctx| ctx.synchronize()),
        #[cfg(not(feature = "cuda"))]
        Device::CUDA(_) => Err(GraphError::Unsupported(format!("synchronize on {device}"))),
    }
}
