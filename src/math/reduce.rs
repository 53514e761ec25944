// src/math/reduce.rs
use super::device_mismatch;
use crate::backend::{CudaNumeric, Storage, Tensor};
use crate::error::{GraphError, Result};

/// `out[0] = sum(x)`; `out` must have shape `[1]`.
pub fn sum_all<T: CudaNumeric>(x: &Tensor<T>, out: &mut Tensor<T>) -> Result<()> {
    GraphError::check_shape(&[1], out.shape())?;
    let device = out.device();
    GraphError::check_device(device, x.device())?;

    match (x.storage(), out.storage_mut()) {
        (Storage::Host(x), Storage::Host(out)) => out.sum_from(x),
        #[cfg(feature = "cuda")]
        (Storage::Cuda(x), Storage::Cuda(out)) => {
            crate::backend::with_cuda_ops(|ops| ops.sum_all(x, out))
        }
        #[allow(unreachable_patterns)]
        (x, _) => Err(device_mismatch(device, x)),
    }
}

/// Fills `out` with `alpha * src[0]`; `src` must hold a single element.
pub fn broadcast_scalar<T: CudaNumeric>(
    alpha: T,
    src: &Tensor<T>,
    out: &mut Tensor<T>,
) -> Result<()> {
    if src.size() != 1 {
        return Err(GraphError::ShapeMismatch {
            expected: vec![1],
            got: src.shape().to_vec(),
        });
    }
    let device = out.device();
    GraphError::check_device(device, src.device())?;

    match (src.storage(), out.storage_mut()) {
        (Storage::Host(src), Storage::Host(out)) => out.broadcast_scalar(alpha, src),
        #[cfg(feature = "cuda")]
        (Storage::Cuda(src), Storage::Cuda(out)) => {
            crate::backend::with_cuda_ops(|ops| ops.broadcast_scalar(alpha, src, out))
        }
        #[allow(unreachable_patterns)]
        (src, _) => Err(device_mismatch(device, src)),
    }
}
