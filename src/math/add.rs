// src/math/add.rs
use super::device_mismatch;
use crate::backend::{CudaNumeric, Storage, Tensor};
use crate::error::{GraphError, Result};

/// `out = alpha * x + beta * out`. Shapes must match exactly; `beta == 0` overwrites
/// `out` without reading it.
pub fn add_in_place<T: CudaNumeric>(
    alpha: T,
    x: &Tensor<T>,
    beta: T,
    out: &mut Tensor<T>,
) -> Result<()> {
    GraphError::check_shape(out.shape(), x.shape())?;
    let device = out.device();
    GraphError::check_device(device, x.device())?;

    match (x.storage(), out.storage_mut()) {
        (Storage::Host(x), Storage::Host(out)) => out.add_in_place(alpha, x, beta),
        #[cfg(feature = "cuda")]
        (Storage::Cuda(x), Storage::Cuda(out)) => {
            crate::backend::with_cuda_ops(|ops| ops.add_in_place(alpha, x, beta, out))
        }
        #[allow(unreachable_patterns)]
        (x, _) => Err(device_mismatch(device, x)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu;

    #[test]
    fn test_add_in_place_scales_and_accumulates() {
        let x = Tensor::from_vec(vec![1.0f32, -2.0, 3.0, 0.5], &[2, 2], cpu()).unwrap();
        let mut out = Tensor::from_vec(vec![1.0f32; 4], &[2, 2], cpu()).unwrap();
        add_in_place(3.0, &x, -1.0, &mut out).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![2.0, -7.0, 8.0, 0.5]);
    }

    #[test]
    fn test_add_in_place_rejects_different_shapes() {
        let x = Tensor::<i32>::zeros(&[2, 3], cpu()).unwrap();
        let mut out = Tensor::<i32>::zeros(&[3, 2], cpu()).unwrap();
        let err = add_in_place(1, &x, 1, &mut out).unwrap_err();
        assert_eq!(
            err,
            GraphError::ShapeMismatch {
                expected: vec![3, 2],
                got: vec![2, 3]
            }
        );
    }
}
