// src/math/matmul.rs
use super::device_mismatch;
use crate::backend::{CudaNumeric, Storage, Tensor};
use crate::error::{GraphError, Result};

fn require_matrix(shape: &[usize], what: &'static str) -> Result<()> {
    if shape.len() != 2 {
        return Err(GraphError::UnsupportedRank {
            what,
            rank: shape.len(),
            expected: "2",
        });
    }
    Ok(())
}

/// Validates `C = op(A) * op(B)` and returns `(M, N, K)`. M and N come from C, K from
/// the shared dimension of op(A).
pub fn gemm_dims(
    a: &[usize],
    trans_a: bool,
    b: &[usize],
    trans_b: bool,
    c: &[usize],
) -> Result<(usize, usize, usize)> {
    require_matrix(a, "matmul operand A")?;
    require_matrix(b, "matmul operand B")?;
    require_matrix(c, "matmul output")?;

    let (m, n) = (c[0], c[1]);
    let (a_rows, k) = if trans_a { (a[1], a[0]) } else { (a[0], a[1]) };
    let (b_rows, b_cols) = if trans_b { (b[1], b[0]) } else { (b[0], b[1]) };
    if a_rows != m || b_rows != k || b_cols != n {
        return Err(GraphError::DimensionMismatch {
            a: a.to_vec(),
            trans_a,
            b: b.to_vec(),
            trans_b,
            c: c.to_vec(),
        });
    }
    Ok((m, n, k))
}

/// Shape of `op(A) * op(B)`.
pub fn matmul_output_shape(
    a: &[usize],
    trans_a: bool,
    b: &[usize],
    trans_b: bool,
) -> Result<Vec<usize>> {
    require_matrix(a, "matmul operand A")?;
    require_matrix(b, "matmul operand B")?;
    let m = if trans_a { a[1] } else { a[0] };
    let n = if trans_b { b[0] } else { b[1] };
    let c = [m, n];
    gemm_dims(a, trans_a, b, trans_b, &c)?;
    Ok(c.to_vec())
}

/// `C = alpha * op(A) * op(B) + beta * C` on row-major matrices. `op` transposes when
/// the matching flag is set; no transposed copy is ever materialised.
#[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
pub fn matmul<T: CudaNumeric>(
    alpha: T,
    trans_a: bool,
    a: &Tensor<T>,
    trans_b: bool,
    b: &Tensor<T>,
    beta: T,
    c: &mut Tensor<T>,
) -> Result<()> {
    let dims = gemm_dims(a.shape(), trans_a, b.shape(), trans_b, c.shape())?;
    let device = c.device();
    GraphError::check_device(device, a.device())?;
    GraphError::check_device(device, b.device())?;

    match (a.storage(), b.storage(), c.storage_mut()) {
        (Storage::Host(a), Storage::Host(b), Storage::Host(c)) => {
            c.gemm(alpha, trans_a, a, trans_b, b, beta)
        }
        #[cfg(feature = "cuda")]
        (Storage::Cuda(a), Storage::Cuda(b), Storage::Cuda(c)) => {
            crate::backend::with_cuda_ops(|ops| {
                ops.gemm(
                    alpha,
                    trans_a,
                    a.data(),
                    trans_b,
                    b.data(),
                    beta,
                    c.data_mut(),
                    dims,
                )
            })
        }
        #[allow(unreachable_patterns)]
        (a, _, _) => Err(device_mismatch(device, a)),
    }
}
