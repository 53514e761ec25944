// src/backend/storage/cpu.rs
use super::StorageBackend;
use crate::backend::{CudaNumeric, Device};
use crate::error::{GraphError, Result};
use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayD, ArrayView2, ArrayViewMut2, Ix2, IxDyn, Zip};

/// Host storage. The array is always kept in standard (row-major, contiguous) layout
/// so the kernels can work on flat slices.
#[derive(Debug, Clone)]
pub struct CPUStorage<T: CudaNumeric> {
    data: ArrayD<T>,
}

impl<T: CudaNumeric> CPUStorage<T> {
    pub fn new(data: ArrayD<T>) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Self { data }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(shape)),
        }
    }

    pub fn from_vec(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(GraphError::invalid(format!(
                "{} values cannot fill shape {:?} ({} elements)",
                data.len(),
                shape,
                expected
            )));
        }
        let data = ArrayD::from_shape_vec(IxDyn(shape), data)
            .map_err(|e| GraphError::invalid(e.to_string()))?;
        Ok(Self { data })
    }

    pub fn array_ref(&self) -> &ArrayD<T> {
        &self.data
    }

    pub fn array_mut(&mut self) -> &mut ArrayD<T> {
        &mut self.data
    }

    pub fn as_slice(&self) -> Result<&[T]> {
        self.data
            .as_slice()
            .ok_or_else(|| GraphError::invalid("host buffer is not contiguous"))
    }

    pub fn as_slice_mut(&mut self) -> Result<&mut [T]> {
        self.data
            .as_slice_mut()
            .ok_or_else(|| GraphError::invalid("host buffer is not contiguous"))
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.data.iter().copied().collect()
    }

    /// Two-dimensional view, used by the GEMM path.
    pub fn matrix(&self) -> Result<ArrayView2<'_, T>> {
        self.data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| GraphError::UnsupportedRank {
                what: "matmul operand",
                rank: self.data.ndim(),
                expected: "2",
            })
    }

    pub fn matrix_mut(&mut self) -> Result<ArrayViewMut2<'_, T>> {
        let rank = self.data.ndim();
        self.data
            .view_mut()
            .into_dimensionality::<Ix2>()
            .map_err(|_| GraphError::UnsupportedRank {
                what: "matmul output",
                rank,
                expected: "2",
            })
    }

    // ------- host kernels -------

    /// `self = alpha * x + beta * self`. With `beta == 0` the previous contents are
    /// ignored, so uninitialised outputs never leak NaNs into the result.
    pub fn add_in_place(&mut self, alpha: T, x: &CPUStorage<T>, beta: T) -> Result<()> {
        GraphError::check_shape(self.shape(), x.shape())?;
        if beta == T::zero() {
            Zip::from(&mut self.data)
                .and(&x.data)
                .for_each(|out, &v| *out = alpha.wrapping_mul(v));
        } else {
            Zip::from(&mut self.data)
                .and(&x.data)
                .for_each(|out, &v| {
                    *out = alpha.wrapping_mul(v).wrapping_add(beta.wrapping_mul(*out))
                });
        }
        Ok(())
    }

    /// `self = alpha * op(a) * op(b) + beta * self` on row-major matrices. The
    /// transposes are strided views, nothing is copied.
    pub fn gemm(
        &mut self,
        alpha: T,
        trans_a: bool,
        a: &CPUStorage<T>,
        trans_b: bool,
        b: &CPUStorage<T>,
        beta: T,
    ) -> Result<()> {
        let a = a.matrix()?;
        let b = b.matrix()?;
        let a = if trans_a { a.reversed_axes() } else { a };
        let b = if trans_b { b.reversed_axes() } else { b };
        let mut c = self.matrix_mut()?;
        if beta == T::zero() {
            c.fill(T::zero());
        }
        general_mat_mul(alpha, &a, &b, beta, &mut c);
        Ok(())
    }

    /// Sum of every element, written into the single cell of `self`.
    pub fn sum_from(&mut self, x: &CPUStorage<T>) -> Result<()> {
        if self.size() != 1 {
            return Err(GraphError::ShapeMismatch {
                expected: vec![1],
                got: self.shape().to_vec(),
            });
        }
        let total = x
            .data
            .iter()
            .fold(T::zero(), |acc, &v| acc.wrapping_add(v));
        self.data.fill(total);
        Ok(())
    }

    /// Fills `self` with `alpha * src[0]`.
    pub fn broadcast_scalar(&mut self, alpha: T, src: &CPUStorage<T>) -> Result<()> {
        let value = src
            .data
            .iter()
            .next()
            .copied()
            .ok_or_else(|| GraphError::invalid("cannot broadcast from an empty tensor"))?;
        self.data.fill(alpha.wrapping_mul(value));
        Ok(())
    }
}

impl<T: CudaNumeric> StorageBackend<T> for CPUStorage<T> {
    fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    fn device(&self) -> Device {
        Device::CPU
    }
}
