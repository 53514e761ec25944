// src/backend/number.rs

use ndarray::{LinalgScalar, ScalarOperand};
use rand_distr::num_traits::FromPrimitive;
use std::cmp::{PartialEq, PartialOrd};
use std::default::Default;
use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

// Import cudarc traits only when cuda feature is enabled
#[cfg(feature = "cuda")]
use cudarc::cublas::{CudaBlas, GemmConfig};
#[cfg(feature = "cuda")]
use cudarc::driver::{DevicePtr, DevicePtrMut, DeviceRepr, ValidAsZeroBits};

/// Element kinds supported by the kernels.
/// The suffix selects the device kernel instantiation (`add_in_place_f32`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericKind {
    Int32,
    Float32,
    Float64,
}

impl NumericKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            NumericKind::Int32 => "i32",
            NumericKind::Float32 => "f32",
            NumericKind::Float64 => "f64",
        }
    }

    pub fn is_float(&self) -> bool {
        !matches!(self, NumericKind::Int32)
    }
}

/// Base trait for every element type a tensor can hold.
/// Arithmetic, `zero()` and `one()` come from `LinalgScalar`, conversions from
/// `FromPrimitive`. Implemented for i32, f32 and f64.
pub trait Numeric:
    LinalgScalar
    + ScalarOperand
    + FromPrimitive
    + AddAssign + SubAssign + MulAssign + DivAssign
    + Sum<Self>
    + PartialOrd + PartialEq
    + Debug + Display + Default
    + Send + Sync
{
    const KIND: NumericKind;

    /// Smallest finite value, used as the identity for max reductions.
    fn lowest() -> Self;

    /// Lossy conversion used by tests and tolerance checks.
    fn to_f64(self) -> f64;

    /// Converts a count into the element type. Counts used by the kernels are small,
    /// so this only fails for absurd window sizes.
    fn from_count(n: usize) -> Self {
        <Self as FromPrimitive>::from_usize(n).unwrap_or_else(Self::one)
    }

    /// Addition used by the host accumulation kernels. Integers wrap on overflow, the
    /// same as the device kernels.
    fn wrapping_add(self, rhs: Self) -> Self {
        self + rhs
    }

    fn wrapping_mul(self, rhs: Self) -> Self {
        self * rhs
    }
}

impl Numeric for f64 {
    const KIND: NumericKind = NumericKind::Float64;

    fn lowest() -> Self {
        f64::MIN
    }

    fn to_f64(self) -> f64 {
        self
    }
}

impl Numeric for f32 {
    const KIND: NumericKind = NumericKind::Float32;

    fn lowest() -> Self {
        f32::MIN
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Numeric for i32 {
    const KIND: NumericKind = NumericKind::Int32;

    fn lowest() -> Self {
        i32::MIN
    }

    fn wrapping_add(self, rhs: Self) -> Self {
        i32::wrapping_add(self, rhs)
    }

    fn wrapping_mul(self, rhs: Self) -> Self {
        i32::wrapping_mul(self, rhs)
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

// ============= GPU TRAIT DEFINITIONS =============

/// Element types usable on the device as well as on the host.
/// Every generic type in the graph is bounded on this trait so the same code compiles
/// with and without the `cuda` feature.
#[cfg(feature = "cuda")]
pub trait CudaNumeric: Numeric + DeviceRepr + ValidAsZeroBits + Unpin {
    /// Column-major GEMM on the cuBLAS handle. Callers are responsible for the
    /// row-major operand swap.
    fn gemm<A, B, C>(
        blas: &CudaBlas,
        cfg: GemmConfig<Self>,
        a: &A,
        b: &B,
        c: &mut C,
    ) -> Result<(), String>
    where
        A: DevicePtr<Self>,
        B: DevicePtr<Self>,
        C: DevicePtrMut<Self>;
}

/// When CUDA is not available, CudaNumeric is just an alias for Numeric
#[cfg(not(feature = "cuda"))]
pub trait CudaNumeric: Numeric {}

#[cfg(not(feature = "cuda"))]
impl CudaNumeric for f32 {}
#[cfg(not(feature = "cuda"))]
impl CudaNumeric for f64 {}
#[cfg(not(feature = "cuda"))]
impl CudaNumeric for i32 {}

#[cfg(feature = "cuda")]
impl CudaNumeric for f32 {
    fn gemm<A, B, C>(
        blas: &CudaBlas,
        cfg: GemmConfig<Self>,
        a: &A,
        b: &B,
        c: &mut C,
    ) -> Result<(), String>
    where
        A: DevicePtr<Self>,
        B: DevicePtr<Self>,
        C: DevicePtrMut<Self>,
    {
        use cudarc::cublas::Gemm;
        // Safety: the caller validated m, n, k and the leading dimensions against the
        // buffer lengths.
        unsafe { blas.gemm(cfg, a, b, c) }.map_err(|e| format!("cuBLAS sgemm failed: {e}"))
    }
}

#[cfg(feature = "cuda")]
impl CudaNumeric for f64 {
    fn gemm<A, B, C>(
        blas: &CudaBlas,
        cfg: GemmConfig<Self>,
        a: &A,
        b: &B,
        c: &mut C,
    ) -> Result<(), String>
    where
        A: DevicePtr<Self>,
        B: DevicePtr<Self>,
        C: DevicePtrMut<Self>,
    {
        use cudarc::cublas::Gemm;
        // Safety: see the f32 implementation.
        unsafe { blas.gemm(cfg, a, b, c) }.map_err(|e| format!("cuBLAS dgemm failed: {e}"))
    }
}

#[cfg(feature = "cuda")]
impl CudaNumeric for i32 {
    fn gemm<A, B, C>(
        _blas: &CudaBlas,
        _cfg: GemmConfig<Self>,
        _a: &A,
        _b: &B,
        _c: &mut C,
    ) -> Result<(), String>
    where
        A: DevicePtr<Self>,
        B: DevicePtr<Self>,
        C: DevicePtrMut<Self>,
    {
        Err("cuBLAS has no integer GEMM".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_suffixes() {
        assert_eq!(<f32 as Numeric>::KIND.suffix(), "f32");
        assert_eq!(<f64 as Numeric>::KIND.suffix(), "f64");
        assert_eq!(<i32 as Numeric>::KIND.suffix(), "i32");
        assert!(!<i32 as Numeric>::KIND.is_float());
    }

    #[test]
    fn test_integer_arithmetic_wraps() {
        assert_eq!(Numeric::wrapping_add(i32::MAX, 1), i32::MIN);
        assert_eq!(Numeric::wrapping_mul(i32::MAX, 2), -2);
        assert_eq!(Numeric::wrapping_add(1.5f32, 2.0), 3.5);
    }

    #[test]
    fn test_from_count() {
        assert_eq!(f32::from_count(9), 9.0);
        assert_eq!(i32::from_count(4), 4);
        assert_eq!(f64::lowest(), f64::MIN);
    }
}
