// src/ops/matrix.rs
use super::Operator;
use crate::backend::{CudaNumeric, Tensor};
use crate::error::{GraphError, Result};
use crate::math::{matmul, matmul_output_shape};

/// `C = op(A) * op(B)` with optional transposition of either operand.
///
/// The gradients reuse the transpose flags of the kernel, so no transposed copy of
/// any operand or of the upstream gradient is ever made. With `G = dL/dC`:
///
/// | flags      | dA                 | dB                 |
/// |------------|--------------------|--------------------|
/// | A, B       | G * B^T            | A^T * G            |
/// | A^T, B     | B * G^T            | A * G              |
/// | A, B^T     | G * B              | G^T * A            |
/// | A^T, B^T   | B^T * G^T          | G^T * A^T          |
#[derive(Debug, Clone, Default)]
pub struct MatMul {
    trans_a: bool,
    trans_b: bool,
}

impl MatMul {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transposes(trans_a: bool, trans_b: bool) -> Self {
        Self { trans_a, trans_b }
    }

    pub fn trans_a(&self) -> bool {
        self.trans_a
    }

    pub fn trans_b(&self) -> bool {
        self.trans_b
    }
}

impl<T: CudaNumeric> Operator<T> for MatMul {
    fn output_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        matmul_output_shape(inputs[0], self.trans_a, inputs[1], self.trans_b)
    }

    fn compute(&mut self, inputs: &[&Tensor<T>], output: &mut Tensor<T>) -> Result<()> {
        matmul(
            T::one(),
            self.trans_a,
            inputs[0],
            self.trans_b,
            inputs[1],
            T::zero(),
            output,
        )
    }

    fn gradient(
        &mut self,
        index: usize,
        inputs: &[&Tensor<T>],
        _output: &Tensor<T>,
        upstream: &Tensor<T>,
        grad: &mut Tensor<T>,
    ) -> Result<()> {
        let (a, b, g) = (inputs[0], inputs[1], upstream);
        let (one, zero) = (T::one(), T::zero());
        match (index, self.trans_a, self.trans_b) {
            (0, false, tb) => matmul(one, false, g, !tb, b, zero, grad),
            (0, true, tb) => matmul(one, tb, b, true, g, zero, grad),
            (1, ta, false) => matmul(one, !ta, a, false, g, zero, grad),
            (1, ta, true) => matmul(one, true, g, ta, a, zero, grad),
            _ => Err(GraphError::invalid(format!("MatMul has no input {index}"))),
        }
    }

    fn num_inputs(&self) -> usize {
        2
    }
}
