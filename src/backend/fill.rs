// src/backend/fill.rs
use crate::backend::CudaNumeric;
use crate::error::{GraphError, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

/// How a freshly allocated tensor is populated.
///
/// Random fills are sampled in `f64` on the host and converted to the element type,
/// so integer tensors receive truncated samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fill<T> {
    Zeros,
    Constant(T),
    /// Uniform samples in `[low, high)`.
    Uniform { low: T, high: T },
    Normal { mean: T, std: T },
}

impl<T: CudaNumeric> Fill<T> {
    pub fn ones() -> Self {
        Fill::Constant(T::one())
    }

    /// Host values for `len` elements.
    pub fn sample<R: Rng + ?Sized>(&self, len: usize, rng: &mut R) -> Result<Vec<T>> {
        match *self {
            Fill::Zeros => Ok(vec![T::zero(); len]),
            Fill::Constant(value) => Ok(vec![value; len]),
            Fill::Uniform { low, high } => {
                let dist = Uniform::new(low.to_f64(), high.to_f64()).map_err(|e| {
                    GraphError::invalid(format!("uniform fill [{low}, {high}): {e}"))
                })?;
                convert_samples(dist.sample_iter(rng).take(len))
            }
            Fill::Normal { mean, std } => {
                let dist = Normal::new(mean.to_f64(), std.to_f64())
                    .map_err(|e| GraphError::invalid(format!("normal fill ({mean}, {std}): {e}")))?;
                convert_samples(dist.sample_iter(rng).take(len))
            }
        }
    }
}

fn convert_samples<T: CudaNumeric>(samples: impl Iterator<Item = f64>) -> Result<Vec<T>> {
    samples
        .map(|v| {
            T::from_f64(v).ok_or_else(|| {
                GraphError::invalid(format!("sample {v} not representable as {}", T::KIND.suffix()))
            })
        })
        .collect()
}
