// src/backend/cuda/workspace.rs
use super::context::CudaContextManager;
use crate::backend::CudaNumeric;
use crate::error::Result;
use cudarc::driver::{CudaSlice, DeviceSlice};

/// Scratch buffers of one convolution node, one per pass. Each holds the column
/// matrix `[C*Kh*Kw, Ho*Wo]` of a single image. Owned by exactly one node and freed
/// with it.
pub struct ConvWorkspace<T: CudaNumeric> {
    pub forward: CudaSlice<T>,
    pub grad_data: CudaSlice<T>,
    pub grad_filter: CudaSlice<T>,
}

impl<T: CudaNumeric> ConvWorkspace<T> {
    pub fn allocate(ctx: &CudaContextManager<T>, elements: usize) -> Result<Self> {
        let workspace = Self {
            forward: ctx.alloc_zeros(elements)?,
            grad_data: ctx.alloc_zeros(elements)?,
            grad_filter: ctx.alloc_zeros(elements)?,
        };
        tracing::debug!(bytes = workspace.bytes(), "convolution workspace allocated");
        Ok(workspace)
    }

    pub fn bytes(&self) -> usize {
        (self.forward.len() + self.grad_data.len() + self.grad_filter.len())
            * std::mem::size_of::<T>()
    }
}

impl<T: CudaNumeric> Drop for ConvWorkspace<T> {
    fn drop(&mut self) {
        tracing::debug!(bytes = self.bytes(), "convolution workspace released");
    }
}

impl<T: CudaNumeric> std::fmt::Debug for ConvWorkspace<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvWorkspace")
            .field("bytes", &self.bytes())
            .finish()
    }
}
