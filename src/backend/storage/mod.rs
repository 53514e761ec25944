// src/backend/storage/mod.rs
mod cpu;
#[cfg(feature = "cuda")]
mod cuda;
mod extensions;

pub use cpu::CPUStorage;
#[cfg(feature = "cuda")]
pub use cuda::CUDAStorage;

use crate::backend::{CudaNumeric, Device};
use std::fmt::Debug;

/// Queries shared by every storage implementation.
pub trait StorageBackend<T: CudaNumeric>: Debug {
    /// Get tensor shape
    fn shape(&self) -> &[usize];

    /// Get number of dimensions
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Get total number of elements
    fn size(&self) -> usize {
        self.shape().iter().product()
    }

    /// Memory location of the buffer.
    fn device(&self) -> Device;
}

/// Owned buffer of a tensor. The variant is the memory-location tag the kernel layer
/// dispatches on.
#[derive(Debug, Clone)]
pub enum Storage<T: CudaNumeric> {
    Host(CPUStorage<T>),
    #[cfg(feature = "cuda")]
    Cuda(CUDAStorage<T>),
}

impl<T: CudaNumeric> StorageBackend<T> for Storage<T> {
    fn shape(&self) -> &[usize] {
        match self {
            Storage::Host(s) => s.shape(),
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => s.shape(),
        }
    }

    fn device(&self) -> Device {
        match self {
            Storage::Host(s) => s.device(),
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => s.device(),
        }
    }
}
