// src/backend/storage/cuda.rs
use super::StorageBackend;
use crate::backend::{CudaNumeric, Device};
use cudarc::driver::{CudaSlice, DeviceSlice};

/// Device storage: a flat row-major buffer plus its logical shape.
#[derive(Clone)]
pub struct CUDAStorage<T: CudaNumeric> {
    pub data: CudaSlice<T>,
    shape: Vec<usize>,
    ordinal: usize,
}

impl<T: CudaNumeric> CUDAStorage<T> {
    pub fn new(data: CudaSlice<T>, shape: Vec<usize>, ordinal: usize) -> Self {
        Self {
            data,
            shape,
            ordinal,
        }
    }

    pub fn data(&self) -> &CudaSlice<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut CudaSlice<T> {
        &mut self.data
    }
}

impl<T: CudaNumeric> std::fmt::Debug for CUDAStorage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CUDAStorage")
            .field("shape", &self.shape)
            .field("ordinal", &self.ordinal)
            .field("len", &self.data.len())
            .finish()
    }
}

impl<T: CudaNumeric> StorageBackend<T> for CUDAStorage<T> {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn device(&self) -> Device {
        Device::CUDA(self.ordinal)
    }
}
