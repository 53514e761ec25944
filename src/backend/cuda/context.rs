// src/backend/cuda/context.rs
use super::kernels::KernelManager;
use super::ops::CudaOps;
use super::stream_manager::{COMPUTE_STREAM, StreamManager};
use crate::backend::CudaNumeric;
use crate::error::{GraphError, Result};
use cudarc::driver::{CudaContext, CudaSlice, CudaStream, DeviceSlice};
use std::sync::Arc;

/// Execution context of one CUDA device for element type `T`. The compute stream keeps
/// the driver context alive; `CudaOps` holds the cuBLAS handle and compiled kernels.
pub struct CudaContextManager<T: CudaNumeric> {
    ordinal: usize,
    stream_manager: StreamManager,
    ops: CudaOps<T>,
}

impl<T: CudaNumeric> CudaContextManager<T> {
    pub fn new() -> Result<Self> {
        Self::from_device_id(0)
    }

    pub fn from_device_id(ordinal: usize) -> Result<Self> {
        let ctx = CudaContext::new(ordinal)
            .map_err(|e| GraphError::device(format!("CUDA init error: {e}")))?;
        let stream_manager = StreamManager::new();
        let stream = stream_manager.create_stream(&ctx, COMPUTE_STREAM)?;
        let kernels = KernelManager::load(&ctx)?;
        let ops = CudaOps::new(stream, kernels)?;

        Ok(Self {
            ordinal,
            stream_manager,
            ops,
        })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        self.ops.stream()
    }

    pub fn ops(&self) -> &CudaOps<T> {
        &self.ops
    }

    /// Allocates zeroed memory on the compute stream.
    pub fn alloc_zeros(&self, len: usize) -> Result<CudaSlice<T>> {
        self.alloc_zeros_of::<T>(len)
    }

    /// Zeroed buffer of another element type, ordered with this type's kernels.
    pub fn alloc_zeros_of<U: CudaNumeric>(&self, len: usize) -> Result<CudaSlice<U>> {
        self.stream()
            .alloc_zeros::<U>(len)
            .map_err(|e| GraphError::device(format!("allocation of {len} elements failed: {e}")))
    }

    pub fn host_to_device(&self, data: &[T]) -> Result<CudaSlice<T>> {
        let mut buffer = self.alloc_zeros(data.len())?;
        self.stream()
            .memcpy_htod(data, &mut buffer)
            .map_err(|e| GraphError::device(format!("host to device transfer failed: {e}")))?;
        Ok(buffer)
    }

    /// Copies device data back. The copy is queued on the compute stream, so it waits
    /// for pending kernels, and the call blocks until the data has arrived.
    pub fn device_to_host(&self, data: &CudaSlice<T>) -> Result<Vec<T>> {
        let mut host = vec![T::default(); data.len()];
        self.stream()
            .memcpy_dtoh(data, &mut host)
            .map_err(|e| GraphError::device(format!("device to host transfer failed: {e}")))?;
        self.synchronize()?;
        Ok(host)
    }

    pub fn device_to_device(&self, data: &CudaSlice<T>) -> Result<CudaSlice<T>> {
        let mut buffer = self.alloc_zeros(data.len())?;
        self.stream()
            .memcpy_dtod(data, &mut buffer)
            .map_err(|e| GraphError::device(format!("device to device copy failed: {e}")))?;
        Ok(buffer)
    }

    /// Blocks until the compute stream is idle.
    pub fn synchronize(&self) -> Result<()> {
        self.stream_manager.sync_stream(COMPUTE_STREAM)
    }
}
