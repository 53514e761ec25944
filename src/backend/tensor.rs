// src/backend/tensor.rs
use crate::backend::fill::Fill;
use crate::backend::storage::{CPUStorage, Storage, StorageBackend};
use crate::backend::{CudaNumeric, Device};
use crate::error::{GraphError, Result};
use ndarray::ArrayD;
use rand::Rng;

#[cfg(feature = "cuda")]
use crate::backend::manager::with_cuda_context;
#[cfg(feature = "cuda")]
use crate::backend::storage::CUDAStorage;

/// Dense row-major tensor. The memory location is fixed at construction; kernels
/// write into caller-provided tensors in place.
#[derive(Debug, Clone)]
pub struct Tensor<T: CudaNumeric> {
    storage: Storage<T>,
}

impl<T: CudaNumeric> Tensor<T> {
    /// Allocates a tensor filled according to `fill`, sampling with the thread RNG.
    pub fn new(shape: &[usize], fill: Fill<T>, device: Device) -> Result<Self> {
        Self::new_with_rng(shape, fill, device, &mut rand::rng())
    }

    pub fn new_with_rng<R: Rng + ?Sized>(
        shape: &[usize],
        fill: Fill<T>,
        device: Device,
        rng: &mut R,
    ) -> Result<Self> {
        match fill {
            Fill::Zeros => Self::zeros(shape, device),
            Fill::Constant(value) => Self::full(shape, value, device),
            random => {
                let len = shape.iter().product();
                Self::from_vec(random.sample(len, rng)?, shape, device)
            }
        }
    }

    pub fn zeros(shape: &[usize], device: Device) -> Result<Self> {
        let storage = match device {
            Device::CPU => Storage::Host(CPUStorage::zeros(shape)),
            Device::CUDA(_) => Self::device_zeros_on::<T>(shape, device)?,
        };
        Ok(Self { storage })
    }

    /// Like `zeros`, but a device buffer is allocated on the compute stream of element
    /// type `S`. For buffers that only `S` kernels write, such as pooling positions.
    pub(crate) fn zeros_for<S: CudaNumeric>(shape: &[usize], device: Device) -> Result<Self> {
        let storage = match device {
            Device::CPU => Storage::Host(CPUStorage::zeros(shape)),
            Device::CUDA(_) => Self::device_zeros_on::<S>(shape, device)?,
        };
        Ok(Self { storage })
    }

    pub fn full(shape: &[usize], value: T, device: Device) -> Result<Self> {
        let mut tensor = Self::zeros(shape, device)?;
        if value != T::zero() {
            tensor.fill(value)?;
        }
        Ok(tensor)
    }

    pub fn ones(shape: &[usize], device: Device) -> Result<Self> {
        Self::full(shape, T::one(), device)
    }

    pub fn from_vec(data: Vec<T>, shape: &[usize], device: Device) -> Result<Self> {
        let host = CPUStorage::from_vec(data, shape)?;
        Self::from_storage(Storage::Host(host)).to_device(device)
    }

    /// Wraps a host array. Non-contiguous arrays are copied into standard layout.
    pub fn from_array(array: ArrayD<T>) -> Self {
        Self {
            storage: Storage::Host(CPUStorage::new(array)),
        }
    }

    pub(crate) fn from_storage(storage: Storage<T>) -> Self {
        Self { storage }
    }

    /// Zeroed tensor with the same shape and device.
    pub fn zeros_like(&self) -> Result<Self> {
        Self::zeros(self.shape(), self.device())
    }

    pub fn shape(&self) -> &[usize] {
        self.storage.shape()
    }

    pub fn ndim(&self) -> usize {
        self.storage.ndim()
    }

    pub fn size(&self) -> usize {
        self.storage.size()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn storage(&self) -> &Storage<T> {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut Storage<T> {
        &mut self.storage
    }

    /// Host array, if the tensor lives on the host.
    pub fn host_data(&self) -> Result<&ArrayD<T>> {
        match &self.storage {
            Storage::Host(s) => Ok(s.array_ref()),
            #[allow(unreachable_patterns)]
            _ => Err(GraphError::DeviceMismatch {
                expected: Device::CPU,
                got: self.device(),
            }),
        }
    }

    /// Contents in row-major order. Device data is copied back synchronously.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        match &self.storage {
            Storage::Host(s) => Ok(s.to_vec()),
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => with_cuda_context(|ctx| ctx.device_to_host(s.data())),
        }
    }

    /// Copy of this tensor on `device`. Copies even when the device is unchanged.
    pub fn to_device(&self, device: Device) -> Result<Self> {
        match (&self.storage, device) {
            (Storage::Host(s), Device::CPU) => Ok(Self::from_storage(Storage::Host(s.clone()))),
            #[cfg(feature = "cuda")]
            (Storage::Host(s), Device::CUDA(_)) => {
                crate::backend::manager::validate_device::<T>(device)?;
                let values = s.to_vec();
                let storage = with_cuda_context(|ctx| {
                    let buffer = ctx.host_to_device(&values)?;
                    Ok(CUDAStorage::new(buffer, s.shape().to_vec(), ctx.ordinal()))
                })?;
                Ok(Self::from_storage(Storage::Cuda(storage)))
            }
            #[cfg(feature = "cuda")]
            (Storage::Cuda(s), Device::CPU) => {
                let values = with_cuda_context(|ctx| ctx.device_to_host(s.data()))?;
                Ok(Self::from_storage(Storage::Host(CPUStorage::from_vec(
                    values,
                    s.shape(),
                )?)))
            }
            #[cfg(feature = "cuda")]
            (Storage::Cuda(s), Device::CUDA(_)) => {
                crate::backend::manager::validate_device::<T>(device)?;
                let storage = with_cuda_context(|ctx| {
                    let buffer = ctx.device_to_device(s.data())?;
                    Ok(CUDAStorage::new(buffer, s.shape().to_vec(), ctx.ordinal()))
                })?;
                Ok(Self::from_storage(Storage::Cuda(storage)))
            }
            #[cfg(not(feature = "cuda"))]
            (Storage::Host(_), Device::CUDA(_)) => {
                Self::device_zeros_on::<T>(self.shape(), device).map(Self::from_storage)
            }
        }
    }

    /// Overwrites every element with `value`.
    pub fn fill(&mut self, value: T) -> Result<()> {
        match &mut self.storage {
            Storage::Host(s) => {
                s.array_mut().fill(value);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => {
                crate::backend::manager::with_cuda_ops(|ops| ops.fill(value, s.data_mut()))
            }
        }
    }

    #[cfg(feature = "cuda")]
    fn device_zeros_on<S: CudaNumeric>(shape: &[usize], device: Device) -> Result<Storage<T>> {
        crate::backend::manager::validate_device::<S>(device)?;
        let len = shape.iter().product();
        with_cuda_context::<S, _, _>(|ctx| {
            let buffer = ctx.alloc_zeros_of::<T>(len)?;
            Ok(Storage::Cuda(CUDAStorage::new(
                buffer,
                shape.to_vec(),
                ctx.ordinal(),
            )))
        })
    }

    #[cfg(not(feature = "cuda"))]
    fn device_zeros_on<S: CudaNumeric>(_shape: &[usize], device: Device) -> Result<Storage<T>> {
        crate::backend::manager::validate_device::<S>(device)?;
        Err(GraphError::Unsupported(format!("allocation on {device}")))
    }
}
