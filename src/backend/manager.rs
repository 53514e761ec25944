// src/backend/manager.rs
use crate::backend::Device;
use crate::backend::number::{CudaNumeric, NumericKind};
use crate::error::{GraphError, Result};
use std::any::Any;
use std::sync::OnceLock;

#[cfg(feature = "cuda")]
use crate::backend::cuda::CudaContextManager;

/// Process-wide backend state for one element type. Created lazily on first use.
pub struct BackendManager<T: CudaNumeric> {
    #[cfg(feature = "cuda")]
    cuda_backend: Option<CudaContextManager<T>>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: CudaNumeric> Default for BackendManager<T> {
    fn default() -> Self {
        Self::init()
    }
}

impl<T: CudaNumeric> BackendManager<T> {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "cuda")]
            cuda_backend: None,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Tries to bring up the CUDA context; falls back to host-only when the feature is
    /// off or no device is usable.
    pub fn init() -> Self {
        #[cfg(not(feature = "cuda"))]
        {
            tracing::debug!(kind = T::KIND.suffix(), "CUDA feature not enabled, using CPU only");
            Self::new()
        }

        #[cfg(feature = "cuda")]
        {
            let mut manager = Self::new();
            match CudaContextManager::<T>::new() {
                Ok(cuda_backend) => {
                    tracing::info!(kind = T::KIND.suffix(), "CUDA backend initialized");
                    manager.cuda_backend = Some(cuda_backend);
                }
                Err(e) => {
                    tracing::warn!(kind = T::KIND.suffix(), error = %e, "CUDA backend not available, using CPU only");
                }
            }
            manager
        }
    }

    pub fn has_cuda(&self) -> bool {
        #[cfg(feature = "cuda")]
        {
            self.cuda_backend.is_some()
        }
        #[cfg(not(feature = "cuda"))]
        {
            false
        }
    }

    #[cfg(feature = "cuda")]
    pub fn cuda_backend(&self) -> Option<&CudaContextManager<T>> {
        self.cuda_backend.as_ref()
    }

    /// Validate device is available and return it
    pub fn validate_device(&self, device: Device) -> Result<Device> {
        match device {
            Device::CPU => Ok(device),
            Device::CUDA(0) if self.has_cuda() => Ok(device),
            Device::CUDA(0) if cfg!(feature = "cuda") => Err(GraphError::device(
                "CUDA device requested but CUDA not available",
            )),
            Device::CUDA(0) => Err(GraphError::Unsupported(
                "CUDA device requested but the crate was built without the `cuda` feature"
                    .to_string(),
            )),
            Device::CUDA(id) => Err(GraphError::Unsupported(format!(
                "only CUDA:0 is managed, got CUDA:{id}"
            ))),
        }
    }
}

static BACKEND_F32: OnceLock<BackendManager<f32>> = OnceLock::new();
static BACKEND_F64: OnceLock<BackendManager<f64>> = OnceLock::new();
static BACKEND_I32: OnceLock<BackendManager<i32>> = OnceLock::new();

/// Global backend for `T`. The per-type statics are selected by `NumericKind` and
/// recovered through `Any`, so no unsafe casts are involved.
pub fn get_backend<T: CudaNumeric>() -> Result<&'static BackendManager<T>> {
    let backend: &'static dyn Any = match T::KIND {
        NumericKind::Float32 => BACKEND_F32.get_or_init(BackendManager::init),
        NumericKind::Float64 => BACKEND_F64.get_or_init(BackendManager::init),
        NumericKind::Int32 => BACKEND_I32.get_or_init(BackendManager::init),
    };
    backend
        .downcast_ref::<BackendManager<T>>()
        .ok_or_else(|| GraphError::Unsupported(format!("no backend for {}", T::KIND.suffix())))
}

pub fn has_cuda<T: CudaNumeric>() -> bool {
    get_backend::<T>().map(|b| b.has_cuda()).unwrap_or(false)
}

pub fn validate_device<T: CudaNumeric>(device: Device) -> Result<Device> {
    get_backend::<T>()?.validate_device(device)
}

/// Runs `f` with the CUDA context of `T`.
#[cfg(feature = "cuda")]
pub fn with_cuda_context<T, F, R>(f: F) -> Result<R>
where
    T: CudaNumeric,
    F: FnOnce(&CudaContextManager<T>) -> Result<R>,
{
    let ctx = get_backend::<T>()?
        .cuda_backend()
        .ok_or_else(|| GraphError::device("CUDA backend not available"))?;
    f(ctx)
}

/// Runs `f` with the device kernels of `T`.
#[cfg(feature = "cuda")]
pub fn with_cuda_ops<T, F, R>(f: F) -> Result<R>
where
    T: CudaNumeric,
    F: FnOnce(&crate::backend::cuda::CudaOps<T>) -> Result<R>,
{
    with_cuda_context(|ctx: &CudaContextManager<T>| f(ctx.ops()))
}
