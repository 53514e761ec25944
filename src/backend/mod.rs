// src/backend/mod.rs
pub mod device;
pub mod fill;
pub mod manager;
pub mod number;
pub mod storage;
pub mod tensor;

#[cfg(feature = "cuda")]
pub mod cuda;


pub use device::{Device, cpu, cuda, default_device};
pub use fill::Fill;
pub use number::{CudaNumeric, Numeric, NumericKind};
pub use storage::{CPUStorage, Storage, StorageBackend};
pub use tensor::Tensor;

#[cfg(feature = "cuda")]
pub use manager::{with_cuda_context, with_cuda_ops};
#[cfg(feature = "cuda")]
pub use storage::CUDAStorage;
