// src/backend/cuda/mod.rs
pub mod context;
pub mod kernels;
pub mod ops;
pub mod stream_manager;
pub mod workspace;

pub use context::CudaContextManager;
pub use kernels::KernelManager;
pub use ops::CudaOps;
pub use stream_manager::StreamManager;
pub use workspace::ConvWorkspace;
