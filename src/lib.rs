//! # Ferrograd
//!
//! Ferrograd is the computation core of an automatic differentiation engine: a graph
//! of tensor operations evaluated lazily, a reverse-mode gradient pass over it, and a
//! numeric kernel layer that runs every operation either on the host (`ndarray`) or on
//! a CUDA device (`cudarc`, behind the `cuda` feature).
//!
//! ## Features
//!
//! - Arena-owned operation graph with memoized evaluation
//! - Reverse-mode gradients summed over every consumer of a node
//! - Elementwise add, matrix product with transpose flags, scalar sum
//! - 2D convolution (padding, stride, dilation, true convolution) and max/average pooling
//! - Kernels generic over `i32`, `f32` and `f64`
//!
//! ```
//! use ferrograd::{Engine, Fill, Conv2dParams};
//!
//! let mut engine: Engine<f32> = Engine::new();
//! let x = engine.tensor(&[1, 3, 8, 8], Fill::Uniform { low: -1.0, high: 1.0 }, false)?;
//! let w = engine.tensor(&[4, 3, 3, 3], Fill::Normal { mean: 0.0, std: 0.1 }, true)?;
//! let y = engine.conv2d(x, w, Conv2dParams::new().with_padding(1, 1), true)?;
//! let loss = engine.sum(y)?;
//!
//! let grads = engine.backward(loss)?;
//! assert_eq!(grads.get(w).map(|g| g.shape().to_vec()), Some(vec![4, 3, 3, 3]));
//! # Ok::<(), ferrograd::GraphError>(())
//! ```
pub mod backend;
pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod math;
pub mod ops;

// Re-export commonly used types for convenience
pub use backend::{CudaNumeric, Device, Fill, Numeric, Tensor, cpu, cuda, default_device};
pub use config::EngineConfig;
pub use error::{GraphError, Result};
pub use graph::{Engine, GradientTable, NodeId};
pub use math::{Conv2dParams, ConvMode, PoolParams, PoolingMode};
