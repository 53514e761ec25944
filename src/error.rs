// src/error.rs
use crate::backend::Device;
use crate::graph::NodeId;

/// Errors raised by the kernel layer and the graph engine.
///
/// Shape and dimension problems are detected when a node is built or first evaluated.
/// Device failures are never retried: the node that hit them is not created.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// Elementwise operands whose shapes differ.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// Matrix multiplication operands that do not agree on M, N or K.
    #[error(
        "matmul dimension mismatch: op(A) from {a:?} (trans={trans_a}), op(B) from {b:?} (trans={trans_b}), C {c:?}"
    )]
    DimensionMismatch {
        a: Vec<usize>,
        trans_a: bool,
        b: Vec<usize>,
        trans_b: bool,
        c: Vec<usize>,
    },

    /// Convolution input channels differ from the filter's input channels.
    #[error("filter channels ({filter}) must equal input channels ({input})")]
    ChannelMismatch { input: usize, filter: usize },

    /// Gradient requested with respect to a node that is not an input of `node`.
    #[error("{variable} is not an input of {node}")]
    InvalidVariable { node: NodeId, variable: NodeId },

    #[error("unsupported rank {rank} for {what}, expected {expected}")]
    UnsupportedRank {
        what: &'static str,
        rank: usize,
        expected: &'static str,
    },

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("node {0} has not been evaluated")]
    NotEvaluated(NodeId),

    #[error("device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: Device, got: Device },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// CUDA driver, cuBLAS or NVRTC failure.
    #[error("device error: {0}")]
    Device(String),
}

impl GraphError {
    pub fn device(msg: impl Into<String>) -> Self {
        GraphError::Device(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        GraphError::InvalidParameter(msg.into())
    }

    /// Shorthand used by the kernels to compare shapes.
    pub(crate) fn check_shape(expected: &[usize], got: &[usize]) -> Result<()> {
        if expected != got {
            return Err(GraphError::ShapeMismatch {
                expected: expected.to_vec(),
                got: got.to_vec(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_device(expected: Device, got: Device) -> Result<()> {
        if expected != got {
            return Err(GraphError::DeviceMismatch { expected, got });
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
