// src/graph/mod.rs
pub mod engine;
pub mod gradients;
pub mod node;

pub use engine::Engine;
pub use gradients::GradientTable;
pub use node::{Node, NodeId, NodeKind};

mod tests;
