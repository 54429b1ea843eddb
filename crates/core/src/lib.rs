//! # Core - Shapes and Computation Graphs
//!
//! This crate provides the structural foundations for adjoint:
//!
//! - **Shapes**: runtime tensor dimensions and broadcasting rules
//! - **Errors**: shape and graph failures as first-class values
//! - **Diagrams**: an append-only arena of named nodes wired by operand ports
//!
//! ## Design Philosophy
//!
//! The arena never hands out references between nodes, only `NodeIndex`
//! handles into older slots. Sharing a node between many consumers is just
//! copying its handle, and a cycle cannot be expressed.

pub mod diagram;
pub mod error;
pub mod shape;

// Re-export key types at crate root for convenience
pub use diagram::{Diagram, Edge, Node};
pub use error::CoreError;
pub use petgraph::graph::NodeIndex;
pub use shape::Shape;
