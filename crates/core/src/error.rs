//! # Error Types
//!
//! Errors at this layer are structural: an operation was asked to combine
//! values whose shapes do not fit together, or a graph was asked to link
//! to a node it does not contain. Both are undefined operations rather than
//! transient faults, so nothing here is retried.

use thiserror::Error;

use crate::shape::Shape;

/// Core errors for shapes and the graph arena.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// Shapes don't match where they must be identical.
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Shapes cannot be broadcast together.
    #[error("Cannot broadcast shapes {lhs} and {rhs}")]
    BroadcastMismatch { lhs: Shape, rhs: Shape },

    /// Axis is out of range for the operand's rank.
    #[error("Axis {axis} out of range for rank {rank}")]
    InvalidAxis { axis: usize, rank: usize },

    /// Reshape would change the element count.
    #[error("Cannot reshape {from} into {to}")]
    InvalidReshape { from: Shape, to: Shape },

    /// Inner dimensions of a product don't agree.
    #[error("Cannot contract {lhs} with {rhs}")]
    ContractionMismatch { lhs: Shape, rhs: Shape },

    /// Operation is not defined for an operand of this rank.
    #[error("{op} is not defined for rank {rank}")]
    RankMismatch { op: &'static str, rank: usize },

    /// Reduction over an empty array has no identity.
    #[error("Cannot reduce an empty array")]
    EmptyReduction,

    /// Handle does not name a node in this graph.
    #[error("Unknown node: {index}")]
    UnknownNode { index: usize },

    /// A node with this name already exists.
    #[error("Duplicate node name: '{name}'")]
    DuplicateName { name: String },
}
