//! Error types for graph construction, differentiation and dual arithmetic.

use adjoint_core::CoreError;
use thiserror::Error;

/// Errors that can occur while building or differentiating a graph.
#[derive(Debug, Clone, Error)]
pub enum DiffError {
    /// Shape or arena failure from the core layer.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Array layout failure reported by ndarray.
    #[error("Array layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    /// A binary operation was recorded without its second operand.
    #[error("Operation {op} is missing an operand")]
    MissingOperand { op: &'static str },

    /// Division by a dual number whose real component is zero.
    #[error("Attempting to divide by zero")]
    DivideByZero,

    /// Differentiation requested for an argument that does not exist.
    #[error("Argument index {index} out of range for {len} arguments")]
    ArgumentOutOfRange { index: usize, len: usize },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DiffError>;
