//! # Diff - Define-by-Run Reverse-Mode Differentiation
//!
//! This crate records computations over n-dimensional arrays as they run and
//! differentiates them backward from a single output.
//!
//! ## Core Concepts
//!
//! - **Eager graphs**: every builder computes its value immediately and
//!   appends a node remembering its operands
//! - **Closed rule table**: each operation kind maps an incoming adjoint to
//!   per-operand contributions
//! - **Broadcast correction**: contributions are summed back to the shape of
//!   the operand that was broadcast
//! - **Pending-consumer ordering**: a node passes its adjoint on only after
//!   every consumer has contributed
//!
//! ## Modules
//!
//! - [`tensor`]: array kernels on `ndarray::ArrayD<f64>`
//! - [`ops`]: the `Op` enum, with forward values and VJPs
//! - [`broadcast`]: reduction of broadcast adjoints
//! - [`graph`]: the `Graph` builder context
//! - [`backward`]: the reverse sweep and `Gradients`
//! - [`trace`]: recorded processing order of a sweep
//! - [`check`]: finite-difference gradient checking
//! - [`forward`]: forward mode with dual numbers
//!
//! ## Example
//!
//! ```rust
//! use adjoint_diff::Graph;
//! use ndarray::array;
//!
//! // loss = sum(A · v)
//! let mut graph = Graph::new();
//! let a = graph.variable(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]], Some("A")).unwrap();
//! let v = graph.variable(array![0.5, -1.0], Some("v")).unwrap();
//! let av = graph.dot(a, v, None).unwrap();
//! let loss = graph.sum(av, None, false, None).unwrap();
//!
//! let grads = graph.gradient(loss).unwrap();
//! // ∂loss/∂A = outer(ones, v), ∂loss/∂v = column sums of A
//! assert_eq!(grads.by_name("A").unwrap(), &array![[0.5, -1.0], [0.5, -1.0], [0.5, -1.0]].into_dyn());
//! assert_eq!(grads.by_name("v").unwrap(), &array![9.0, 12.0].into_dyn());
//! ```

pub mod backward;
pub mod broadcast;
pub mod check;
pub mod error;
pub mod forward;
pub mod graph;
pub mod ops;
pub mod tensor;
pub mod trace;

// Re-export key types
pub use backward::{gradient, gradient_traced, Gradients};
pub use check::{check_derivative, check_gradient, grad_check, numerical_gradient, GradCheckConfig, GradCheckError};
pub use error::{DiffError, Result};
pub use forward::Dual;
pub use graph::{Graph, GraphConfig, NodeKind, Operand};
pub use ops::Op;
pub use tensor::{IntoTensor, Mask, Tensor};
pub use trace::{BackwardTrace, TraceStep};
