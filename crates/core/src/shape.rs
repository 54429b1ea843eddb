//! # Shapes - Dimensions and Broadcasting
//!
//! Every value flowing through a computation graph has a shape. Shapes are
//! the "types" of the graph: an operation is only defined when the shapes of
//! its operands agree under the operation's rules.
//!
//! ## Broadcasting
//!
//! Elementwise operations follow the usual array broadcasting rules. Shapes
//! are aligned from the trailing dimension; two dimensions agree when they
//! are equal or when one of them is `1`; missing leading dimensions are
//! treated as `1`.
//!
//! ```text
//!    a:      [4, 1, 3]
//!    b:         [5, 1]
//!    ─────────────────
//!    result: [4, 5, 3]
//! ```
//!
//! We use runtime shapes (`Vec<usize>`) because graphs are built dynamically,
//! one operation at a time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A shape describes the dimensions of an n-dimensional array.
///
/// An empty `dims` is a scalar, `[n]` a vector, `[m, n]` a matrix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    /// Dimension sizes, outermost first
    pub dims: Vec<usize>,
}

impl Shape {
    /// Create a shape from its dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// A scalar shape (rank 0).
    pub fn scalar() -> Self {
        Self { dims: vec![] }
    }

    /// A vector shape (rank 1).
    pub fn vector(len: usize) -> Self {
        Self { dims: vec![len] }
    }

    /// A matrix shape (rank 2).
    pub fn matrix(rows: usize, cols: usize) -> Self {
        Self {
            dims: vec![rows, cols],
        }
    }

    /// Number of dimensions (rank).
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Compute the broadcast of two shapes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use adjoint_core::Shape;
    ///
    /// let a = Shape::new(vec![4, 1, 3]);
    /// let b = Shape::new(vec![5, 1]);
    /// assert_eq!(a.broadcast_with(&b).unwrap(), Shape::new(vec![4, 5, 3]));
    /// ```
    pub fn broadcast_with(&self, other: &Shape) -> Result<Shape, CoreError> {
        let rank = self.rank().max(other.rank());
        let mut dims = vec![0; rank];

        for i in 0..rank {
            let lhs = dim_from_end(&self.dims, i);
            let rhs = dim_from_end(&other.dims, i);
            dims[rank - 1 - i] = match (lhs, rhs) {
                (l, r) if l == r => l,
                (1, r) => r,
                (l, 1) => l,
                _ => {
                    return Err(CoreError::BroadcastMismatch {
                        lhs: self.clone(),
                        rhs: other.clone(),
                    })
                }
            };
        }

        Ok(Shape { dims })
    }

    /// Check whether this shape can be expanded to `target` by broadcasting.
    pub fn broadcasts_to(&self, target: &Shape) -> bool {
        if self.rank() > target.rank() {
            return false;
        }
        (0..self.rank()).all(|i| {
            let own = dim_from_end(&self.dims, i);
            own == 1 || own == dim_from_end(&target.dims, i)
        })
    }

    /// Validate an axis against this shape's rank.
    pub fn check_axis(&self, axis: usize) -> Result<usize, CoreError> {
        if axis < self.rank() {
            Ok(axis)
        } else {
            Err(CoreError::InvalidAxis {
                axis,
                rank: self.rank(),
            })
        }
    }

    /// Shape after reducing along `axis` (all axes when `None`).
    pub fn reduce(&self, axis: Option<usize>, keepdims: bool) -> Result<Shape, CoreError> {
        let dims = match axis {
            None if keepdims => vec![1; self.rank()],
            None => vec![],
            Some(axis) => {
                let axis = self.check_axis(axis)?;
                let mut dims = self.dims.clone();
                if keepdims {
                    dims[axis] = 1;
                } else {
                    dims.remove(axis);
                }
                dims
            }
        };
        Ok(Shape { dims })
    }

    /// Shape with every axis reversed.
    pub fn transposed(&self) -> Shape {
        Shape {
            dims: self.dims.iter().rev().copied().collect(),
        }
    }

    /// Shape after removing length-1 axes.
    ///
    /// With `None` every length-1 axis is removed; with `Some(axis)` only that
    /// axis, which must have length 1.
    pub fn squeeze(&self, axis: Option<usize>) -> Result<Shape, CoreError> {
        match axis {
            None => Ok(Shape {
                dims: self.dims.iter().copied().filter(|&d| d != 1).collect(),
            }),
            Some(axis) => {
                let axis = self.check_axis(axis)?;
                if self.dims[axis] != 1 {
                    return Err(CoreError::ShapeMismatch {
                        expected: Shape::vector(1),
                        got: Shape::vector(self.dims[axis]),
                    });
                }
                let mut dims = self.dims.clone();
                dims.remove(axis);
                Ok(Shape { dims })
            }
        }
    }

    /// Validate a reshape to `target`: the element counts must agree.
    pub fn reshape(&self, target: &[usize]) -> Result<Shape, CoreError> {
        let target = Shape::new(target.to_vec());
        if target.numel() != self.numel() {
            return Err(CoreError::InvalidReshape {
                from: self.clone(),
                to: target,
            });
        }
        Ok(target)
    }
}

/// Dimension `i` counted from the trailing end; missing dimensions are `1`.
fn dim_from_end(dims: &[usize], i: usize) -> usize {
    if i < dims.len() {
        dims[dims.len() - 1 - i]
    } else {
        1
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self { dims }
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.dims
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}
