//! # Differentiable Operations
//!
//! This module defines `Op`, the closed set of operations an interior node
//! can record. Each operation knows how to:
//!
//! - Execute forward (compute the node value from its operand values)
//! - Compute its VJP (the raw adjoint contribution to each operand)
//!
//! Operations that need state captured at construction (reduction axes,
//! the `where` mask, cached softmax probabilities) carry it in the variant.
//!
//! ## Operations
//!
//! | Op | Forward | Backward |
//! |----|---------|----------|
//! | Add | a + b | grad flows to both |
//! | Mul | a * b | ∂L/∂a = grad * b |
//! | Pow | a ^ b | ∂L/∂b = grad * out * ln(a) |
//! | Dot | A · B | ∂L/∂A = grad · Bᵀ |
//! | Sum | Σ x | broadcast grad |
//! | Max | max x | grad split among maxima |
//! | Where | mask ? a : b | grad masked per branch |
//!
//! Contributions are returned at the node's own shape for elementwise
//! operations; the traversal reduces them to operand shapes afterwards.

use std::fmt;

use adjoint_core::Shape;

use crate::error::{DiffError, Result};
use crate::tensor::{self, shape_of, Mask, Tensor};

/// Operation recorded on an interior node.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Element-wise addition: a + b
    Add,

    /// Element-wise subtraction: a - b
    Sub,

    /// Element-wise multiplication: a * b
    Mul,

    /// Element-wise division: a / b
    Div,

    /// Element-wise power: a ^ b
    Pow,

    /// Reverse all axes
    Transpose,

    /// Sum over one axis or everything
    Sum { axis: Option<usize>, keepdims: bool },

    /// Arithmetic mean over one axis or everything
    Mean { axis: Option<usize> },

    /// Element-wise eˣ
    Exp,

    /// Element-wise natural logarithm
    Log,

    /// Maximum over one axis or everything.
    ///
    /// `maxima` holds the reduced values with the axis kept, so they
    /// broadcast against the input.
    Max {
        axis: Option<usize>,
        keepdims: bool,
        maxima: Tensor,
    },

    /// Matrix/vector product
    Dot,

    /// Select a where `mask` holds, b elsewhere
    Where { mask: Mask },

    /// Element-wise sine
    Sin,

    /// Element-wise cosine
    Cos,

    /// Row-wise softmax followed by cross entropy against `labels`
    SoftmaxCrossEntropy {
        probs: Tensor,
        labels: Tensor,
        epsilon: f64,
    },

    /// Row-major reshape
    Reshape { shape: Vec<usize> },

    /// Drop length-1 axes
    Squeeze { axis: Option<usize> },
}

impl Op {
    /// Name used for display and auto-generated node names.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Pow => "pow",
            Op::Transpose => "transpose",
            Op::Sum { .. } => "sum",
            Op::Mean { .. } => "mean",
            Op::Exp => "exp",
            Op::Log => "log",
            Op::Max { .. } => "max",
            Op::Dot => "dot",
            Op::Where { .. } => "where",
            Op::Sin => "sin",
            Op::Cos => "cos",
            Op::SoftmaxCrossEntropy { .. } => "softmax_cross_entropy",
            Op::Reshape { .. } => "reshape",
            Op::Squeeze { .. } => "squeeze",
        }
    }

    /// Number of operands this operation consumes.
    pub fn arity(&self) -> usize {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow | Op::Dot | Op::Where { .. } => 2,
            _ => 1,
        }
    }

    fn second<'a>(&self, b: Option<&'a Tensor>) -> Result<&'a Tensor> {
        b.ok_or(DiffError::MissingOperand { op: self.name() })
    }

    fn second_shape<'a>(&self, b: Option<&'a Shape>) -> Result<&'a Shape> {
        b.ok_or(DiffError::MissingOperand { op: self.name() })
    }

    /// Execute the forward pass for this operation.
    pub fn forward(&self, a: &Tensor, b: Option<&Tensor>) -> Result<Tensor> {
        match self {
            Op::Add => tensor::zip_with(a, self.second(b)?, |x, y| x + y),
            Op::Sub => tensor::zip_with(a, self.second(b)?, |x, y| x - y),
            Op::Mul => tensor::zip_with(a, self.second(b)?, |x, y| x * y),
            Op::Div => tensor::zip_with(a, self.second(b)?, |x, y| x / y),
            Op::Pow => tensor::zip_with(a, self.second(b)?, f64::powf),
            Op::Transpose => Ok(tensor::transpose(a)),
            Op::Sum { axis, keepdims } => tensor::sum(a, *axis, *keepdims),
            Op::Mean { axis } => tensor::mean(a, *axis),
            Op::Exp => Ok(a.mapv(f64::exp)),
            Op::Log => Ok(a.mapv(f64::ln)),
            Op::Max {
                axis,
                keepdims,
                maxima,
            } => {
                if *keepdims {
                    Ok(maxima.clone())
                } else {
                    let reduced = shape_of(a).reduce(*axis, false)?;
                    tensor::reshape(maxima, &reduced.dims)
                }
            }
            Op::Dot => tensor::dot(a, self.second(b)?),
            Op::Where { mask } => tensor::select(mask, a, self.second(b)?),
            Op::Sin => Ok(a.mapv(f64::sin)),
            Op::Cos => Ok(a.mapv(f64::cos)),
            Op::SoftmaxCrossEntropy {
                probs,
                labels,
                epsilon,
            } => {
                // -Σ labels · ln(p + ε), summed over the batch
                let eps = *epsilon;
                let terms = tensor::zip_with(labels, probs, |y, p| y * (p + eps).ln())?;
                Ok(tensor::scalar(-terms.sum()))
            }
            Op::Reshape { shape } => tensor::reshape(a, shape),
            Op::Squeeze { axis } => tensor::squeeze(a, *axis),
        }
    }

    /// Compute the VJP (vector-Jacobian product) for backpropagation.
    ///
    /// Given the adjoint of this node, its value `out` and its operand
    /// values, returns the contribution to each operand. The second entry
    /// is `Some` exactly for binary operations.
    pub fn vjp(
        &self,
        adjoint: &Tensor,
        out: &Tensor,
        a: &Tensor,
        b: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        match self {
            Op::Add => {
                // z = a + b
                // ∂L/∂a = ∂L/∂z, ∂L/∂b = ∂L/∂z
                Ok((adjoint.clone(), Some(adjoint.clone())))
            }

            Op::Sub => {
                // z = a - b
                // ∂L/∂a = ∂L/∂z, ∂L/∂b = -∂L/∂z
                Ok((adjoint.clone(), Some(adjoint.mapv(|g| -g))))
            }

            Op::Mul => {
                // z = a * b
                // ∂L/∂a = ∂L/∂z * b, ∂L/∂b = ∂L/∂z * a
                let b = self.second(b)?;
                let grad_a = tensor::zip_with(adjoint, b, |g, y| g * y)?;
                let grad_b = tensor::zip_with(adjoint, a, |g, x| g * x)?;
                Ok((grad_a, Some(grad_b)))
            }

            Op::Div => {
                // z = a / b
                // ∂L/∂a = ∂L/∂z / b, ∂L/∂b = -∂L/∂z * a / b²
                let b = self.second(b)?;
                let grad_a = tensor::zip_with(adjoint, b, |g, y| g / y)?;
                let scaled = tensor::zip_with(adjoint, a, |g, x| g * x)?;
                let grad_b = tensor::zip_with(&scaled, b, |gx, y| -gx / (y * y))?;
                Ok((grad_a, Some(grad_b)))
            }

            Op::Pow => {
                // z = a ^ b
                // ∂L/∂a = ∂L/∂z * b * a^(b-1), ∂L/∂b = ∂L/∂z * z * ln(a)
                let b = self.second(b)?;
                let local_a = tensor::zip_with(a, b, |x, y| y * x.powf(y - 1.0))?;
                let local_b = tensor::zip_with(out, a, |z, x| z * x.ln())?;
                let grad_a = tensor::zip_with(adjoint, &local_a, |g, d| g * d)?;
                let grad_b = tensor::zip_with(adjoint, &local_b, |g, d| g * d)?;
                Ok((grad_a, Some(grad_b)))
            }

            Op::Transpose => Ok((tensor::transpose(adjoint), None)),

            Op::Sum { axis, keepdims } => {
                // s = Σ x
                // ∂L/∂xᵢ = ∂L/∂s for every xᵢ folded into s
                let grad = tensor::expand_reduced(adjoint, &shape_of(a), *axis, *keepdims)?;
                Ok((grad, None))
            }

            Op::Mean { axis } => {
                // m = Σ x / N
                // ∂L/∂xᵢ = ∂L/∂m / N
                let input = shape_of(a);
                let count = tensor::reduced_count(&input, *axis)? as f64;
                let grad = tensor::expand_reduced(adjoint, &input, *axis, false)?;
                Ok((grad.mapv(|g| g / count), None))
            }

            Op::Exp => {
                // z = eˣ, ∂L/∂x = ∂L/∂z * z
                Ok((tensor::zip_with(adjoint, out, |g, z| g * z)?, None))
            }

            Op::Log => {
                // z = ln x, ∂L/∂x = ∂L/∂z / x
                Ok((tensor::zip_with(adjoint, a, |g, x| g / x)?, None))
            }

            Op::Max {
                axis,
                keepdims,
                maxima,
            } => {
                // Only the elements equal to the maximum receive gradient,
                // shared evenly when several tie.
                let input = shape_of(a);
                let hits = tensor::zip_with(a, maxima, |x, m| if x == m { 1.0 } else { 0.0 })?;
                let ties = tensor::sum(&hits, *axis, true)?;
                let share = tensor::zip_with(&hits, &ties, |h, n| h / n)?;
                let grad = tensor::expand_reduced(adjoint, &input, *axis, *keepdims)?;
                Ok((tensor::zip_with(&grad, &share, |g, s| g * s)?, None))
            }

            Op::Dot => {
                // C = A · B
                // ∂L/∂A = ∂L/∂C · Bᵀ, ∂L/∂B = Aᵀ · ∂L/∂C
                let (grad_a, grad_b) = tensor::dot_vjp(adjoint, a, self.second(b)?)?;
                Ok((grad_a, Some(grad_b)))
            }

            Op::Where { mask } => {
                let picked = mask.mapv(|m| if m { 1.0 } else { 0.0 });
                let grad_a = tensor::zip_with(adjoint, &picked, |g, m| g * m)?;
                let grad_b = tensor::zip_with(adjoint, &picked, |g, m| g * (1.0 - m))?;
                Ok((grad_a, Some(grad_b)))
            }

            Op::Sin => {
                // ∂/∂x sin x = cos x
                let local = a.mapv(f64::cos);
                Ok((tensor::zip_with(adjoint, &local, |g, d| g * d)?, None))
            }

            Op::Cos => {
                // ∂/∂x cos x = -sin x
                let local = a.mapv(f64::sin);
                Ok((tensor::zip_with(adjoint, &local, |g, d| -g * d)?, None))
            }

            Op::SoftmaxCrossEntropy { probs, labels, .. } => {
                // ∂L/∂logits = ∂L/∂loss * (softmax - labels)
                let residual = tensor::zip_with(probs, labels, |p, y| p - y)?;
                Ok((tensor::zip_with(adjoint, &residual, |g, r| g * r)?, None))
            }

            Op::Reshape { .. } | Op::Squeeze { .. } => {
                Ok((tensor::reshape(adjoint, a.shape())?, None))
            }
        }
    }

    /// Shape of the value this operation produces from operands of the
    /// given shapes, without computing it.
    pub fn output_shape(&self, a: &Shape, b: Option<&Shape>) -> Result<Shape> {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow => Ok(a.broadcast_with(self.second_shape(b)?)?),
            Op::Where { mask } => Ok(shape_of(mask)
                .broadcast_with(a)?
                .broadcast_with(self.second_shape(b)?)?),
            Op::Transpose => Ok(a.transposed()),
            Op::Sum { axis, keepdims } | Op::Max { axis, keepdims, .. } => {
                Ok(a.reduce(*axis, *keepdims)?)
            }
            Op::Mean { axis } => Ok(a.reduce(*axis, false)?),
            Op::Exp | Op::Log | Op::Sin | Op::Cos => Ok(a.clone()),
            Op::Dot => {
                let b = self.second_shape(b)?;
                let mut dims = Vec::with_capacity(2);
                if a.rank() == 2 {
                    dims.push(a.dims[0]);
                }
                if b.rank() == 2 {
                    dims.push(b.dims[1]);
                }
                Ok(Shape::new(dims))
            }
            Op::SoftmaxCrossEntropy { .. } => Ok(Shape::scalar()),
            Op::Reshape { shape } => Ok(a.reshape(shape)?),
            Op::Squeeze { axis } => Ok(a.squeeze(*axis)?),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Sum { axis: Some(axis), .. }
            | Op::Mean { axis: Some(axis) }
            | Op::Max { axis: Some(axis), .. } => write!(f, "{}(axis={})", self.name(), axis),
            Op::Reshape { shape } => write!(f, "reshape({})", Shape::from(shape.as_slice())),
            _ => write!(f, "{}", self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array, Dimension};

    fn t<D: Dimension>(a: Array<f64, D>) -> Tensor {
        a.into_dyn()
    }

    #[test]
    fn test_names() {
        assert_eq!(Op::Add.name(), "add");
        assert_eq!(
            Op::Sum {
                axis: None,
                keepdims: false
            }
            .name(),
            "sum"
        );
        assert_eq!(format!("{}", Op::Mean { axis: Some(1) }), "mean(axis=1)");
        assert_eq!(Op::Dot.arity(), 2);
        assert_eq!(Op::Exp.arity(), 1);
    }

    #[test]
    fn test_binary_without_operand() {
        let a = tensor::scalar(1.0);
        assert!(matches!(
            Op::Add.forward(&a, None),
            Err(DiffError::MissingOperand { op: "add" })
        ));
        assert!(matches!(
            Op::Dot.output_shape(&Shape::vector(3), None),
            Err(DiffError::MissingOperand { op: "dot" })
        ));
    }

    #[test]
    fn test_mul_vjp() {
        let a = t(array![2.0, 3.0]);
        let b = t(array![5.0, 7.0]);
        let out = Op::Mul.forward(&a, Some(&b)).unwrap();
        let g = t(array![1.0, 1.0]);
        let (ga, gb) = Op::Mul.vjp(&g, &out, &a, Some(&b)).unwrap();
        assert_eq!(ga, b);
        assert_eq!(gb, Some(a));
    }

    #[test]
    fn test_div_vjp() {
        let a = tensor::scalar(6.0);
        let b = tensor::scalar(2.0);
        let out = Op::Div.forward(&a, Some(&b)).unwrap();
        let (ga, gb) = Op::Div.vjp(&tensor::scalar(1.0), &out, &a, Some(&b)).unwrap();
        assert_eq!(ga, tensor::scalar(0.5));
        assert_eq!(gb, Some(tensor::scalar(-1.5)));
    }

    #[test]
    fn test_mean_is_uniform() {
        let x = t(array![[1.0, 2.0], [3.0, 10.0]]);
        let op = Op::Mean { axis: None };
        let out = op.forward(&x, None).unwrap();
        assert_eq!(out, tensor::scalar(4.0));
        let (g, _) = op.vjp(&tensor::scalar(1.0), &out, &x, None).unwrap();
        assert_eq!(g, t(array![[0.25, 0.25], [0.25, 0.25]]));
    }

    #[test]
    fn test_max_splits_ties() {
        let x = t(array![[3.0, 1.0, 3.0], [0.0, 2.0, 1.0]]);
        let maxima = tensor::max(&x, Some(1), true).unwrap();
        let op = Op::Max {
            axis: Some(1),
            keepdims: false,
            maxima,
        };
        let out = op.forward(&x, None).unwrap();
        assert_eq!(out, t(array![3.0, 2.0]));

        let (g, _) = op.vjp(&t(array![1.0, 4.0]), &out, &x, None).unwrap();
        assert_eq!(g, t(array![[0.5, 0.0, 0.5], [0.0, 4.0, 0.0]]));
    }

    #[test]
    fn test_where_routes_adjoint() {
        let mask = array![true, false].into_dyn();
        let op = Op::Where { mask };
        let a = t(array![1.0, 2.0]);
        let b = t(array![3.0, 4.0]);
        let out = op.forward(&a, Some(&b)).unwrap();
        assert_eq!(out, t(array![1.0, 4.0]));

        let (ga, gb) = op.vjp(&t(array![5.0, 6.0]), &out, &a, Some(&b)).unwrap();
        assert_eq!(ga, t(array![5.0, 0.0]));
        assert_eq!(gb, Some(t(array![0.0, 6.0])));
    }

    #[test]
    fn test_softmax_cross_entropy_residual() {
        let logits = t(array![[2.0, 1.0]]);
        let probs = tensor::softmax_rows(&logits).unwrap();
        let labels = t(array![[1.0, 0.0]]);
        let op = Op::SoftmaxCrossEntropy {
            probs: probs.clone(),
            labels: labels.clone(),
            epsilon: 1e-7,
        };
        let out = op.forward(&logits, None).unwrap();
        let expected = -(probs[[0, 0]] + 1e-7).ln();
        assert!((out.sum() - expected).abs() < 1e-12);

        let (g, none) = op.vjp(&tensor::scalar(1.0), &out, &logits, None).unwrap();
        assert!(none.is_none());
        assert!((g[[0, 0]] - (probs[[0, 0]] - 1.0)).abs() < 1e-12);
        assert!((g[[0, 1]] - probs[[0, 1]]).abs() < 1e-12);
    }

    #[test]
    fn test_output_shape_matches_forward() {
        let a = t(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let b = t(array![1.0, 2.0, 3.0]);
        let ops = vec![
            (Op::Add, Some(&b)),
            (Op::Transpose, None),
            (
                Op::Sum {
                    axis: Some(0),
                    keepdims: true,
                },
                None,
            ),
            (Op::Mean { axis: Some(1) }, None),
            (Op::Dot, Some(&b)),
            (Op::Reshape { shape: vec![3, 2] }, None),
        ];
        for (op, b) in ops {
            let value = op.forward(&a, b).unwrap();
            let shape = op.output_shape(&shape_of(&a), b.map(shape_of).as_ref()).unwrap();
            assert_eq!(shape_of(&value), shape, "{}", op);
        }
    }
}
