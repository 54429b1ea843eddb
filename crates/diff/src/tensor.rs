//! # Tensors - Array Kernels for Graph Values
//!
//! Node values are dynamic-rank `ndarray` arrays of `f64`. This module holds
//! the array kernels the builders and gradient rules share: broadcasting
//! elementwise maps, axis reductions, the promoted matrix product and shape
//! changes.
//!
//! Every kernel validates shapes up front and reports failures as
//! [`DiffError`], so ndarray's panicking operators are never reached with
//! incompatible operands.

use adjoint_core::{CoreError, Shape};
use ndarray::{Array, Array1, Array2, ArrayD, Axis, Dimension, Ix2, IxDyn, Zip};

use crate::error::Result;
#[cfg(test)]
use crate::error::DiffError;

/// Value held by every node.
pub type Tensor = ArrayD<f64>;

/// Boolean selection mask used by `where`.
pub type Mask = ArrayD<bool>;

/// Conversion of raw numeric values into a [`Tensor`].
pub trait IntoTensor {
    fn into_tensor(self) -> Tensor;
}

impl IntoTensor for f64 {
    fn into_tensor(self) -> Tensor {
        scalar(self)
    }
}

impl IntoTensor for Vec<f64> {
    fn into_tensor(self) -> Tensor {
        Array1::from(self).into_dyn()
    }
}

impl<D: Dimension> IntoTensor for Array<f64, D> {
    fn into_tensor(self) -> Tensor {
        self.into_dyn()
    }
}

/// A rank-0 tensor.
pub fn scalar(value: f64) -> Tensor {
    ArrayD::from_elem(IxDyn(&[]), value)
}

/// Shape of a tensor.
pub fn shape_of<A>(t: &ArrayD<A>) -> Shape {
    Shape::new(t.shape().to_vec())
}

/// Expand a tensor to `shape` by broadcasting.
pub fn broadcast_to<A: Clone>(t: &ArrayD<A>, shape: &Shape) -> Result<ArrayD<A>> {
    t.broadcast(shape.dims.as_slice())
        .map(|view| view.to_owned())
        .ok_or_else(|| {
            CoreError::BroadcastMismatch {
                lhs: shape_of(t),
                rhs: shape.clone(),
            }
            .into()
        })
}

/// Apply `f` elementwise over the broadcast of `a` and `b`.
pub fn zip_with<F>(a: &Tensor, b: &Tensor, f: F) -> Result<Tensor>
where
    F: Fn(f64, f64) -> f64,
{
    if a.shape() == b.shape() {
        return Ok(Zip::from(a).and(b).map_collect(|&x, &y| f(x, y)));
    }

    let out = shape_of(a).broadcast_with(&shape_of(b))?;
    let lhs = broadcast_to(a, &out)?;
    let rhs = broadcast_to(b, &out)?;
    Ok(Zip::from(&lhs).and(&rhs).map_collect(|&x, &y| f(x, y)))
}

/// Pick from `a` where `mask` holds and from `b` elsewhere, with broadcasting.
pub fn select(mask: &Mask, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let out = shape_of(mask)
        .broadcast_with(&shape_of(a))?
        .broadcast_with(&shape_of(b))?;
    let mask = broadcast_to(mask, &out)?;
    let lhs = broadcast_to(a, &out)?;
    let rhs = broadcast_to(b, &out)?;
    Ok(Zip::from(&mask)
        .and(&lhs)
        .and(&rhs)
        .map_collect(|&pick, &x, &y| if pick { x } else { y }))
}

/// Sum along `axis`, or over everything when `None`.
pub fn sum(x: &Tensor, axis: Option<usize>, keepdims: bool) -> Result<Tensor> {
    match axis {
        None => {
            let total = x.sum();
            if keepdims {
                Ok(ArrayD::from_elem(IxDyn(&vec![1; x.ndim()]), total))
            } else {
                Ok(scalar(total))
            }
        }
        Some(axis) => {
            let axis = shape_of(x).check_axis(axis)?;
            let summed = x.sum_axis(Axis(axis));
            Ok(if keepdims {
                summed.insert_axis(Axis(axis))
            } else {
                summed
            })
        }
    }
}

/// Number of elements folded into each result of a reduction.
pub fn reduced_count(shape: &Shape, axis: Option<usize>) -> Result<usize> {
    match axis {
        None => Ok(shape.numel()),
        Some(axis) => Ok(shape.dims[shape.check_axis(axis)?]),
    }
}

/// Arithmetic mean along `axis`, or over everything when `None`.
pub fn mean(x: &Tensor, axis: Option<usize>) -> Result<Tensor> {
    let count = reduced_count(&shape_of(x), axis)?;
    if count == 0 {
        return Err(CoreError::EmptyReduction.into());
    }
    let total = sum(x, axis, false)?;
    Ok(total.mapv(|v| v / count as f64))
}

/// Maximum along `axis`, or over everything when `None`.
pub fn max(x: &Tensor, axis: Option<usize>, keepdims: bool) -> Result<Tensor> {
    if reduced_count(&shape_of(x), axis)? == 0 {
        return Err(CoreError::EmptyReduction.into());
    }
    match axis {
        None => {
            let top = x.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
            if keepdims {
                Ok(ArrayD::from_elem(IxDyn(&vec![1; x.ndim()]), top))
            } else {
                Ok(scalar(top))
            }
        }
        Some(axis) => {
            let top = x.fold_axis(Axis(axis), f64::NEG_INFINITY, |&acc, &v| acc.max(v));
            Ok(if keepdims {
                top.insert_axis(Axis(axis))
            } else {
                top
            })
        }
    }
}

/// Broadcast the adjoint of a reduction back over the reduced input.
///
/// When `keepdims` was false the reduced axis is reinserted first so that
/// e.g. a `[2]` adjoint of `sum([2, 3], axis=1)` lines up with rows.
pub fn expand_reduced(
    adjoint: &Tensor,
    input: &Shape,
    axis: Option<usize>,
    keepdims: bool,
) -> Result<Tensor> {
    match (axis, keepdims) {
        (Some(axis), false) => {
            let axis = input.check_axis(axis)?;
            broadcast_to(&adjoint.clone().insert_axis(Axis(axis)), input)
        }
        _ => broadcast_to(adjoint, input),
    }
}

/// Reverse all axes.
pub fn transpose(x: &Tensor) -> Tensor {
    x.t().as_standard_layout().into_owned()
}

/// Reshape into `dims` (row-major), which must hold the same element count.
pub fn reshape(x: &Tensor, dims: &[usize]) -> Result<Tensor> {
    shape_of(x).reshape(dims)?;
    Ok(x.to_shape(IxDyn(dims))?.into_owned())
}

/// Remove length-1 axes (all of them, or only `axis`).
pub fn squeeze(x: &Tensor, axis: Option<usize>) -> Result<Tensor> {
    let target = shape_of(x).squeeze(axis)?;
    reshape(x, &target.dims)
}

/// View a rank-1 or rank-2 operand of a product as a matrix.
///
/// Rank-1 left operands become a row, rank-1 right operands a column.
fn as_matrix(x: &Tensor, column: bool) -> Result<Array2<f64>> {
    match x.ndim() {
        1 => {
            let n = x.len();
            let dims = if column { (n, 1) } else { (1, n) };
            Ok(x.to_shape(dims)?.into_owned())
        }
        2 => Ok(x.view().into_dimensionality::<Ix2>()?.to_owned()),
        rank => Err(CoreError::RankMismatch { op: "dot", rank }.into()),
    }
}

fn promoted(a: &Tensor, b: &Tensor) -> Result<(Array2<f64>, Array2<f64>)> {
    let lhs = as_matrix(a, false)?;
    let rhs = as_matrix(b, true)?;
    if lhs.ncols() != rhs.nrows() {
        return Err(CoreError::ContractionMismatch {
            lhs: shape_of(a),
            rhs: shape_of(b),
        }
        .into());
    }
    Ok((lhs, rhs))
}

/// Matrix/vector product.
///
/// | a | b | result |
/// |---|---|--------|
/// | `[m, k]` | `[k, n]` | `[m, n]` |
/// | `[m, k]` | `[k]` | `[m]` |
/// | `[k]` | `[k, n]` | `[n]` |
/// | `[k]` | `[k]` | `[]` |
pub fn dot(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (lhs, rhs) = promoted(a, b)?;
    let product = lhs.dot(&rhs);

    let mut dims = Vec::with_capacity(2);
    if a.ndim() == 2 {
        dims.push(product.nrows());
    }
    if b.ndim() == 2 {
        dims.push(product.ncols());
    }
    Ok(product.to_shape(IxDyn(&dims))?.into_owned())
}

/// Adjoints of `dot(a, b)` given the adjoint of its result.
///
/// Operands are promoted exactly as in [`dot`], the products are taken in
/// matrix form, and each result is reshaped back to its operand's shape.
pub fn dot_vjp(adjoint: &Tensor, a: &Tensor, b: &Tensor) -> Result<(Tensor, Tensor)> {
    let (lhs, rhs) = promoted(a, b)?;
    let grad = adjoint.to_shape((lhs.nrows(), rhs.ncols()))?;

    let grad_a = grad.dot(&rhs.t());
    let grad_b = lhs.t().dot(&grad);

    Ok((
        grad_a.to_shape(IxDyn(a.shape()))?.into_owned(),
        grad_b.to_shape(IxDyn(b.shape()))?.into_owned(),
    ))
}

/// Row-wise softmax of a `[batch, classes]` tensor.
///
/// The row maximum is subtracted before exponentiating so large logits
/// cannot overflow.
pub fn softmax_rows(logits: &Tensor) -> Result<Tensor> {
    if logits.ndim() != 2 {
        return Err(CoreError::RankMismatch {
            op: "softmax_cross_entropy",
            rank: logits.ndim(),
        }
        .into());
    }
    let row_max = max(logits, Some(1), true)?;
    let shifted = zip_with(logits, &row_max, |x, m| x - m)?.mapv(f64::exp);
    let totals = sum(&shifted, Some(1), true)?;
    zip_with(&shifted, &totals, |e, t| e / t)
}
