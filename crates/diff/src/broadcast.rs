//! Reduction of broadcast adjoints back to an operand's shape.

use adjoint_core::{CoreError, Shape};
use ndarray::Axis;

use crate::error::Result;
use crate::tensor::{shape_of, Tensor};

/// Sum `contribution` down to `target`.
///
/// Dimensions are aligned from the trailing end. Leading axes the operand
/// does not have are summed away, then every axis where the operand has
/// length 1 is summed with the axis kept.
pub fn unbroadcast(contribution: Tensor, target: &Shape) -> Result<Tensor> {
    let got = shape_of(&contribution);
    if &got == target {
        return Ok(contribution);
    }
    if !target.broadcasts_to(&got) {
        return Err(CoreError::BroadcastMismatch {
            lhs: got,
            rhs: target.clone(),
        }
        .into());
    }

    let mut grad = contribution;
    for _ in 0..got.rank() - target.rank() {
        grad = grad.sum_axis(Axis(0));
    }
    for (axis, &dim) in target.dims.iter().enumerate() {
        if dim == 1 && grad.shape()[axis] != 1 {
            grad = grad.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    Ok(grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiffError;
    use ndarray::{array, ArrayD, IxDyn};

    #[test]
    fn test_identity_when_shapes_match() {
        let g = array![[1.0, 2.0]].into_dyn();
        assert_eq!(unbroadcast(g.clone(), &Shape::matrix(1, 2)).unwrap(), g);
    }

    #[test]
    fn test_leading_axes_summed() {
        let g = ArrayD::ones(IxDyn(&[4, 2, 3]));
        let r = unbroadcast(g, &Shape::vector(3)).unwrap();
        assert_eq!(r, array![8.0, 8.0, 8.0].into_dyn());
    }

    #[test]
    fn test_unit_axes_summed_keeping_dim() {
        let g = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn();
        let rows = unbroadcast(g.clone(), &Shape::matrix(2, 1)).unwrap();
        assert_eq!(rows, array![[6.0], [15.0]].into_dyn());

        let cols = unbroadcast(g, &Shape::matrix(1, 3)).unwrap();
        assert_eq!(cols, array![[5.0, 7.0, 9.0]].into_dyn());
    }

    #[test]
    fn test_scalar_target() {
        let g = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let r = unbroadcast(g, &Shape::scalar()).unwrap();
        assert_eq!(r.ndim(), 0);
        assert_eq!(r.sum(), 10.0);
    }

    #[test]
    fn test_irreducible_contribution() {
        let g = array![1.0, 2.0, 3.0].into_dyn();
        let err = unbroadcast(g, &Shape::vector(2)).unwrap_err();
        assert!(matches!(
            err,
            DiffError::Core(CoreError::BroadcastMismatch { .. })
        ));
    }
}
