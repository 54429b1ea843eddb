//! # Forward Mode - Dual Numbers
//!
//! A dual number `a + bε` with `ε² = 0` carries a value and a derivative
//! through arithmetic together: evaluating `f(x + ε)` yields
//! `f(x) + f'(x)ε`. One evaluation gives the derivative with respect to one
//! argument, so forward mode suits functions with few inputs.
//!
//! ## Example
//!
//! ```rust
//! use adjoint_diff::forward::{derivative, Dual};
//! use adjoint_diff::Result;
//!
//! // f(x, y) = x² · y
//! let f = |v: &[Dual]| -> Result<Dual> { Ok(v[0].powf(2.0) * v[1]) };
//! assert_eq!(derivative(f, 0, &[3.0, 2.0]).unwrap(), 12.0);
//! assert_eq!(derivative(f, 1, &[3.0, 2.0]).unwrap(), 9.0);
//! ```
//!
//! Operators are implemented between duals and between a dual and `f64` in
//! either order. Division can fail, so it is a method returning `Result`.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use crate::error::{DiffError, Result};

/// `real + dual·ε`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual {
    pub real: f64,
    pub dual: f64,
}

impl Dual {
    pub fn new(real: f64, dual: f64) -> Self {
        Self { real, dual }
    }

    /// A value with zero derivative.
    pub fn constant(real: f64) -> Self {
        Self::new(real, 0.0)
    }

    /// The variable being differentiated (derivative seed 1).
    pub fn variable(real: f64) -> Self {
        Self::new(real, 1.0)
    }

    /// `self / other`
    pub fn try_div(self, other: Dual) -> Result<Dual> {
        if other.real == 0.0 {
            return Err(DiffError::DivideByZero);
        }
        Ok(Dual::new(
            self.real / other.real,
            (self.dual * other.real - self.real * other.dual) / (other.real * other.real),
        ))
    }

    /// `self / other` for a plain divisor.
    pub fn try_div_f64(self, other: f64) -> Result<Dual> {
        if other == 0.0 {
            return Err(DiffError::DivideByZero);
        }
        Ok(Dual::new(self.real / other, self.dual / other))
    }

    /// `numerator / self`
    pub fn rdiv(self, numerator: f64) -> Result<Dual> {
        if self.real == 0.0 {
            return Err(DiffError::DivideByZero);
        }
        Ok(Dual::new(
            numerator / self.real,
            -numerator * self.dual / (self.real * self.real),
        ))
    }

    /// `self ^ exponent`
    pub fn powf(self, exponent: f64) -> Dual {
        Dual::new(
            self.real.powf(exponent),
            self.dual * exponent * self.real.powf(exponent - 1.0),
        )
    }

    /// `self ^ exponent` with a dual exponent.
    pub fn powd(self, exponent: Dual) -> Dual {
        // d(a^b) = a^(b-1) · (a·ln(a)·db + b·da)
        Dual::new(
            self.real.powf(exponent.real),
            self.real.powf(exponent.real - 1.0)
                * (self.real * exponent.dual * self.real.ln() + exponent.real * self.dual),
        )
    }

    /// `base ^ self`
    pub fn rpow(self, base: f64) -> Dual {
        let value = base.powf(self.real);
        Dual::new(value, value * self.dual * base.ln())
    }

    pub fn exp(self) -> Dual {
        let value = self.real.exp();
        Dual::new(value, value * self.dual)
    }

    /// Natural logarithm.
    pub fn ln(self) -> Dual {
        Dual::new(self.real.ln(), self.dual / self.real)
    }

    pub fn sqrt(self) -> Dual {
        let root = self.real.sqrt();
        Dual::new(root, 0.5 / root * self.dual)
    }

    pub fn sin(self) -> Dual {
        Dual::new(self.real.sin(), self.real.cos() * self.dual)
    }

    pub fn cos(self) -> Dual {
        Dual::new(self.real.cos(), -self.real.sin() * self.dual)
    }

    pub fn tan(self) -> Dual {
        let sec = 1.0 / self.real.cos();
        Dual::new(self.real.tan(), self.dual * sec * sec)
    }
}

impl From<f64> for Dual {
    fn from(real: f64) -> Self {
        Dual::constant(real)
    }
}

impl fmt::Display for Dual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} + {}ε", self.real, self.dual)
    }
}

// ============================================================================
// Operators
// ============================================================================

impl Add for Dual {
    type Output = Dual;
    fn add(self, rhs: Dual) -> Dual {
        Dual::new(self.real + rhs.real, self.dual + rhs.dual)
    }
}

impl Add<f64> for Dual {
    type Output = Dual;
    fn add(self, rhs: f64) -> Dual {
        Dual::new(self.real + rhs, self.dual)
    }
}

impl Add<Dual> for f64 {
    type Output = Dual;
    fn add(self, rhs: Dual) -> Dual {
        rhs + self
    }
}

impl Sub for Dual {
    type Output = Dual;
    fn sub(self, rhs: Dual) -> Dual {
        Dual::new(self.real - rhs.real, self.dual - rhs.dual)
    }
}

impl Sub<f64> for Dual {
    type Output = Dual;
    fn sub(self, rhs: f64) -> Dual {
        Dual::new(self.real - rhs, self.dual)
    }
}

impl Sub<Dual> for f64 {
    type Output = Dual;
    fn sub(self, rhs: Dual) -> Dual {
        Dual::new(self - rhs.real, -rhs.dual)
    }
}

impl Mul for Dual {
    type Output = Dual;
    fn mul(self, rhs: Dual) -> Dual {
        Dual::new(
            self.real * rhs.real,
            self.real * rhs.dual + self.dual * rhs.real,
        )
    }
}

impl Mul<f64> for Dual {
    type Output = Dual;
    fn mul(self, rhs: f64) -> Dual {
        Dual::new(self.real * rhs, self.dual * rhs)
    }
}

impl Mul<Dual> for f64 {
    type Output = Dual;
    fn mul(self, rhs: Dual) -> Dual {
        rhs * self
    }
}

impl Neg for Dual {
    type Output = Dual;
    fn neg(self) -> Dual {
        Dual::new(-self.real, -self.dual)
    }
}

// ============================================================================
// Differentiation
// ============================================================================

/// Derivative of `fx` with respect to argument `wrt` at `args`.
pub fn derivative<F>(fx: F, wrt: usize, args: &[f64]) -> Result<f64>
where
    F: Fn(&[Dual]) -> Result<Dual>,
{
    if wrt >= args.len() {
        return Err(DiffError::ArgumentOutOfRange {
            index: wrt,
            len: args.len(),
        });
    }
    let duals: Vec<Dual> = args
        .iter()
        .enumerate()
        .map(|(i, &arg)| if i == wrt { Dual::variable(arg) } else { Dual::constant(arg) })
        .collect();
    Ok(fx(duals.as_slice())?.dual)
}

/// All partial derivatives of `fx` at `args`, one forward pass each.
pub fn gradient<F>(fx: F, args: &[f64]) -> Result<Vec<f64>>
where
    F: Fn(&[Dual]) -> Result<Dual>,
{
    (0..args.len()).map(|wrt| derivative(&fx, wrt, args)).collect()
}

/// The partial derivative of `fx` in argument `wrt`, as a function.
pub fn differentiate<F>(fx: F, wrt: usize) -> impl Fn(&[f64]) -> Result<f64>
where
    F: Fn(&[Dual]) -> Result<Dual>,
{
    move |args: &[f64]| derivative(&fx, wrt, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_arithmetic() {
        let x = Dual::new(3.0, 1.0);
        let y = Dual::new(2.0, 0.0);

        assert_eq!(x + y, Dual::new(5.0, 1.0));
        assert_eq!(x - y, Dual::new(1.0, 1.0));
        assert_eq!(x * y, Dual::new(6.0, 2.0));
        assert_eq!(-x, Dual::new(-3.0, -1.0));
        assert_eq!(1.0 + x, Dual::new(4.0, 1.0));
        assert_eq!(10.0 - x, Dual::new(7.0, -1.0));
        assert_eq!(x * 2.0, Dual::new(6.0, 2.0));
    }

    #[test]
    fn test_division() {
        let x = Dual::variable(2.0);
        // d/dx (1 / x) = -1 / x²
        assert_eq!(x.rdiv(1.0).unwrap(), Dual::new(0.5, -0.25));
        // d/dx (x / 4) = 1/4
        assert_eq!(x.try_div_f64(4.0).unwrap(), Dual::new(0.5, 0.25));
        // d/dx (x / x) = 0
        assert!(close(x.try_div(x).unwrap().dual, 0.0));
    }

    #[test]
    fn test_divide_by_zero() {
        let x = Dual::variable(1.0);
        assert!(matches!(x.try_div(Dual::constant(0.0)), Err(DiffError::DivideByZero)));
        assert!(matches!(x.try_div_f64(0.0), Err(DiffError::DivideByZero)));
        assert!(matches!(Dual::constant(0.0).rdiv(1.0), Err(DiffError::DivideByZero)));
    }

    #[test]
    fn test_powers() {
        let x = Dual::variable(2.0);
        assert_eq!(x.powf(3.0), Dual::new(8.0, 12.0));

        // d/dx 2^x = 2^x ln 2
        let r = x.rpow(2.0);
        assert!(close(r.dual, 4.0 * 2f64.ln()));

        // d/dx x^x = x^x (ln x + 1)
        let s = x.powd(x);
        assert!(close(s.real, 4.0));
        assert!(close(s.dual, 4.0 * (2f64.ln() + 1.0)));
    }

    #[test]
    fn test_transcendental() {
        let x = Dual::variable(0.3);
        assert!(close(x.sin().dual, 0.3f64.cos()));
        assert!(close(x.cos().dual, -0.3f64.sin()));
        assert!(close(x.tan().dual, 1.0 / (0.3f64.cos() * 0.3f64.cos())));
        assert!(close(x.exp().dual, 0.3f64.exp()));
        assert!(close(x.ln().dual, 1.0 / 0.3));
        assert!(close(x.sqrt().dual, 0.5 / 0.3f64.sqrt()));
    }

    #[test]
    fn test_gradient_and_differentiate() {
        // f(x, y) = sin(x) · y + x / y
        let f = |v: &[Dual]| -> Result<Dual> { Ok(v[0].sin() * v[1] + v[0].try_div(v[1])?) };
        let grad = gradient(f, &[1.0, 2.0]).unwrap();
        assert!(close(grad[0], 1f64.cos() * 2.0 + 0.5));
        assert!(close(grad[1], 1f64.sin() - 0.25));

        let df_dy = differentiate(f, 1);
        assert!(close(df_dy(&[1.0, 2.0]).unwrap(), grad[1]));
    }

    #[test]
    fn test_argument_out_of_range() {
        let f = |v: &[Dual]| -> Result<Dual> { Ok(v[0]) };
        assert!(matches!(
            derivative(f, 1, &[1.0]),
            Err(DiffError::ArgumentOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_error_propagates_from_function() {
        let f = |v: &[Dual]| -> Result<Dual> { v[0].rdiv(1.0) };
        assert!(matches!(derivative(f, 0, &[0.0]), Err(DiffError::DivideByZero)));
    }
}
