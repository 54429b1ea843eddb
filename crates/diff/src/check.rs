//! # Gradient Checking
//!
//! Finite differences as an oracle for analytical derivatives.
//!
//! - [`check_derivative`] / [`check_gradient`] compare a suspected
//!   derivative of a plain scalar function using forward differences.
//! - [`grad_check`] rebuilds a graph with perturbed inputs and compares every
//!   element of every gradient the reverse sweep produced, using central
//!   differences.
//!
//! A value is accepted when `|suspect - approx| <= atol + rtol * |approx|`.

use adjoint_core::{CoreError, NodeIndex, Shape};
use ndarray::ArrayD;
use thiserror::Error;

use crate::error::{DiffError, Result};
use crate::graph::Graph;
use crate::tensor::{shape_of, Tensor};

/// Default finite-difference step.
pub const DEFAULT_STEP: f64 = 1e-7;
/// Default relative tolerance.
pub const DEFAULT_RTOL: f64 = 1e-5;
/// Default absolute tolerance.
pub const DEFAULT_ATOL: f64 = 1e-8;

/// Step and tolerances of a finite-difference check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradCheckConfig {
    pub step: f64,
    pub rtol: f64,
    pub atol: f64,
}

impl Default for GradCheckConfig {
    fn default() -> Self {
        Self {
            step: DEFAULT_STEP,
            rtol: DEFAULT_RTOL,
            atol: DEFAULT_ATOL,
        }
    }
}

impl GradCheckConfig {
    /// Settings suited to central differences over whole tensors.
    pub fn central() -> Self {
        Self {
            step: 1e-6,
            rtol: 1e-4,
            atol: 1e-6,
        }
    }

    /// Whether `suspect` agrees with the approximation `approx`.
    pub fn accepts(&self, suspect: f64, approx: f64) -> bool {
        (suspect - approx).abs() <= self.atol + self.rtol * approx.abs()
    }

    /// Check `suspect` against the forward difference of `fx` in argument
    /// `wrt`.
    pub fn check_derivative<F>(&self, fx: F, wrt: usize, args: &[f64], suspect: f64) -> Result<bool>
    where
        F: Fn(&[f64]) -> f64,
    {
        Ok(self.accepts(suspect, self.forward_difference(&fx, wrt, args)?))
    }

    /// Check every partial derivative of `fx` at `args`.
    pub fn check_gradient<F>(&self, fx: F, args: &[f64], suspect: &[f64]) -> Result<bool>
    where
        F: Fn(&[f64]) -> f64,
    {
        if suspect.len() != args.len() {
            return Err(CoreError::ShapeMismatch {
                expected: Shape::vector(args.len()),
                got: Shape::vector(suspect.len()),
            }
            .into());
        }
        for (wrt, &s) in suspect.iter().enumerate() {
            if !self.accepts(s, self.forward_difference(&fx, wrt, args)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn forward_difference<F>(&self, fx: &F, wrt: usize, args: &[f64]) -> Result<f64>
    where
        F: Fn(&[f64]) -> f64,
    {
        if wrt >= args.len() {
            return Err(DiffError::ArgumentOutOfRange {
                index: wrt,
                len: args.len(),
            });
        }
        let mut shifted = args.to_vec();
        shifted[wrt] += self.step;
        Ok((fx(shifted.as_slice()) - fx(args)) / self.step)
    }
}

/// Check a suspected partial derivative with the default settings.
pub fn check_derivative<F>(fx: F, wrt: usize, args: &[f64], suspect: f64) -> Result<bool>
where
    F: Fn(&[f64]) -> f64,
{
    GradCheckConfig::default().check_derivative(fx, wrt, args, suspect)
}

/// Check a suspected gradient with the default settings.
pub fn check_gradient<F>(fx: F, args: &[f64], suspect: &[f64]) -> Result<bool>
where
    F: Fn(&[f64]) -> f64,
{
    GradCheckConfig::default().check_gradient(fx, args, suspect)
}

/// Central-difference gradient of a scalar function of one tensor.
pub fn numerical_gradient<F>(mut f: F, x: &Tensor, step: f64) -> Result<Tensor>
where
    F: FnMut(&Tensor) -> Result<f64>,
{
    let flat: Vec<f64> = x.iter().copied().collect();
    let mut grads = Vec::with_capacity(flat.len());

    for i in 0..flat.len() {
        let mut plus = flat.clone();
        let mut minus = flat.clone();
        plus[i] += step;
        minus[i] -= step;

        let f_plus = f(&ArrayD::from_shape_vec(x.raw_dim(), plus)?)?;
        let f_minus = f(&ArrayD::from_shape_vec(x.raw_dim(), minus)?)?;
        grads.push((f_plus - f_minus) / (2.0 * step));
    }

    Ok(ArrayD::from_shape_vec(x.raw_dim(), grads)?)
}

/// Error from gradient checking.
#[derive(Debug, Clone, Error)]
pub enum GradCheckError {
    #[error("Gradient mismatch at input[{input}][{index}]: analytical={analytical}, numerical={numerical}")]
    Mismatch {
        input: usize,
        index: usize,
        analytical: f64,
        numerical: f64,
    },

    #[error("Gradient check needs a scalar output, got shape {shape}")]
    NonScalarOutput { shape: Shape },

    #[error(transparent)]
    Graph(#[from] DiffError),
}

/// Build a fresh graph over `inputs` (as variables `input_0`, `input_1`, ...).
fn evaluate<B>(build: &B, inputs: &[Tensor]) -> Result<(Graph, Vec<NodeIndex>, NodeIndex)>
where
    B: Fn(&mut Graph, &[NodeIndex]) -> Result<NodeIndex>,
{
    let mut graph = Graph::new();
    let mut vars = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        vars.push(graph.variable(input.clone(), Some(&format!("input_{}", i)))?);
    }
    let output = build(&mut graph, vars.as_slice())?;
    Ok((graph, vars, output))
}

/// Check the reverse sweep against central differences.
///
/// `build` receives a fresh graph and one variable handle per input and
/// returns a scalar output. It is called once for the analytical gradients
/// and twice per input element for the numerical ones.
pub fn grad_check<B>(build: B, inputs: &[Tensor], config: &GradCheckConfig) -> std::result::Result<(), GradCheckError>
where
    B: Fn(&mut Graph, &[NodeIndex]) -> Result<NodeIndex>,
{
    let (graph, vars, output) = evaluate(&build, inputs)?;
    let value = graph.value(output)?;
    if value.len() != 1 {
        return Err(GradCheckError::NonScalarOutput {
            shape: shape_of(value),
        });
    }
    let analytical = graph.gradient(output)?;

    for (input, (&var, x)) in vars.iter().zip(inputs).enumerate() {
        // Inputs the output does not depend on have a zero gradient.
        let grad = analytical
            .get(var)
            .cloned()
            .unwrap_or_else(|| Tensor::zeros(x.raw_dim()));

        let numerical = numerical_gradient(
            |probe| {
                let mut perturbed = inputs.to_vec();
                perturbed[input] = probe.clone();
                let (graph, _, output) = evaluate(&build, &perturbed)?;
                Ok(graph.value(output)?.sum())
            },
            x,
            config.step,
        )?;

        for (index, (&a, &n)) in grad.iter().zip(numerical.iter()).enumerate() {
            if !config.accepts(a, n) {
                return Err(GradCheckError::Mismatch {
                    input,
                    index,
                    analytical: a,
                    numerical: n,
                });
            }
        }
    }

    Ok(())
}
