//! # Backward Pass - Reverse-Mode Autodiff
//!
//! This module implements the reverse sweep over a recorded graph. One call
//! to [`gradient`] from a single output yields the derivative of that output
//! with respect to every variable it depends on.
//!
//! ## Ordering
//!
//! A node may only hand its adjoint to its operands once every consumer has
//! contributed to it. Before the sweep, the engine counts for each reachable
//! node how many wires from reachable consumers point at it; a node enters
//! the queue when that count reaches zero. Diamonds therefore accumulate
//! every path:
//!
//! ```text
//!        x
//!       / \
//!    long  |        x is processed after both `long` and `out`
//!       \ /         have contributed, never in between.
//!       out
//! ```
//!
//! ## Example
//!
//! ```rust
//! use adjoint_diff::Graph;
//! use ndarray::array;
//!
//! // loss = sum(x * x)
//! let mut graph = Graph::new();
//! let x = graph.variable(array![1.0, 2.0, 3.0], Some("x")).unwrap();
//! let sq = graph.mul(x, x, None).unwrap();
//! let loss = graph.sum(sq, None, false, None).unwrap();
//!
//! let grads = graph.gradient(loss).unwrap();
//! assert_eq!(grads.get(x).unwrap(), &array![2.0, 4.0, 6.0].into_dyn());
//! ```

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

use adjoint_core::NodeIndex;
use log::debug;

use crate::broadcast::unbroadcast;
use crate::error::Result;
use crate::graph::{Graph, NodeKind};
use crate::tensor::Tensor;
use crate::trace::{BackwardTrace, TraceStep};

/// Gradients of one output with respect to the variables it depends on.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: HashMap<NodeIndex, Tensor>,
    names: HashMap<String, NodeIndex>,
}

impl Gradients {
    fn insert(&mut self, idx: NodeIndex, name: String, grad: Tensor) {
        self.names.insert(name, idx);
        self.grads.insert(idx, grad);
    }

    /// Gradient for a variable handle.
    pub fn get(&self, idx: NodeIndex) -> Option<&Tensor> {
        self.grads.get(&idx)
    }

    /// Gradient for a variable name.
    pub fn by_name(&self, name: &str) -> Option<&Tensor> {
        self.names.get(name).and_then(|idx| self.grads.get(idx))
    }

    pub fn contains(&self, idx: NodeIndex) -> bool {
        self.grads.contains_key(&idx)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Iterate `(name, gradient)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> + '_ {
        self.names
            .iter()
            .filter_map(|(name, idx)| self.grads.get(idx).map(|g| (name.as_str(), g)))
    }

    /// Consume into a map keyed by variable name.
    pub fn into_named(self) -> HashMap<String, Tensor> {
        let mut grads = self.grads;
        self.names
            .into_iter()
            .filter_map(|(name, idx)| grads.remove(&idx).map(|g| (name, g)))
            .collect()
    }
}

/// Differentiate `output` with respect to every variable it depends on.
///
/// The output's adjoint is seeded with ones of its shape, so a non-scalar
/// output yields the gradient of the sum of its elements.
pub fn gradient(graph: &Graph, output: NodeIndex) -> Result<Gradients> {
    sweep(graph, output, None)
}

/// Like [`gradient`], also recording the processing order.
pub fn gradient_traced(graph: &Graph, output: NodeIndex) -> Result<(Gradients, BackwardTrace)> {
    let mut trace = BackwardTrace::new();
    let grads = sweep(graph, output, Some(&mut trace))?;
    Ok((grads, trace))
}

fn sweep(graph: &Graph, output: NodeIndex, mut trace: Option<&mut BackwardTrace>) -> Result<Gradients> {
    let diagram = graph.diagram();
    let root = diagram.node(output)?;

    let mut pending = diagram.pending_consumers(output, |_, node| node.data.requires_grad)?;
    debug!(
        "backward from {} {} over {} nodes",
        root.name,
        root.shape,
        pending.len()
    );

    let mut adjoints: HashMap<NodeIndex, Tensor> = HashMap::new();
    adjoints.insert(output, Tensor::ones(root.data.value.raw_dim()));
    let mut queue = VecDeque::from([output]);
    let mut enqueued = HashSet::from([output]);
    let mut gradients = Gradients::default();

    while let Some(idx) = queue.pop_front() {
        let node = diagram.node(idx)?;
        let adjoint = adjoints
            .remove(&idx)
            .unwrap_or_else(|| Tensor::zeros(node.data.value.raw_dim()));

        if let Some(trace) = trace.as_deref_mut() {
            trace.push(TraceStep::new(node.name.as_str(), node.data.kind.label(), &adjoint));
        }

        let op = match &node.data.kind {
            NodeKind::Constant => continue,
            NodeKind::Variable => {
                gradients.insert(idx, node.name.clone(), adjoint);
                continue;
            }
            NodeKind::Operation(op) => op,
        };

        let operands = diagram.operands(idx);
        let mut values = Vec::with_capacity(operands.len());
        for &operand in &operands {
            values.push(&diagram.node(operand)?.data.value);
        }
        let (Some(&a), b) = (values.first(), values.get(1).copied()) else {
            continue;
        };

        let (grad_a, grad_b) = op.vjp(&adjoint, &node.data.value, a, b)?;
        let contributions = operands.iter().copied().zip([Some(grad_a), grad_b]);

        for (operand, contribution) in contributions {
            let Some(contribution) = contribution else {
                continue;
            };
            let target = diagram.node(operand)?;
            if !target.data.requires_grad {
                continue;
            }

            let contribution = unbroadcast(contribution, &target.shape)?;
            match adjoints.entry(operand) {
                Entry::Occupied(mut entry) => *entry.get_mut() += &contribution,
                Entry::Vacant(entry) => {
                    entry.insert(contribution);
                }
            }

            if let Some(count) = pending.get_mut(&operand) {
                *count = count.saturating_sub(1);
                if *count == 0 && enqueued.insert(operand) {
                    queue.push_back(operand);
                }
            }
        }
    }

    debug!("backward produced {} gradients", gradients.len());
    Ok(gradients)
}

impl Graph {
    /// Differentiate `output` with respect to every variable it depends on.
    pub fn gradient(&self, output: NodeIndex) -> Result<Gradients> {
        gradient(self, output)
    }

    /// Differentiate and record the processing order.
    pub fn gradient_traced(&self, output: NodeIndex) -> Result<(Gradients, BackwardTrace)> {
        gradient_traced(self, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_scalar_chain() {
        // f = x * y + x at x=3, y=4
        let mut graph = Graph::new();
        let x = graph.variable(3.0, Some("x")).unwrap();
        let y = graph.variable(4.0, Some("y")).unwrap();
        let xy = graph.mul(x, y, None).unwrap();
        let f = graph.add(xy, x, None).unwrap();

        let grads = graph.gradient(f).unwrap();
        assert_eq!(grads.len(), 2);
        assert_eq!(grads.get(x).unwrap().sum(), 5.0);
        assert_eq!(grads.get(y).unwrap().sum(), 3.0);
    }

    #[test]
    fn test_same_operand_on_both_ports() {
        let mut graph = Graph::new();
        let x = graph.variable(vec![1.0, 2.0], Some("x")).unwrap();
        let twice = graph.add(x, x, None).unwrap();
        let s = graph.sum(twice, None, false, None).unwrap();

        let grads = graph.gradient(s).unwrap();
        assert_eq!(grads.by_name("x").unwrap(), &array![2.0, 2.0].into_dyn());
    }

    #[test]
    fn test_constants_get_no_gradient() {
        let mut graph = Graph::new();
        let x = graph.variable(2.0, Some("x")).unwrap();
        let c = graph.constant(5.0, Some("c")).unwrap();
        let y = graph.mul(x, c, None).unwrap();

        let grads = graph.gradient(y).unwrap();
        assert_eq!(grads.get(x).unwrap().sum(), 5.0);
        assert!(grads.get(c).is_none());
        assert!(grads.by_name("c").is_none());
    }

    #[test]
    fn test_output_variable_gets_ones() {
        let mut graph = Graph::new();
        let x = graph.variable(array![[1.0, 2.0]], Some("x")).unwrap();
        let grads = graph.gradient(x).unwrap();
        assert_eq!(grads.get(x).unwrap(), &array![[1.0, 1.0]].into_dyn());
    }

    #[test]
    fn test_unreachable_variables_absent() {
        let mut graph = Graph::new();
        let x = graph.variable(1.0, Some("x")).unwrap();
        let unused = graph.variable(1.0, Some("unused")).unwrap();
        let y = graph.exp(x, None).unwrap();

        let grads = graph.gradient(y).unwrap();
        assert!(grads.contains(x));
        assert!(!grads.contains(unused));
    }

    #[test]
    fn test_into_named() {
        let mut graph = Graph::new();
        let x = graph.variable(1.0, Some("x")).unwrap();
        let y = graph.variable(2.0, Some("y")).unwrap();
        let z = graph.sub(x, y, None).unwrap();

        let named = graph.gradient(z).unwrap().into_named();
        assert_eq!(named["x"].sum(), 1.0);
        assert_eq!(named["y"].sum(), -1.0);
    }

    #[test]
    fn test_unknown_output() {
        let graph = Graph::new();
        assert!(graph.gradient(NodeIndex::new(3)).is_err());
    }
}
