//! # Graph Construction
//!
//! This module implements define-by-run graph construction: every builder
//! computes its value immediately and appends a node recording how that
//! value was derived.
//!
//! ## Key Concepts
//!
//! - **Constant**: a leaf that never receives a gradient
//! - **Variable**: a leaf gradients are computed for
//! - **Operation**: an interior node holding an [`Op`] and its operand wires
//! - **Operand**: either an existing handle or a raw value, which is wrapped
//!   into a fresh constant when the node is recorded
//!
//! ## Example
//!
//! ```rust
//! use adjoint_diff::Graph;
//!
//! // f = x * y + x
//! let mut graph = Graph::new();
//! let x = graph.variable(3.0, Some("x")).unwrap();
//! let y = graph.variable(4.0, Some("y")).unwrap();
//! let xy = graph.mul(x, y, None).unwrap();
//! let f = graph.add(xy, x, None).unwrap();
//!
//! assert_eq!(graph.value(f).unwrap().sum(), 15.0);
//! assert_eq!(graph.name(xy).unwrap(), "mul_0");
//!
//! let grads = graph.gradient(f).unwrap();
//! assert_eq!(grads.by_name("x").unwrap().sum(), 5.0);
//! assert_eq!(grads.by_name("y").unwrap().sum(), 3.0);
//! ```

use std::collections::HashMap;
use std::fmt;

use adjoint_core::{CoreError, Diagram, Node, NodeIndex, Shape};
use log::trace;
use ndarray::{Array, Array1, Dimension};

use crate::error::{DiffError, Result};
use crate::ops::Op;
use crate::tensor::{self, shape_of, IntoTensor, Mask, Tensor};

/// Epsilon added to probabilities before taking the log in
/// `softmax_cross_entropy`.
pub const DEFAULT_LOG_EPSILON: f64 = 1e-7;

/// Settings of a graph context.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphConfig {
    /// Added to softmax probabilities before the log
    pub log_epsilon: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            log_epsilon: DEFAULT_LOG_EPSILON,
        }
    }
}

/// What a node is.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Constant,
    Variable,
    Operation(Op),
}

impl NodeKind {
    /// Short label: `const`, `var`, or the operation name.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Constant => "const",
            NodeKind::Variable => "var",
            NodeKind::Operation(op) => op.name(),
        }
    }
}

/// Payload stored in every diagram node.
#[derive(Debug, Clone)]
pub struct Vertex {
    pub kind: NodeKind,
    /// Value fixed at construction
    pub value: Tensor,
    /// Whether any variable flows into this node
    pub requires_grad: bool,
}

/// An operand passed to a builder.
#[derive(Debug, Clone)]
pub enum Operand {
    /// An existing node
    Node(NodeIndex),
    /// A raw value, recorded as a constant
    Value(Tensor),
}

impl From<NodeIndex> for Operand {
    fn from(idx: NodeIndex) -> Self {
        Operand::Node(idx)
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Value(tensor::scalar(value))
    }
}

impl From<Vec<f64>> for Operand {
    fn from(values: Vec<f64>) -> Self {
        Operand::Value(Array1::from(values).into_dyn())
    }
}

impl<D: Dimension> From<Array<f64, D>> for Operand {
    fn from(array: Array<f64, D>) -> Self {
        Operand::Value(array.into_dyn())
    }
}

/// An operand after validation, before anything is inserted.
enum Staged {
    Existing(NodeIndex),
    Fresh(Tensor),
}

/// A define-by-run computation graph.
///
/// Owns the node arena and the per-operation naming counters. Handles
/// returned by the builders are only meaningful for the graph that issued
/// them.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    diagram: Diagram<Vertex>,
    counters: HashMap<&'static str, usize>,
    config: GraphConfig,
}

impl Graph {
    /// Create an empty graph with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: GraphConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    // ========================================================================
    // Leaves
    // ========================================================================

    /// Add a variable leaf.
    pub fn variable(&mut self, value: impl IntoTensor, name: Option<&str>) -> Result<NodeIndex> {
        let name = self.claim_name(NodeKind::Variable.label(), name)?;
        self.leaf(NodeKind::Variable, value.into_tensor(), name)
    }

    /// Add a constant leaf.
    pub fn constant(&mut self, value: impl IntoTensor, name: Option<&str>) -> Result<NodeIndex> {
        let name = self.claim_name(NodeKind::Constant.label(), name)?;
        self.leaf(NodeKind::Constant, value.into_tensor(), name)
    }

    // ========================================================================
    // Elementwise binary operations
    // ========================================================================

    pub fn add(&mut self, a: impl Into<Operand>, b: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.binary(Op::Add, a.into(), b.into(), name)
    }

    pub fn sub(&mut self, a: impl Into<Operand>, b: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.binary(Op::Sub, a.into(), b.into(), name)
    }

    pub fn mul(&mut self, a: impl Into<Operand>, b: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.binary(Op::Mul, a.into(), b.into(), name)
    }

    pub fn div(&mut self, a: impl Into<Operand>, b: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.binary(Op::Div, a.into(), b.into(), name)
    }

    /// Element-wise `a ^ b`.
    pub fn pow(&mut self, a: impl Into<Operand>, b: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.binary(Op::Pow, a.into(), b.into(), name)
    }

    /// Matrix/vector product of rank-1 or rank-2 operands.
    pub fn dot(&mut self, a: impl Into<Operand>, b: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.binary(Op::Dot, a.into(), b.into(), name)
    }

    /// Select from `a` where `condition` holds and from `b` elsewhere.
    ///
    /// Raw scalar branches are filled to the condition's shape. The stored
    /// mask is broadcast to the output shape.
    pub fn where_(
        &mut self,
        condition: &Mask,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
        name: Option<&str>,
    ) -> Result<NodeIndex> {
        let cond_shape = shape_of(condition);
        let a = self.stage_branch(a.into(), &cond_shape)?;
        let b = self.stage_branch(b.into(), &cond_shape)?;

        let out = cond_shape
            .broadcast_with(&shape_of(self.staged_value(&a)?))?
            .broadcast_with(&shape_of(self.staged_value(&b)?))?;
        let mask = tensor::broadcast_to(condition, &out)?;

        self.record(Op::Where { mask }, vec![a, b], name)
    }

    // ========================================================================
    // Unary operations
    // ========================================================================

    /// Reverse all axes.
    pub fn transpose(&mut self, x: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.unary(Op::Transpose, x.into(), name)
    }

    /// Sum along `axis`, or over all elements when `None`.
    pub fn sum(
        &mut self,
        x: impl Into<Operand>,
        axis: Option<usize>,
        keepdims: bool,
        name: Option<&str>,
    ) -> Result<NodeIndex> {
        self.unary(Op::Sum { axis, keepdims }, x.into(), name)
    }

    /// Mean along `axis`, or over all elements when `None`.
    pub fn mean(&mut self, x: impl Into<Operand>, axis: Option<usize>, name: Option<&str>) -> Result<NodeIndex> {
        self.unary(Op::Mean { axis }, x.into(), name)
    }

    pub fn exp(&mut self, x: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.unary(Op::Exp, x.into(), name)
    }

    /// Natural logarithm.
    pub fn log(&mut self, x: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.unary(Op::Log, x.into(), name)
    }

    pub fn sin(&mut self, x: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.unary(Op::Sin, x.into(), name)
    }

    pub fn cos(&mut self, x: impl Into<Operand>, name: Option<&str>) -> Result<NodeIndex> {
        self.unary(Op::Cos, x.into(), name)
    }

    /// Maximum along `axis`, or over all elements when `None`.
    pub fn max(
        &mut self,
        x: impl Into<Operand>,
        axis: Option<usize>,
        keepdims: bool,
        name: Option<&str>,
    ) -> Result<NodeIndex> {
        let x = self.stage(x.into())?;
        let maxima = tensor::max(self.staged_value(&x)?, axis, true)?;
        let op = Op::Max {
            axis,
            keepdims,
            maxima,
        };
        self.record(op, vec![x], name)
    }

    /// Reshape (row-major) into `shape`.
    pub fn reshape(&mut self, x: impl Into<Operand>, shape: &[usize], name: Option<&str>) -> Result<NodeIndex> {
        let op = Op::Reshape {
            shape: shape.to_vec(),
        };
        self.unary(op, x.into(), name)
    }

    /// Remove length-1 axes: all of them, or only `axis`.
    pub fn squeeze(&mut self, x: impl Into<Operand>, axis: Option<usize>, name: Option<&str>) -> Result<NodeIndex> {
        self.unary(Op::Squeeze { axis }, x.into(), name)
    }

    /// Scalar cross entropy of row-wise softmax probabilities against
    /// `labels`, summed over the batch.
    ///
    /// `logits` must be `[batch, classes]` and `labels` the same shape. The
    /// labels are read once and do not become an operand, so they never
    /// receive a gradient.
    pub fn softmax_cross_entropy(
        &mut self,
        logits: impl Into<Operand>,
        labels: impl Into<Operand>,
        name: Option<&str>,
    ) -> Result<NodeIndex> {
        let logits = self.stage(logits.into())?;
        let labels = match self.stage(labels.into())? {
            Staged::Existing(idx) => self.value(idx)?.clone(),
            Staged::Fresh(value) => value,
        };

        let values = self.staged_value(&logits)?;
        let probs = tensor::softmax_rows(values)?;
        if labels.shape() != values.shape() {
            return Err(CoreError::ShapeMismatch {
                expected: shape_of(values),
                got: shape_of(&labels),
            }
            .into());
        }

        let op = Op::SoftmaxCrossEntropy {
            probs,
            labels,
            epsilon: self.config.log_epsilon,
        };
        self.record(op, vec![logits], name)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Value of a node.
    pub fn value(&self, idx: NodeIndex) -> Result<&Tensor> {
        Ok(&self.diagram.node(idx)?.data.value)
    }

    pub fn shape(&self, idx: NodeIndex) -> Result<&Shape> {
        Ok(&self.diagram.node(idx)?.shape)
    }

    pub fn name(&self, idx: NodeIndex) -> Result<&str> {
        Ok(&self.diagram.node(idx)?.name)
    }

    pub fn kind(&self, idx: NodeIndex) -> Result<&NodeKind> {
        Ok(&self.diagram.node(idx)?.data.kind)
    }

    pub fn requires_grad(&self, idx: NodeIndex) -> Result<bool> {
        Ok(self.diagram.node(idx)?.data.requires_grad)
    }

    /// Find a node by name.
    pub fn lookup(&self, name: &str) -> Option<NodeIndex> {
        self.diagram.lookup(name)
    }

    /// Operand handles of a node, in port order.
    pub fn operands(&self, idx: NodeIndex) -> Result<Vec<NodeIndex>> {
        self.diagram.check(idx)?;
        Ok(self.diagram.operands(idx))
    }

    pub fn node_count(&self) -> usize {
        self.diagram.node_count()
    }

    /// The underlying arena.
    pub fn diagram(&self) -> &Diagram<Vertex> {
        &self.diagram
    }

    // ========================================================================
    // Recording
    // ========================================================================

    fn leaf(&mut self, kind: NodeKind, value: Tensor, name: String) -> Result<NodeIndex> {
        let requires_grad = kind == NodeKind::Variable;
        let node = Node::new(
            name,
            shape_of(&value),
            Vertex {
                kind,
                value,
                requires_grad,
            },
        );
        let idx = self.diagram.add_node(node, &[])?;
        trace!("leaf {} {}", self.diagram.graph()[idx].name, self.diagram.graph()[idx].shape);
        Ok(idx)
    }

    fn unary(&mut self, op: Op, x: Operand, name: Option<&str>) -> Result<NodeIndex> {
        let x = self.stage(x)?;
        self.record(op, vec![x], name)
    }

    fn binary(&mut self, op: Op, a: Operand, b: Operand, name: Option<&str>) -> Result<NodeIndex> {
        let a = self.stage(a)?;
        let b = self.stage(b)?;
        self.record(op, vec![a, b], name)
    }

    /// Validate an operand without inserting anything.
    fn stage(&self, operand: Operand) -> Result<Staged> {
        match operand {
            Operand::Node(idx) => Ok(Staged::Existing(self.diagram.check(idx)?)),
            Operand::Value(value) => Ok(Staged::Fresh(value)),
        }
    }

    /// Stage a `where` branch, filling raw scalars to the condition's shape.
    fn stage_branch(&self, operand: Operand, shape: &Shape) -> Result<Staged> {
        match self.stage(operand)? {
            Staged::Fresh(value) if value.ndim() == 0 => {
                Ok(Staged::Fresh(tensor::broadcast_to(&value, shape)?))
            }
            staged => Ok(staged),
        }
    }

    fn staged_value<'a>(&'a self, staged: &'a Staged) -> Result<&'a Tensor> {
        match staged {
            Staged::Existing(idx) => self.value(*idx),
            Staged::Fresh(value) => Ok(value),
        }
    }

    /// Compute `op` over staged operands and append the result.
    ///
    /// Nothing is inserted unless the forward computation succeeds and the
    /// output name is claimed; only then are raw operands committed as
    /// constants, under names that skip the claimed one.
    fn record(&mut self, op: Op, staged: Vec<Staged>, name: Option<&str>) -> Result<NodeIndex> {
        let value = {
            let a = staged
                .first()
                .map(|s| self.staged_value(s))
                .transpose()?
                .ok_or(DiffError::MissingOperand { op: op.name() })?;
            let b = staged.get(1).map(|s| self.staged_value(s)).transpose()?;
            let expected = op.output_shape(&shape_of(a), b.map(shape_of).as_ref())?;
            let value = op.forward(a, b)?;
            debug_assert_eq!(shape_of(&value), expected);
            value
        };
        let name = self.claim_name(op.name(), name)?;

        let mut operands = Vec::with_capacity(staged.len());
        for s in staged {
            operands.push(match s {
                Staged::Existing(idx) => idx,
                Staged::Fresh(value) => {
                    let const_name = self.generate_name(NodeKind::Constant.label(), Some(&name));
                    self.leaf(NodeKind::Constant, value, const_name)?
                }
            });
        }

        let requires_grad = operands
            .iter()
            .any(|&idx| self.diagram.graph()[idx].data.requires_grad);
        trace!("{} = {} -> {}", name, op, shape_of(&value));

        let node = Node::new(
            name,
            shape_of(&value),
            Vertex {
                kind: NodeKind::Operation(op),
                value,
                requires_grad,
            },
        );
        Ok(self.diagram.add_node(node, &operands)?)
    }

    /// Use the explicit name if free, else generate `<prefix>_<n>`.
    fn claim_name(&mut self, prefix: &'static str, name: Option<&str>) -> Result<String> {
        if let Some(name) = name {
            if self.diagram.has_name(name) {
                return Err(CoreError::DuplicateName {
                    name: name.to_string(),
                }
                .into());
            }
            return Ok(name.to_string());
        }
        Ok(self.generate_name(prefix, None))
    }

    /// Next free `<prefix>_<n>`, also skipping `reserved`.
    fn generate_name(&mut self, prefix: &'static str, reserved: Option<&str>) -> String {
        let counter = self.counters.entry(prefix).or_insert(0);
        loop {
            let candidate = format!("{}_{}", prefix, counter);
            *counter += 1;
            if !self.diagram.has_name(&candidate) && reserved != Some(candidate.as_str()) {
                return candidate;
            }
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph({} nodes)", self.node_count())?;
        for idx in self.diagram.node_indices() {
            let node = &self.diagram.graph()[idx];
            let operands: Vec<&str> = self
                .diagram
                .operands(idx)
                .into_iter()
                .map(|op| self.diagram.graph()[op].name.as_str())
                .collect();
            match &node.data.kind {
                NodeKind::Operation(op) => {
                    writeln!(f, "  {} {} = {}({})", node.name, node.shape, op, operands.join(", "))?
                }
                kind => writeln!(f, "  {} {} {}", node.name, node.shape, kind.label())?,
            }
        }
        Ok(())
    }
}
