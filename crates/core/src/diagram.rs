//! # Diagrams - Append-Only Computation Graphs
//!
//! A diagram records how values were derived: every node is either a leaf or
//! the result of an operation applied to earlier nodes. Operands are wired in
//! by edges pointing from operand to consumer, tagged with the operand port.
//!
//! ## Key Concepts
//!
//! - **Node**: a named, shaped vertex carrying a domain payload `O`
//! - **Edge**: a wire from an operand into port `k` of its consumer
//! - **Diagram**: an arena (`petgraph::DiGraph`) that only ever grows
//!
//! Nodes are referenced by `NodeIndex` handles. A node can only be inserted
//! with operands that already exist, so every edge points from an older slot
//! to a newer one and the diagram is acyclic by construction.
//!
//! ```text
//!    x ──port 0──┐
//!                ├──▶ mul ──port 0──┐
//!    y ──port 1──┘                  ├──▶ add
//!    x ─────────────────port 1──────┘
//! ```

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;
use std::fmt;

use crate::error::CoreError;
use crate::shape::Shape;

/// A node in the diagram, parameterized by its payload type.
///
/// The generic `O` lets the differentiation layer attach values, operation
/// tags and gradient bookkeeping without this crate knowing about arrays.
#[derive(Debug, Clone)]
pub struct Node<O> {
    /// Unique name within the diagram
    pub name: String,
    /// Shape of the value this node produces
    pub shape: Shape,
    /// Domain payload
    pub data: O,
}

impl<O> Node<O> {
    pub fn new(name: impl Into<String>, shape: Shape, data: O) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }
}

/// A wire from an operand into one of its consumer's operand ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Operand position on the consumer (0 = first operand)
    pub port: usize,
}

impl Edge {
    pub fn new(port: usize) -> Self {
        Self { port }
    }
}

/// An append-only directed acyclic graph of named nodes.
#[derive(Debug, Clone)]
pub struct Diagram<O> {
    graph: DiGraph<Node<O>, Edge>,
    names: HashMap<String, NodeIndex>,
}

impl<O> Diagram<O> {
    /// Create a new empty diagram.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            names: HashMap::new(),
        }
    }

    /// Insert a node wired to `operands` (in port order), returning its handle.
    ///
    /// Fails without modifying the diagram if the name is taken or an
    /// operand handle is unknown.
    pub fn add_node(&mut self, node: Node<O>, operands: &[NodeIndex]) -> Result<NodeIndex, CoreError> {
        if self.names.contains_key(&node.name) {
            return Err(CoreError::DuplicateName { name: node.name });
        }
        for &operand in operands {
            self.check(operand)?;
        }

        let name = node.name.clone();
        let idx = self.graph.add_node(node);
        for (port, &operand) in operands.iter().enumerate() {
            self.graph.add_edge(operand, idx, Edge::new(port));
        }
        self.names.insert(name, idx);

        Ok(idx)
    }

    /// Check that a handle belongs to this diagram.
    pub fn check(&self, idx: NodeIndex) -> Result<NodeIndex, CoreError> {
        if self.contains(idx) {
            Ok(idx)
        } else {
            Err(CoreError::UnknownNode { index: idx.index() })
        }
    }

    /// Whether the handle belongs to this diagram.
    pub fn contains(&self, idx: NodeIndex) -> bool {
        idx.index() < self.graph.node_count()
    }

    /// Look up a node by handle.
    pub fn node(&self, idx: NodeIndex) -> Result<&Node<O>, CoreError> {
        self.graph
            .node_weight(idx)
            .ok_or(CoreError::UnknownNode { index: idx.index() })
    }

    /// Find a node's handle by name.
    pub fn lookup(&self, name: &str) -> Option<NodeIndex> {
        self.names.get(name).copied()
    }

    /// Whether a node with this name exists.
    pub fn has_name(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Operands of a node, ordered by port.
    ///
    /// The same handle appears twice when a node consumes one operand on
    /// both ports (e.g. `x * x`).
    pub fn operands(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut wired: Vec<(usize, NodeIndex)> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|edge| (edge.weight().port, edge.source()))
            .collect();
        wired.sort_by_key(|(port, _)| *port);
        wired.into_iter().map(|(_, source)| source).collect()
    }

    /// Count, for every node reachable from `root` through operand wires,
    /// how many wires from reachable consumers point at it.
    ///
    /// Only operands accepted by `follow` are walked and counted. The root
    /// itself is always present with a count of zero. A reverse sweep that
    /// processes a node only once its count has dropped to zero visits
    /// nodes in reverse topological order.
    pub fn pending_consumers<F>(&self, root: NodeIndex, follow: F) -> Result<HashMap<NodeIndex, usize>, CoreError>
    where
        F: Fn(NodeIndex, &Node<O>) -> bool,
    {
        self.check(root)?;

        let mut counts: HashMap<NodeIndex, usize> = HashMap::new();
        counts.insert(root, 0);
        let mut stack = vec![root];

        while let Some(idx) = stack.pop() {
            for operand in self.operands(idx) {
                if !follow(operand, &self.graph[operand]) {
                    continue;
                }
                let count = counts.entry(operand).or_insert(0);
                if *count == 0 {
                    // First wire seen into this operand: walk it once.
                    stack.push(operand);
                }
                *count += 1;
            }
        }

        Ok(counts)
    }

    /// Handles in insertion order.
    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Read-only access to the underlying graph.
    pub fn graph(&self) -> &DiGraph<Node<O>, Edge> {
        &self.graph
    }

    /// Number of nodes in the diagram.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges in the diagram.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl<O> Default for Diagram<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> fmt::Display for Diagram<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Diagram({} nodes, {} edges)",
            self.node_count(),
            self.edge_count()
        )?;
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            let operands: Vec<&str> = self
                .operands(idx)
                .into_iter()
                .map(|op| self.graph[op].name.as_str())
                .collect();
            if operands.is_empty() {
                writeln!(f, "  {} {}", node.name, node.shape)?;
            } else {
                writeln!(f, "  {} {} <- {}", node.name, node.shape, operands.join(", "))?;
            }
        }
        Ok(())
    }
}
