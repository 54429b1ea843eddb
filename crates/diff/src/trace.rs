//! # Backward Traces
//!
//! A record of one reverse sweep: which nodes were processed, in what
//! order, and the adjoint each one carried when it was processed.
//!
//! Traces are plain data. They serialize with serde, export to JSON and
//! render as a terminal table, so a sweep can be inspected without a
//! debugger.

use adjoint_core::Shape;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tensor::{shape_of, Tensor};

/// One dequeued node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    /// Node name
    pub node: String,
    /// `const`, `var`, or the operation name
    pub kind: String,
    /// Shape of the node value
    pub shape: Shape,
    /// Adjoint at processing time, flattened row-major
    pub adjoint: Vec<f64>,
}

impl TraceStep {
    pub fn new(node: impl Into<String>, kind: impl Into<String>, adjoint: &Tensor) -> Self {
        Self {
            node: node.into(),
            kind: kind.into(),
            shape: shape_of(adjoint),
            adjoint: adjoint.iter().copied().collect(),
        }
    }
}

impl fmt::Display for TraceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node, self.kind)
    }
}

/// Processing order of a reverse sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackwardTrace {
    pub steps: Vec<TraceStep>,
}

impl BackwardTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: TraceStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Node names in processing order.
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.node.as_str()).collect()
    }

    /// Position of a node in the processing order.
    pub fn position(&self, node: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.node == node)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Render the trace as an ASCII table.
    pub fn render_ascii(&self) -> String {
        let mut output = String::new();
        output.push_str("┌─────────────────────────────────────────────────┐\n");
        output.push_str("│                 Backward Trace                  │\n");
        output.push_str("├─────┬──────────────────┬──────────────┬─────────┤\n");

        for (i, step) in self.steps.iter().enumerate() {
            let norm = step.adjoint.iter().map(|g| g * g).sum::<f64>().sqrt();
            output.push_str(&format!(
                "│ {:>3} │ {:16} │ {:12} │ {:>7.3} │\n",
                i + 1,
                step.node.chars().take(16).collect::<String>(),
                format!("{} {}", step.kind, step.shape)
                    .chars()
                    .take(12)
                    .collect::<String>(),
                norm
            ));
        }

        output.push_str("├─────┴──────────────────┴──────────────┴─────────┤\n");
        output.push_str(&format!("│ Steps: {:<41}│\n", self.steps.len()));
        output.push_str("└─────────────────────────────────────────────────┘\n");
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> BackwardTrace {
        let mut trace = BackwardTrace::new();
        trace.push(TraceStep::new("loss", "sum", &crate::tensor::scalar(1.0)));
        trace.push(TraceStep::new("x", "var", &array![[1.0, 1.0]].into_dyn()));
        trace
    }

    #[test]
    fn test_order_and_position() {
        let trace = sample();
        assert_eq!(trace.order(), vec!["loss", "x"]);
        assert_eq!(trace.position("x"), Some(1));
        assert_eq!(trace.steps[1].shape, Shape::matrix(1, 2));
    }

    #[test]
    fn test_json_roundtrip() {
        let trace = sample();
        let json = trace.to_json().unwrap();
        assert!(json.contains("\"node\": \"loss\""));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["steps"][1]["shape"]["dims"], serde_json::json!([1, 2]));
        assert_eq!(parsed["steps"][0]["shape"]["dims"], serde_json::json!([]));
        assert_eq!(BackwardTrace::from_json(&json).unwrap(), trace);
    }

    #[test]
    fn test_render_ascii() {
        let text = sample().render_ascii();
        assert!(text.contains("Backward Trace"));
        assert!(text.contains("loss"));
        assert!(text.contains("Steps: 2"));
    }
}
