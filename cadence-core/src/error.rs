//! Error types.
//!
//! Three families of failure reach the caller of a run:
//!
//! - wiring and configuration errors, raised while a graph is being built;
//! - scheduling invariant violations, raised when the engine detects that
//!   time has run backwards for some part of the graph;
//! - node evaluation errors, captured into a structured [`NodeError`] that
//!   records where in the graph the failure happened and which inputs were
//!   active at the time.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An invalid edge, path or builder was supplied at construction time.
    #[error("wiring error: {0}")]
    Wiring(String),

    /// The run configuration is not usable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A scheduling invariant was violated (for example a clock regression).
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// A component was asked to move to a lifecycle state it cannot reach.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// A handle referred to a cell that has already been released.
    #[error("stale handle: {0}")]
    StaleHandle(String),

    /// An operation was applied to a time-series of the wrong kind.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Mesh instances introduced a circular dependency.
    #[error("dependency cycle in mesh `{context}`: {from} -> {to}")]
    MeshCycle {
        context: String,
        from: String,
        to: String,
    },

    /// Raised by node logic while computing.
    #[error("{0}")]
    Evaluation(String),

    /// A node evaluation failure, with the graph context attached.
    #[error(transparent)]
    Node(Box<NodeError>),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Shorthand for an error raised by node logic.
    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn wiring(msg: impl Into<String>) -> Self {
        Self::Wiring(msg.into())
    }

    pub fn scheduling(msg: impl Into<String>) -> Self {
        Self::Scheduling(msg.into())
    }

    /// Engine invariant violations. These abort the run even from nodes
    /// that capture their errors.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Wiring(_)
                | Self::Configuration(_)
                | Self::Scheduling(_)
                | Self::Lifecycle(_)
                | Self::StaleHandle(_)
        )
    }

    /// The captured node error, if this is one.
    pub fn as_node_error(&self) -> Option<&NodeError> {
        match self {
            Self::Node(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<NodeError> for EngineError {
    fn from(e: NodeError) -> Self {
        Self::Node(Box::new(e))
    }
}

/// A failure raised while evaluating a node, with its location in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeError {
    /// Name of the failing node's signature.
    pub signature_name: String,
    /// Optional user-supplied label of the node.
    pub label: Option<String>,
    /// Graph path of the node, e.g. `[0, 3, 1]:7`.
    pub wiring_path: String,
    /// Human-readable description of the failure.
    pub error_msg: String,
    /// Chain of nested failures, innermost last.
    pub stack_trace: Vec<String>,
    /// Which inputs were active when the node failed.
    pub activation_back_trace: BackTrace,
    /// Lifecycle phase or other context, e.g. "During evaluation".
    pub additional_context: Option<String>,
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.wiring_path, self.signature_name)?;
        if let Some(label) = &self.label {
            write!(f, " ({label})")?;
        }
        write!(f, ": {}", self.error_msg)?;
        if let Some(ctx) = &self.additional_context {
            write!(f, " [{ctx}]")?;
        }
        for cause in &self.stack_trace {
            write!(f, "\n  caused by: {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for NodeError {}

/// Recursive description of the inputs implicated in a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackTrace {
    pub signature_name: Option<String>,
    pub wiring_path: Option<String>,
    pub inputs: Vec<InputTrace>,
}

/// State of one input at the time of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputTrace {
    pub name: String,
    pub active: bool,
    pub modified: bool,
    pub valid: bool,
    /// Rendered value, only present when value capture is enabled.
    pub value: Option<String>,
    /// The node producing this input, when it was modified this cycle.
    pub upstream: Option<Box<BackTrace>>,
}

impl BackTrace {
    /// Inputs that ticked in the failing cycle.
    pub fn modified_inputs(&self) -> impl Iterator<Item = &InputTrace> {
        self.inputs.iter().filter(|i| i.modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_error() -> NodeError {
        NodeError {
            signature_name: "divide".into(),
            label: Some("ratio".into()),
            wiring_path: "[]:2".into(),
            error_msg: "division by zero".into(),
            stack_trace: vec!["inner failure".into()],
            activation_back_trace: BackTrace::default(),
            additional_context: Some("During evaluation".into()),
        }
    }

    #[test]
    fn node_error_display_includes_context() {
        let text = sample_error().to_string();
        assert!(text.starts_with("[[]:2] divide (ratio): division by zero"));
        assert!(text.contains("During evaluation"));
        assert!(text.contains("caused by: inner failure"));
    }

    #[test]
    fn node_error_converts_into_engine_error() {
        let err: EngineError = sample_error().into();
        assert_eq!(err.as_node_error().map(|e| e.error_msg.as_str()), Some("division by zero"));
    }

    #[test]
    fn node_error_serializes() {
        let json = serde_json::to_string(&sample_error()).unwrap();
        let back: NodeError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample_error());
    }
}
