//! Node signatures.
//!
//! A signature is the static description of a node: its name, its arguments
//! and which of them drive evaluation. It is shared (behind an `Arc`) by every
//! instance built from the same builder.

use std::fmt;

/// The role a node plays in a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Receives values from outside the engine, possibly from another thread.
    PushSource,
    /// Produces values on its own schedule.
    PullSource,
    Compute,
    /// Consumes values without an output.
    Sink,
}

impl NodeKind {
    pub fn is_source(self) -> bool {
        matches!(self, Self::PushSource | Self::PullSource)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSignature {
    pub name: String,
    /// Time-series argument names, in input bundle order.
    pub args: Vec<String>,
    pub node_kind: NodeKind,
    /// Inputs that must be valid before the node evaluates. `None` means all.
    pub valid_inputs: Option<Vec<String>>,
    /// Inputs that must be all-valid before the node evaluates.
    pub all_valid_inputs: Option<Vec<String>>,
    /// Inputs that notify the node. `None` means all.
    pub active_inputs: Option<Vec<String>>,
    pub uses_scheduler: bool,
    /// Write evaluation errors to the error output instead of failing the run.
    pub capture_exception: bool,
    pub label: Option<String>,
    pub wiring_path_name: Option<String>,
    pub record_replay_id: Option<String>,
}

impl NodeSignature {
    pub fn new(name: impl Into<String>, node_kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            node_kind,
            valid_inputs: None,
            all_valid_inputs: None,
            active_inputs: None,
            uses_scheduler: false,
            capture_exception: false,
            label: None,
            wiring_path_name: None,
            record_replay_id: None,
        }
    }

    pub fn with_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_valid_inputs<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.valid_inputs = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_all_valid_inputs<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.all_valid_inputs = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_active_inputs<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.active_inputs = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_scheduler(mut self) -> Self {
        self.uses_scheduler = true;
        self
    }

    pub fn with_capture_exception(mut self) -> Self {
        self.capture_exception = true;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_record_replay_id(mut self, id: impl Into<String>) -> Self {
        self.record_replay_id = Some(id.into());
        self
    }

    /// Whether the node's state should be recorded for replay.
    pub fn is_recordable(&self) -> bool {
        self.record_replay_id.is_some()
    }

    pub fn is_active(&self, arg: &str) -> bool {
        self.active_inputs
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == arg))
    }

    pub(crate) fn requires_valid(&self, arg: &str) -> bool {
        self.valid_inputs
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == arg))
    }
}

impl fmt::Display for NodeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selections_default_to_every_input() {
        let sig = NodeSignature::new("add", NodeKind::Compute).with_args(["lhs", "rhs"]);
        assert!(sig.is_active("lhs"));
        assert!(sig.requires_valid("rhs"));
        assert_eq!(sig.to_string(), "add(lhs, rhs)");

        let sig = sig.with_active_inputs(["lhs"]).with_valid_inputs(Vec::<String>::new());
        assert!(!sig.is_active("rhs"));
        assert!(!sig.requires_valid("lhs"));
    }
}
