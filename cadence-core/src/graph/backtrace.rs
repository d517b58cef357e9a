//! Node error capture.
//!
//! When node logic fails, the raw error is wrapped into a [`NodeError`] that
//! says where the node sits in the graph and what its inputs looked like.
//! The activation back trace follows modified inputs upstream for
//! `trace_back_depth` levels.

use super::node::NodeRef;
use crate::error::{BackTrace, EngineError, InputTrace, NodeError, Result};
use crate::runtime::Runtime;

impl Runtime {
    pub(crate) fn capture_node_error(
        &self,
        node: NodeRef,
        err: &EngineError,
        context: &str,
    ) -> Result<NodeError> {
        let record = self.node_record(node)?;
        let (error_msg, stack_trace) = match err.as_node_error() {
            Some(inner) => {
                let mut stack = vec![format!(
                    "{} at {}: {}",
                    inner.signature_name, inner.wiring_path, inner.error_msg
                )];
                stack.extend(inner.stack_trace.iter().cloned());
                (inner.error_msg.clone(), stack)
            }
            None => (err.to_string(), Vec::new()),
        };
        Ok(NodeError {
            signature_name: record.signature.name.clone(),
            label: record.signature.label.clone(),
            wiring_path: self.wiring_path(node)?,
            error_msg,
            stack_trace,
            activation_back_trace: self.back_trace(node, self.trace_back_depth),
            additional_context: Some(context.to_string()),
        })
    }

    fn back_trace(&self, node: NodeRef, depth: usize) -> BackTrace {
        let Ok(record) = self.node_record(node) else {
            return BackTrace::default();
        };
        let mut inputs = Vec::new();
        if let Some(root) = record.input {
            for (ndx, name) in record.signature.args.iter().enumerate() {
                let Ok(input) = self.input_child(root, ndx) else {
                    continue;
                };
                let modified = self.input_modified(input);
                let upstream = if modified && depth > 0 {
                    self.input_output(input)
                        .and_then(|output| self.output_owner(output))
                        .filter(|owner| *owner != node)
                        .map(|owner| Box::new(self.back_trace(owner, depth - 1)))
                } else {
                    None
                };
                let value = if self.capture_values {
                    self.input_delta_value(input).map(|v| format!("{v:?}"))
                } else {
                    None
                };
                inputs.push(InputTrace {
                    name: name.clone(),
                    active: self.input_active(input),
                    modified,
                    valid: self.input_valid(input),
                    value,
                    upstream,
                });
            }
        }
        BackTrace {
            signature_name: Some(record.signature.name.clone()),
            wiring_path: self.wiring_path(node).ok(),
            inputs,
        }
    }
}
