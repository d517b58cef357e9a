//! Wiring shared by the nodes that own nested graphs.

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::debug;

use super::stubs::STUB_INPUT;
use crate::error::{EngineError, Result};
use crate::graph::{GraphBuilder, NodeRef};
use crate::runtime::Runtime;
use crate::series::{GraphKey, InputId, OutputId};
use crate::time::{EngineTime, MAX_DT};
use crate::value::Scalar;

/// A nested graph template and where its outer connections attach.
#[derive(Debug, Clone, Default)]
pub struct NestedGraph {
    pub builder: GraphBuilder,
    /// Outer argument name to the index of the stub node receiving it.
    pub input_node_ids: IndexMap<String, usize>,
    /// Node whose output is replaced by the owner's output.
    pub output_node_id: Option<usize>,
}

impl NestedGraph {
    pub fn new(builder: GraphBuilder) -> Self {
        Self {
            builder,
            input_node_ids: IndexMap::new(),
            output_node_id: None,
        }
    }

    pub fn with_input(mut self, arg: impl Into<String>, node_ndx: usize) -> Self {
        self.input_node_ids.insert(arg.into(), node_ndx);
        self
    }

    pub fn with_output(mut self, node_ndx: usize) -> Self {
        self.output_node_id = Some(node_ndx);
        self
    }

    /// Instantiate and initialise a graph owned by `owner`, with id
    /// `owner graph id + [owner ndx, count]`.
    pub(crate) fn instantiate(
        &self,
        rt: &mut Runtime,
        owner: NodeRef,
        count: i64,
        label: Option<String>,
    ) -> Result<GraphKey> {
        let mut id: SmallVec<[i64; 4]> = rt.graph_id(owner.graph)?;
        id.push(owner.ndx as i64);
        id.push(count);
        let graph = self.builder.make_instance(rt, id, Some(owner), label)?;
        if let Err(err) = rt.initialise_graph(graph) {
            rt.discard_graph(graph);
            return Err(err);
        }
        debug!(owner = %owner, graph = %graph, "created nested graph");
        Ok(graph)
    }

    /// Copy the binding of an outer input onto the stub for `arg`.
    pub(crate) fn bind_input(&self, rt: &mut Runtime, graph: GraphKey, arg: &str, outer: InputId) -> Result<()> {
        let Some(&ndx) = self.input_node_ids.get(arg) else {
            return Ok(());
        };
        let stub = rt.node_input(NodeRef::new(graph, ndx), STUB_INPUT)?;
        rt.clone_binding(stub, outer)
    }

    /// Publish `key` through the key stub for `arg`.
    pub(crate) fn bind_key(&self, rt: &mut Runtime, graph: GraphKey, arg: &str, key: Scalar) -> Result<()> {
        let Some(&ndx) = self.input_node_ids.get(arg) else {
            return Ok(());
        };
        let node = NodeRef::new(graph, ndx);
        let output = rt
            .node_output(node)
            .ok_or_else(|| EngineError::wiring(format!("key stub {node} has no output")))?;
        rt.set_scalar(output, key)
    }

    /// Make the output node write straight into `output`.
    pub(crate) fn bind_output(&self, rt: &mut Runtime, graph: GraphKey, output: OutputId) -> Result<()> {
        let Some(ndx) = self.output_node_id else {
            return Ok(());
        };
        let node = NodeRef::new(graph, ndx);
        let own = rt
            .node_output(node)
            .ok_or_else(|| EngineError::wiring(format!("output node {node} has no output")))?;
        let expected = rt.output_type(own)?;
        let found = rt.output_type(output)?;
        if expected != found {
            return Err(EngineError::wiring(format!(
                "nested output of type {expected} cannot write into {found}"
            )));
        }
        rt.replace_node_output(node, output)
    }
}

/// Evaluate one keyed nested graph that is due at `due`.
///
/// Returns the next time the graph wants to run, `MAX_DT` if none.
pub(crate) fn evaluate_keyed_graph(
    rt: &mut Runtime,
    key: &Scalar,
    graph: GraphKey,
    due: EngineTime,
    allow_reevaluation: bool,
) -> Result<EngineTime> {
    let now = rt.evaluation_time();
    if due < now {
        return Err(EngineError::scheduling(format!(
            "nested graph for key {key} was due at {due}, evaluation time is already {now}"
        )));
    }
    if !allow_reevaluation && rt.graph_last_evaluation_time(graph) == now {
        return Err(EngineError::scheduling(format!(
            "nested graph for key {key} evaluated twice at {now}"
        )));
    }
    rt.nested_engine(graph).evaluate()
}

/// Stop and dispose a nested graph.
pub(crate) fn release_graph(rt: &mut Runtime, graph: GraphKey) -> Result<()> {
    let stopped = rt.stop_graph(graph);
    let disposed = rt.dispose_graph(graph);
    stopped.and(disposed)
}

/// Earliest pending time after `now`.
pub(crate) fn next_after(now: EngineTime, times: impl IntoIterator<Item = EngineTime>) -> Option<EngineTime> {
    times
        .into_iter()
        .filter(|t| *t > now && *t < MAX_DT)
        .min()
}
