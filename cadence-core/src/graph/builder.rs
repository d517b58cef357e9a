//! Graph Builders
//!
//! Builders are the immutable recipe for a graph: node builders in
//! topological order plus the edges between them. A builder can be
//! instantiated any number of times, which is how map keys, switch branches
//! and reduce tree levels get their own copy of a subgraph.
//!
//! # Paths
//!
//! An edge names a cell by a path from the node:
//!
//! - an output path starts at the primary output, or at the error output
//!   ([`ERROR_PATH`]) or recordable state ([`STATE_PATH`]) when it begins
//!   with one of those markers; each further element is a child index, or
//!   [`KEY_SET_ID`] for a dict's key set;
//! - an input path starts with the argument index in the node's input
//!   bundle.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::node::{NodeLogic, NodeRecord, NodeRef};
use super::record::{GraphClock, GraphRecord};
use super::scheduler::NodeScheduler;
use super::signature::{NodeKind, NodeSignature};
use super::{ERROR_PATH, KEY_SET_ID, STATE_PATH};
use crate::error::{EngineError, Result};
use crate::lifecycle::LifecycleState;
use crate::runtime::{NestedEngineEvaluationClock, Runtime};
use crate::series::{BundleSchema, GraphKey, InputId, OutputId, TsType};
use crate::time::MIN_DT;

/// Creates a fresh logic instance for each node built.
pub type LogicFactory = Arc<dyn Fn() -> Box<dyn NodeLogic> + Send + Sync>;

/// Recipe for one node.
#[derive(Clone)]
pub struct NodeBuilder {
    pub signature: Arc<NodeSignature>,
    pub inputs: Option<Arc<BundleSchema>>,
    pub output: Option<TsType>,
    pub error_output: Option<TsType>,
    pub recordable_state: Option<TsType>,
    factory: LogicFactory,
}

impl NodeBuilder {
    pub fn new<F>(signature: NodeSignature, factory: F) -> Self
    where
        F: Fn() -> Box<dyn NodeLogic> + Send + Sync + 'static,
    {
        Self {
            signature: Arc::new(signature),
            inputs: None,
            output: None,
            error_output: None,
            recordable_state: None,
            factory: Arc::new(factory),
        }
    }

    /// Declare the time-series inputs; they become the signature's arguments.
    pub fn with_inputs<S: Into<String>>(mut self, fields: impl IntoIterator<Item = (S, TsType)>) -> Self {
        let schema = BundleSchema::new(fields);
        Arc::make_mut(&mut self.signature).args = schema.keys().to_vec();
        self.inputs = Some(Arc::new(schema));
        self
    }

    pub fn with_output(mut self, output: TsType) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error_output(mut self, error_output: TsType) -> Self {
        self.error_output = Some(error_output);
        self
    }

    pub fn with_recordable_state(mut self, state: TsType) -> Self {
        self.recordable_state = Some(state);
        self
    }

    pub fn input_type(&self, name: &str) -> Option<&TsType> {
        let inputs = self.inputs.as_ref()?;
        inputs.index_of(name).map(|ndx| &inputs.types()[ndx])
    }

    pub(crate) fn input_index(&self, name: &str) -> Result<usize> {
        self.inputs
            .as_ref()
            .and_then(|inputs| inputs.index_of(name))
            .ok_or_else(|| {
                EngineError::wiring(format!("node `{}` has no input `{name}`", self.signature.name))
            })
    }

    pub(crate) fn make_instance(&self, rt: &mut Runtime, node: NodeRef) -> Result<NodeRecord> {
        let input = match &self.inputs {
            Some(schema) if !schema.is_empty() => {
                Some(rt.create_input(node, None, &TsType::Bundle(schema.clone()))?)
            }
            _ => None,
        };
        let output = self
            .output
            .as_ref()
            .map(|tp| rt.create_output(node, None, tp))
            .transpose()?;
        let error_type = self
            .error_output
            .clone()
            .or_else(|| self.signature.capture_exception.then_some(TsType::Value));
        let error_output = error_type
            .map(|tp| rt.create_output(node, None, &tp))
            .transpose()?;
        let state_type = self
            .recordable_state
            .clone()
            .or_else(|| self.signature.is_recordable().then_some(TsType::Value));
        let recordable_state = state_type
            .map(|tp| rt.create_output(node, None, &tp))
            .transpose()?;
        Ok(NodeRecord {
            signature: self.signature.clone(),
            state: LifecycleState::Uninitialised,
            last_evaluation_time: MIN_DT,
            input,
            output,
            error_output,
            recordable_state,
            output_borrowed: false,
            scheduler: NodeScheduler::new(),
            logic: Some((self.factory)()),
        })
    }
}

impl fmt::Debug for NodeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeBuilder")
            .field("signature", &self.signature.to_string())
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

/// A wiring edge from an output of one node to an input of a later node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub src_node: usize,
    pub output_path: SmallVec<[i64; 4]>,
    pub dst_node: usize,
    pub input_path: SmallVec<[i64; 4]>,
}

/// Recipe for a graph.
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    pub node_builders: Vec<NodeBuilder>,
    pub edges: Vec<Edge>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, returning its index.
    pub fn add_node(&mut self, builder: NodeBuilder) -> usize {
        self.node_builders.push(builder);
        self.node_builders.len() - 1
    }

    /// Wire the primary output of `src` into input `input` of `dst`.
    pub fn connect(&mut self, src: usize, dst: usize, input: &str) -> Result<&mut Self> {
        let builder = self
            .node_builders
            .get(dst)
            .ok_or_else(|| EngineError::wiring(format!("no node at index {dst}")))?;
        let ndx = builder.input_index(input)? as i64;
        self.connect_path(src, std::iter::empty(), dst, [ndx])
    }

    pub fn connect_path(
        &mut self,
        src: usize,
        output_path: impl IntoIterator<Item = i64>,
        dst: usize,
        input_path: impl IntoIterator<Item = i64>,
    ) -> Result<&mut Self> {
        self.edges.push(Edge {
            src_node: src,
            output_path: output_path.into_iter().collect(),
            dst_node: dst,
            input_path: input_path.into_iter().collect(),
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.node_builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_builders.is_empty()
    }

    /// Number of leading push-source nodes.
    pub fn push_source_nodes_end(&self) -> usize {
        self.node_builders
            .iter()
            .take_while(|b| b.signature.node_kind == NodeKind::PushSource)
            .count()
    }

    /// Check node order and edge endpoints.
    pub fn validate(&self) -> Result<()> {
        let push_end = self.push_source_nodes_end();
        if let Some(late) = self.node_builders[push_end..]
            .iter()
            .position(|b| b.signature.node_kind == NodeKind::PushSource)
        {
            return Err(EngineError::wiring(format!(
                "push source at index {} must precede all other nodes",
                push_end + late
            )));
        }
        for edge in &self.edges {
            if edge.dst_node >= self.len() {
                return Err(EngineError::wiring(format!("edge to missing node {}", edge.dst_node)));
            }
            if edge.src_node >= edge.dst_node {
                return Err(EngineError::wiring(format!(
                    "edge {} -> {} is not in topological order",
                    edge.src_node, edge.dst_node
                )));
            }
            let src = &self.node_builders[edge.src_node];
            if edge.output_path.first().map_or(true, |p| *p >= 0) && src.output.is_none() {
                return Err(EngineError::wiring(format!(
                    "node `{}` has no output to connect",
                    src.signature.name
                )));
            }
            let dst = &self.node_builders[edge.dst_node];
            let arity = dst.inputs.as_ref().map_or(0, |i| i.len());
            match edge.input_path.first() {
                Some(&arg) if arg >= 0 && (arg as usize) < arity => {}
                _ => {
                    return Err(EngineError::wiring(format!(
                        "invalid input path {:?} for node `{}`",
                        edge.input_path, dst.signature.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Instantiate as a new graph. `parent` makes it a nested graph driven by
    /// that node.
    pub(crate) fn make_instance(
        &self,
        rt: &mut Runtime,
        id: SmallVec<[i64; 4]>,
        parent: Option<NodeRef>,
        label: Option<String>,
    ) -> Result<GraphKey> {
        self.validate()?;
        let clock = match parent {
            Some(owner) => GraphClock::Nested(NestedEngineEvaluationClock::new(owner)),
            None => GraphClock::Root,
        };
        let key = rt.graphs.insert(GraphRecord {
            id,
            label,
            parent,
            nodes: Vec::with_capacity(self.len()),
            schedule: Vec::with_capacity(self.len()),
            clock,
            state: LifecycleState::Uninitialised,
            last_evaluation_time: MIN_DT,
            push_source_nodes_end: self.push_source_nodes_end(),
        });
        if let Err(err) = self.make_and_connect_nodes(rt, key, 0) {
            rt.discard_graph(key);
            return Err(err);
        }
        Ok(key)
    }

    /// Create this builder's nodes at `offset..` of an existing graph and wire them.
    pub(crate) fn make_and_connect_nodes(&self, rt: &mut Runtime, graph: GraphKey, offset: usize) -> Result<()> {
        for (ndx, builder) in self.node_builders.iter().enumerate() {
            let record = builder.make_instance(rt, NodeRef::new(graph, offset + ndx))?;
            let graph = rt.graph_mut(graph)?;
            graph.nodes.push(record);
            graph.schedule.push(MIN_DT);
        }
        for edge in &self.edges {
            let output = rt.resolve_output_path(NodeRef::new(graph, offset + edge.src_node), &edge.output_path)?;
            let input = rt.resolve_input_path(NodeRef::new(graph, offset + edge.dst_node), &edge.input_path)?;
            rt.bind_output(input, output)?;
        }
        Ok(())
    }
}

impl Runtime {
    pub(crate) fn resolve_output_path(&self, node: NodeRef, path: &[i64]) -> Result<OutputId> {
        let record = self.node_record(node)?;
        let missing = |what: &str| EngineError::wiring(format!("node {node} has no {what}"));
        let (mut output, rest) = match path.first() {
            Some(&ERROR_PATH) => (record.error_output.ok_or_else(|| missing("error output"))?, &path[1..]),
            Some(&STATE_PATH) => (
                record.recordable_state.ok_or_else(|| missing("recordable state"))?,
                &path[1..],
            ),
            _ => (record.output.ok_or_else(|| missing("output"))?, path),
        };
        for &element in rest {
            output = match element {
                KEY_SET_ID => self.dict_key_set(output)?,
                ndx if ndx >= 0 => self.output_child(output, ndx as usize)?,
                other => return Err(EngineError::wiring(format!("invalid output path element {other}"))),
            };
        }
        Ok(output)
    }

    pub(crate) fn resolve_input_path(&self, node: NodeRef, path: &[i64]) -> Result<InputId> {
        let mut input = self
            .node_record(node)?
            .input
            .ok_or_else(|| EngineError::wiring(format!("node {node} has no inputs")))?;
        if path.is_empty() {
            return Err(EngineError::wiring(format!("empty input path for node {node}")));
        }
        for &element in path {
            input = match element {
                KEY_SET_ID => self.dict_input_key_set(input)?,
                ndx if ndx >= 0 => self.input_child(input, ndx as usize)?,
                other => return Err(EngineError::wiring(format!("invalid input path element {other}"))),
            };
        }
        Ok(input)
    }
}
