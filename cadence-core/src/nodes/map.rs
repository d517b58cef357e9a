//! Map node.
//!
//! A map node keeps one nested graph per key of a dynamic key set. The keys
//! come from a `__keys__` set input or, without one, from the key set of the
//! first multiplexed dict argument.
//!
//! # Wiring
//!
//! For every key the nested graph's stubs are bound to:
//!
//! - the key itself, through the key stub named by `key_arg`;
//! - the key's element of each multiplexed dict argument;
//! - the whole of every other (shared) argument.
//!
//! The nested output node writes straight into the key's element of the
//! map's dict output.
//!
//! # Evaluation
//!
//! ```text
//! rebind shared args whose binding changed
//! for key in removed keys: stop and dispose its graph
//! for key in added keys:   (re)create its graph, due now
//! for every due key:       evaluate its graph, remember when it is next due
//! schedule the map node at the earliest pending key time
//! ```

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, warn};

use super::nested::{evaluate_keyed_graph, next_after, release_graph, NestedGraph};
use crate::error::{EngineError, Result};
use crate::graph::{NodeBuilder, NodeContext, NodeKind, NodeLogic, NodeRef, NodeSignature};
use crate::runtime::Runtime;
use crate::series::{GraphKey, InputId, OutputId, TsType};
use crate::time::{EngineTime, MAX_DT};
use crate::value::{Scalar, TimeSeriesReference};

/// Name of the optional set input that drives the keys of a map.
pub const KEYS_ARG: &str = "__keys__";

/// How a map node builds and wires its per-key graphs.
#[derive(Debug, Clone, Default)]
pub struct MapSpec {
    pub nested: NestedGraph,
    /// Dict arguments whose per-key element is handed to each key's graph.
    pub multiplexed_args: Vec<String>,
    /// Nested input receiving the key, if the graph wants it.
    pub key_arg: Option<String>,
    /// Write per-key failures to a dict error output instead of failing.
    pub capture_exception: bool,
}

impl MapSpec {
    pub fn new(nested: NestedGraph) -> Self {
        Self {
            nested,
            ..Self::default()
        }
    }

    pub fn with_multiplexed_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.multiplexed_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_key_arg(mut self, arg: impl Into<String>) -> Self {
        self.key_arg = Some(arg.into());
        self
    }

    pub fn with_capture_exception(mut self) -> Self {
        self.capture_exception = true;
        self
    }

    fn is_multiplexed(&self, arg: &str) -> bool {
        self.multiplexed_args.iter().any(|a| a == arg)
    }

    fn is_key_arg(&self, arg: &str) -> bool {
        self.key_arg.as_deref() == Some(arg)
    }

    /// Nested inputs fed from a shared outer argument.
    fn shared_args(&self) -> impl Iterator<Item = &String> {
        self.nested
            .input_node_ids
            .keys()
            .filter(|arg| !self.is_multiplexed(arg) && !self.is_key_arg(arg))
    }
}

/// Signature and builder shared by map and mesh nodes.
pub(crate) fn keyed_node_builder<S, F>(
    name: &str,
    spec: &MapSpec,
    inputs: impl IntoIterator<Item = (S, TsType)>,
    output: Option<TsType>,
    factory: F,
) -> NodeBuilder
where
    S: Into<String>,
    F: Fn() -> Box<dyn NodeLogic> + Send + Sync + 'static,
{
    let inputs: Vec<(String, TsType)> = inputs.into_iter().map(|(n, tp)| (n.into(), tp)).collect();
    let active: Vec<String> = inputs
        .iter()
        .map(|(n, _)| n)
        .filter(|n| !spec.is_multiplexed(n))
        .cloned()
        .collect();
    let signature = NodeSignature::new(name, NodeKind::Compute)
        .with_valid_inputs(Vec::<String>::new())
        .with_active_inputs(active);
    let mut builder = NodeBuilder::new(signature, factory).with_inputs(inputs);
    if let Some(output) = output {
        builder = builder.with_output(output);
    }
    if spec.capture_exception {
        builder = builder.with_error_output(TsType::dict(TsType::Value));
    }
    builder
}

/// A map node over `inputs`, writing each key's result into a dict `output`.
pub fn map_node<S: Into<String>>(
    name: &str,
    spec: MapSpec,
    inputs: impl IntoIterator<Item = (S, TsType)>,
    output: Option<TsType>,
) -> NodeBuilder {
    let spec = Arc::new(spec);
    let factory_spec = spec.clone();
    keyed_node_builder(name, &spec, inputs, output, move || {
        Box::new(MapNode {
            graphs: KeyedGraphs::new(factory_spec.clone()),
        })
    })
}

type Binding = (Option<OutputId>, Option<TimeSeriesReference>);

/// The per-key graphs of a map or mesh node.
pub(crate) struct KeyedGraphs {
    spec: Arc<MapSpec>,
    active: IndexMap<Scalar, GraphKey>,
    scheduled: IndexMap<Scalar, EngineTime>,
    shared: IndexMap<String, Binding>,
    count: i64,
}

impl KeyedGraphs {
    pub(crate) fn new(spec: Arc<MapSpec>) -> Self {
        Self {
            spec,
            active: IndexMap::new(),
            scheduled: IndexMap::new(),
            shared: IndexMap::new(),
            count: 0,
        }
    }

    pub(crate) fn spec(&self) -> &MapSpec {
        &self.spec
    }

    pub(crate) fn graph(&self, key: &Scalar) -> Option<GraphKey> {
        self.active.get(key).copied()
    }

    pub(crate) fn keys(&self) -> Vec<Scalar> {
        self.active.keys().cloned().collect()
    }

    pub(crate) fn scheduled_time(&self, key: &Scalar) -> Option<EngineTime> {
        self.scheduled.get(key).copied()
    }

    pub(crate) fn schedule_key(&mut self, key: Scalar, when: EngineTime) {
        let entry = self.scheduled.entry(key).or_insert(when);
        *entry = (*entry).min(when);
    }

    /// Check the nested wiring against the node's arguments.
    pub(crate) fn validate(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let signature = ctx.signature()?;
        let has_arg = |arg: &str| signature.args.iter().any(|a| a == arg);
        for arg in self.spec.nested.input_node_ids.keys() {
            if !self.spec.is_key_arg(arg) && !has_arg(arg) {
                return Err(EngineError::wiring(format!(
                    "{}: nested input `{arg}` has no matching argument",
                    signature.name
                )));
            }
        }
        for arg in &self.spec.multiplexed_args {
            if !has_arg(arg) {
                return Err(EngineError::wiring(format!(
                    "{}: multiplexed argument `{arg}` is not an input",
                    signature.name
                )));
            }
        }
        if !has_arg(KEYS_ARG) && self.spec.multiplexed_args.is_empty() {
            return Err(EngineError::wiring(format!(
                "{}: needs a `{KEYS_ARG}` input or a multiplexed argument",
                signature.name
            )));
        }
        Ok(())
    }

    /// The set input whose items are the keys.
    pub(crate) fn key_set_input(&self, ctx: &NodeContext<'_>) -> Result<InputId> {
        if ctx.signature()?.args.iter().any(|a| a == KEYS_ARG) {
            return ctx.input(KEYS_ARG);
        }
        let first = self
            .spec
            .multiplexed_args
            .first()
            .ok_or_else(|| EngineError::wiring("keyed node without a key source"))?;
        let dict = ctx.input(first)?;
        ctx.runtime().dict_input_key_set(dict)
    }

    /// Follow the key set, evaluating from now if keys are already present.
    pub(crate) fn start(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let keys = self.key_set_input(ctx)?;
        let node = ctx.node();
        let now = ctx.evaluation_time();
        let rt = ctx.runtime_mut();
        rt.make_active(keys)?;
        if rt.input_valid(keys) {
            rt.schedule_node(node, now)?;
        }
        Ok(())
    }

    /// Bring the set of graphs in line with the key set. Keys in `keep`
    /// survive even when absent from the key set.
    pub(crate) fn sync_keys(&mut self, ctx: &mut NodeContext<'_>, keep: &IndexSet<Scalar>) -> Result<()> {
        let keys = self.key_set_input(ctx)?;
        let node = ctx.node();
        let rt = ctx.runtime_mut();
        self.rebind_shared(rt, node)?;

        for key in rt.input_set_removed(keys) {
            if !keep.contains(&key) {
                self.remove_key(rt, node, &key)?;
            }
        }
        for key in rt.input_set_added(keys) {
            if self.active.contains_key(&key) {
                self.remove_key(rt, node, &key)?;
            }
            self.create_key(rt, node, key)?;
        }

        let present: IndexSet<Scalar> = rt.input_set_values(keys).into_iter().collect();
        let stale: Vec<Scalar> = self
            .active
            .keys()
            .filter(|k| !present.contains(*k) && !keep.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            self.remove_key(rt, node, &key)?;
        }
        for key in present {
            if !self.active.contains_key(&key) {
                self.create_key(rt, node, key)?;
            }
        }
        self.rebind_multiplexed(rt, node)
    }

    /// Build, wire and start the graph for `key`.
    pub(crate) fn create_key(&mut self, rt: &mut Runtime, node: NodeRef, key: Scalar) -> Result<GraphKey> {
        let graph = self
            .spec
            .nested
            .instantiate(rt, node, self.count, Some(key.to_string()))?;
        self.count += 1;
        if let Err(err) = self.wire_and_start(rt, node, graph, &key) {
            if let Err(release) = release_graph(rt, graph) {
                warn!(node = %node, key = %key, error = %release, "failed to release key graph");
            }
            return Err(err);
        }
        debug!(node = %node, key = %key, graph = %graph, "added key");
        self.active.insert(key.clone(), graph);
        self.scheduled.insert(key, rt.evaluation_time());
        Ok(graph)
    }

    fn wire_and_start(&self, rt: &mut Runtime, node: NodeRef, graph: GraphKey, key: &Scalar) -> Result<()> {
        let nested = &self.spec.nested;
        for arg in nested.input_node_ids.keys() {
            if self.spec.is_key_arg(arg) {
                continue;
            }
            let outer = rt.node_input(node, arg)?;
            if self.spec.is_multiplexed(arg) {
                if let Some(element) = rt.dict_input_get(outer, key) {
                    nested.bind_input(rt, graph, arg, element)?;
                }
            } else {
                nested.bind_input(rt, graph, arg, outer)?;
            }
        }
        if nested.output_node_id.is_some() {
            if let Some(output) = rt.node_output(node) {
                let element = rt.dict_get_or_create(output, key.clone())?;
                nested.bind_output(rt, graph, element)?;
            }
        }
        rt.start_graph(graph)?;
        if let Some(arg) = &self.spec.key_arg {
            nested.bind_key(rt, graph, arg, key.clone())?;
        }
        Ok(())
    }

    /// Stop and dispose the graph for `key` and drop its outputs.
    pub(crate) fn remove_key(&mut self, rt: &mut Runtime, node: NodeRef, key: &Scalar) -> Result<()> {
        let Some(graph) = self.active.shift_remove(key) else {
            return Ok(());
        };
        self.scheduled.shift_remove(key);
        release_graph(rt, graph)?;
        if self.spec.nested.output_node_id.is_some() {
            if let Some(output) = rt.node_output(node) {
                rt.dict_remove(output, key)?;
            }
        }
        if let Some(errors) = rt.node_error_output(node) {
            rt.dict_remove(errors, key)?;
        }
        debug!(node = %node, key = %key, graph = %graph, "removed key");
        Ok(())
    }

    fn rebind_shared(&mut self, rt: &mut Runtime, node: NodeRef) -> Result<()> {
        let args: Vec<String> = self.spec.shared_args().cloned().collect();
        for arg in args {
            let outer = rt.node_input(node, &arg)?;
            let binding = (rt.input_output(outer), rt.reference_input_value(outer));
            if self.shared.get(&arg) == Some(&binding) {
                continue;
            }
            let now = rt.evaluation_time();
            for (key, graph) in &self.active {
                self.spec.nested.bind_input(rt, *graph, &arg, outer)?;
                let entry = self.scheduled.entry(key.clone()).or_insert(now);
                *entry = (*entry).min(now);
            }
            self.shared.insert(arg, binding);
        }
        Ok(())
    }

    /// Bind elements that appeared in a multiplexed dict after their key's
    /// graph was created.
    fn rebind_multiplexed(&mut self, rt: &mut Runtime, node: NodeRef) -> Result<()> {
        let now = rt.evaluation_time();
        let spec = self.spec.clone();
        for arg in &spec.multiplexed_args {
            if !spec.nested.input_node_ids.contains_key(arg) {
                continue;
            }
            let outer = rt.node_input(node, arg)?;
            for key in rt.dict_input_added_keys(outer) {
                let (Some(graph), Some(element)) = (self.graph(&key), rt.dict_input_get(outer, &key)) else {
                    continue;
                };
                spec.nested.bind_input(rt, graph, arg, element)?;
                self.schedule_key(key, now);
            }
        }
        Ok(())
    }

    /// Pick up scheduling requests the nested graphs made since they last ran.
    pub(crate) fn collect_schedules(&mut self, rt: &Runtime) -> Result<()> {
        let now = rt.evaluation_time();
        for (key, graph) in &self.active {
            let next = rt.nested_clock(*graph)?.next_scheduled_evaluation_time();
            if next >= now && next < MAX_DT {
                let entry = self.scheduled.entry(key.clone()).or_insert(next);
                *entry = (*entry).min(next);
            }
        }
        Ok(())
    }

    /// Keys due at or before now, in key order.
    pub(crate) fn due_keys(&self, now: EngineTime) -> Vec<(Scalar, EngineTime)> {
        self.scheduled
            .iter()
            .filter(|(_, when)| **when <= now)
            .map(|(key, when)| (key.clone(), *when))
            .collect()
    }

    /// Evaluate the graph for `key`; failures go to the error output when
    /// the node captures them.
    pub(crate) fn evaluate_key(
        &mut self,
        rt: &mut Runtime,
        node: NodeRef,
        key: &Scalar,
        due: EngineTime,
        allow_reevaluation: bool,
    ) -> Result<()> {
        let Some(graph) = self.graph(key) else {
            self.scheduled.shift_remove(key);
            return Ok(());
        };
        let now = rt.evaluation_time();
        match evaluate_keyed_graph(rt, key, graph, due, allow_reevaluation) {
            Ok(next) if next > now && next < MAX_DT => {
                self.scheduled.insert(key.clone(), next);
            }
            Ok(_) => {
                self.scheduled.shift_remove(key);
            }
            Err(err) if err.is_fatal() || !self.spec.capture_exception => return Err(err),
            Err(err) => {
                self.scheduled.shift_remove(key);
                let error = rt.capture_node_error(node, &err, &format!("Evaluating key {key}"))?;
                warn!(node = %node, key = %key, error = %error, "captured keyed graph error");
                if let Some(errors) = rt.node_error_output(node) {
                    let element = rt.dict_get_or_create(errors, key.clone())?;
                    rt.set_scalar(element, error)?;
                }
            }
        }
        Ok(())
    }

    /// Wake the owning node when the earliest pending key is due.
    pub(crate) fn reschedule(&self, rt: &mut Runtime, node: NodeRef) -> Result<()> {
        let now = rt.evaluation_time();
        match next_after(now, self.scheduled.values().copied()) {
            Some(next) => rt.schedule_node(node, next),
            None => Ok(()),
        }
    }

    pub(crate) fn stop_all(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let keys = self.key_set_input(ctx)?;
        let rt = ctx.runtime_mut();
        rt.make_passive(keys)?;
        let mut first_error = None;
        for graph in self.active.values() {
            if let Err(err) = rt.stop_graph(*graph) {
                first_error.get_or_insert(err);
            }
        }
        self.scheduled.clear();
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn dispose_all(&mut self, rt: &mut Runtime) -> Result<()> {
        let mut first_error = None;
        for (_, graph) in self.active.drain(..) {
            if let Err(err) = rt.dispose_graph(graph) {
                first_error.get_or_insert(err);
            }
        }
        self.shared.clear();
        first_error.map_or(Ok(()), Err)
    }
}

struct MapNode {
    graphs: KeyedGraphs,
}

impl NodeLogic for MapNode {
    fn initialise(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        self.graphs.validate(ctx)
    }

    fn start(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        self.graphs.start(ctx)
    }

    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let node = ctx.node();
        let now = ctx.evaluation_time();
        self.graphs.sync_keys(ctx, &IndexSet::new())?;
        let rt = ctx.runtime_mut();
        self.graphs.collect_schedules(rt)?;
        for (key, due) in self.graphs.due_keys(now) {
            self.graphs.evaluate_key(rt, node, &key, due, false)?;
        }
        self.graphs.reschedule(rt, node)
    }

    fn stop(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        self.graphs.stop_all(ctx)
    }

    fn dispose(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        self.graphs.dispose_all(ctx.runtime_mut())
    }
}

#[cfg(test)]
mod tests {
    use smallvec::SmallVec;

    use super::*;
    use crate::graph::GraphBuilder;
    use crate::nodes::key_stub;

    fn at(secs: i64) -> EngineTime {
        EngineTime::from_secs(secs)
    }

    /// A root graph holding one node, and an empty key graph owned by it.
    fn key_graph(rt: &mut Runtime) -> GraphKey {
        let mut outer = GraphBuilder::new();
        outer.add_node(key_stub("owner"));
        let root = outer.make_instance(rt, SmallVec::new(), None, None).unwrap();
        let owner = NodeRef::new(root, 0);
        GraphBuilder::new()
            .make_instance(rt, SmallVec::from_slice(&[0, 1]), Some(owner), Some("k".into()))
            .unwrap()
    }

    #[test]
    fn test_key_graph_runs_once_per_cycle() {
        let mut rt = Runtime::for_tests(at(1));
        let graph = key_graph(&mut rt);
        let key = Scalar::from("k");

        assert_eq!(evaluate_keyed_graph(&mut rt, &key, graph, at(1), false).unwrap(), MAX_DT);
        assert_eq!(rt.graph_last_evaluation_time(graph), at(1));

        let err = evaluate_keyed_graph(&mut rt, &key, graph, at(1), false).unwrap_err();
        assert!(matches!(err, EngineError::Scheduling(_)));
        assert!(evaluate_keyed_graph(&mut rt, &key, graph, at(1), true).is_ok());

        rt.set_test_time(at(2));
        assert!(evaluate_keyed_graph(&mut rt, &key, graph, at(2), false).is_ok());
    }

    #[test]
    fn test_key_graph_due_in_the_past_is_rejected() {
        let mut rt = Runtime::for_tests(at(3));
        let graph = key_graph(&mut rt);
        let err = evaluate_keyed_graph(&mut rt, &Scalar::from(1), graph, at(2), true).unwrap_err();
        assert!(matches!(err, EngineError::Scheduling(_)));
        assert_eq!(rt.graph_last_evaluation_time(graph), crate::time::MIN_DT);
    }
}
