//! Switch node.
//!
//! Runs exactly one nested graph, chosen by the value of the `key` input.
//! When the key changes the running graph is stopped and disposed and the
//! graph for the new key is built in its place; with `reload_on_ticked` it is
//! rebuilt on every tick of the key, even an unchanged one. Keys without a
//! branch fall back to the default graph; without one the node fails.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use super::nested::{release_graph, NestedGraph};
use crate::error::{EngineError, Result};
use crate::graph::{NodeBuilder, NodeContext, NodeKind, NodeLogic, NodeSignature};
use crate::series::{GraphKey, OutputId, TsType};
use crate::time::MAX_DT;
use crate::value::{Scalar, TimeSeriesReference};

/// Name of the input selecting the branch.
pub const SWITCH_KEY: &str = "key";

/// Branches of a switch node.
#[derive(Debug, Clone, Default)]
pub struct SwitchSpec {
    pub branches: IndexMap<Scalar, NestedGraph>,
    pub default: Option<NestedGraph>,
    pub reload_on_ticked: bool,
}

impl SwitchSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_branch(mut self, key: impl Into<Scalar>, graph: NestedGraph) -> Self {
        self.branches.insert(key.into(), graph);
        self
    }

    pub fn with_default(mut self, graph: NestedGraph) -> Self {
        self.default = Some(graph);
        self
    }

    pub fn with_reload_on_ticked(mut self) -> Self {
        self.reload_on_ticked = true;
        self
    }

    fn branch(&self, key: &Scalar) -> Option<&NestedGraph> {
        self.branches.get(key).or(self.default.as_ref())
    }
}

/// A switch over `key` plus the shared `inputs` handed to every branch.
pub fn switch_node<S: Into<String>>(
    name: &str,
    spec: SwitchSpec,
    inputs: impl IntoIterator<Item = (S, TsType)>,
    output: Option<TsType>,
) -> NodeBuilder {
    let spec = Arc::new(spec);
    let mut fields: Vec<(String, TsType)> = vec![(SWITCH_KEY.to_string(), TsType::Value)];
    fields.extend(inputs.into_iter().map(|(n, tp)| (n.into(), tp)));
    let signature = NodeSignature::new(name, NodeKind::Compute).with_valid_inputs([SWITCH_KEY]);
    let builder = NodeBuilder::new(signature, move || {
        Box::new(SwitchNode {
            spec: spec.clone(),
            active: None,
            count: 0,
            bindings: IndexMap::new(),
        })
    })
    .with_inputs(fields);
    match output {
        Some(output) => builder.with_output(output),
        None => builder,
    }
}

type Binding = (Option<OutputId>, Option<TimeSeriesReference>);

struct SwitchNode {
    spec: Arc<SwitchSpec>,
    active: Option<(Scalar, GraphKey, Arc<NestedGraph>)>,
    count: i64,
    bindings: IndexMap<String, Binding>,
}

impl SwitchNode {
    fn tear_down(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let Some((key, graph, _)) = self.active.take() else {
            return Ok(());
        };
        debug!(node = %ctx.node(), key = %key, graph = %graph, "switch branch removed");
        release_graph(ctx.runtime_mut(), graph)
    }

    fn build(&mut self, ctx: &mut NodeContext<'_>, key: Scalar) -> Result<()> {
        let branch = self
            .spec
            .branch(&key)
            .cloned()
            .map(Arc::new)
            .ok_or_else(|| EngineError::evaluation(format!("switch has no branch for key {key}")))?;
        let node = ctx.node();
        let graph = branch.instantiate(ctx.runtime_mut(), node, self.count, Some(key.to_string()))?;
        self.count += 1;
        self.active = Some((key.clone(), graph, branch));

        let wired = self.rebind(ctx).and_then(|_| {
            let rt = ctx.runtime_mut();
            if let (Some(output), Some((_, _, branch))) = (rt.node_output(node), &self.active) {
                branch.bind_output(rt, graph, output)?;
            }
            rt.start_graph(graph)
        });
        if let Err(err) = wired {
            self.active = None;
            if let Err(release) = release_graph(ctx.runtime_mut(), graph) {
                warn!(node = %node, key = %key, error = %release, "failed to release switch branch");
            }
            return Err(err);
        }
        debug!(node = %node, key = %key, graph = %graph, "switch branch built");
        Ok(())
    }

    /// Rebind shared inputs of the running branch whose outer binding changed.
    fn rebind(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let Some((_, graph, branch)) = &self.active else {
            return Ok(());
        };
        let node = ctx.node();
        let rt = ctx.runtime_mut();
        for arg in branch.input_node_ids.keys() {
            let outer = rt.node_input(node, arg)?;
            let binding = (rt.input_output(outer), rt.reference_input_value(outer));
            if self.bindings.get(arg) != Some(&binding) {
                branch.bind_input(rt, *graph, arg, outer)?;
                self.bindings.insert(arg.clone(), binding);
            }
        }
        Ok(())
    }
}

impl NodeLogic for SwitchNode {
    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let key = ctx
            .value(SWITCH_KEY)?
            .ok_or_else(|| EngineError::evaluation("switch key has no value"))?;
        let current = self.active.as_ref().map(|(k, _, _)| k.clone());
        let reload = self.spec.reload_on_ticked && ctx.modified(SWITCH_KEY);
        if current.as_ref() != Some(&key) || reload {
            self.tear_down(ctx)?;
            self.bindings.clear();
            self.build(ctx, key)?;
        }
        self.rebind(ctx)?;

        let Some((_, graph, _)) = &self.active else {
            return Ok(());
        };
        let graph = *graph;
        let node = ctx.node();
        let now = ctx.evaluation_time();
        let rt = ctx.runtime_mut();
        let next = rt.nested_engine(graph).evaluate()?;
        if next > now && next < MAX_DT {
            rt.schedule_node(node, next)?;
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        match &self.active {
            Some((_, graph, _)) => ctx.runtime_mut().stop_graph(*graph),
            None => Ok(()),
        }
    }

    fn dispose(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        self.bindings.clear();
        match self.active.take() {
            Some((_, graph, _)) => ctx.runtime_mut().dispose_graph(graph),
            None => Ok(()),
        }
    }
}
