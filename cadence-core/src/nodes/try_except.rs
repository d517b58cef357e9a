//! Try-except node.
//!
//! Runs a nested graph and turns any evaluation failure inside it into a
//! value on the `exception` field of its output bundle. The failed graph is
//! stopped but kept, and the outer graph carries on. Engine invariant
//! violations are not caught.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use super::nested::NestedGraph;
use crate::error::{EngineError, Result};
use crate::graph::{NodeBuilder, NodeContext, NodeKind, NodeLogic, NodeSignature};
use crate::series::{GraphKey, OutputId, TsType};
use crate::time::MAX_DT;
use crate::value::TimeSeriesReference;

/// Output field carrying the captured error.
pub const EXCEPTION_FIELD: &str = "exception";
/// Output field carrying the nested graph's result.
pub const OUT_FIELD: &str = "out";

/// A try-except node around `nested`, whose result, if any, is of type `output`.
pub fn try_except_node<S: Into<String>>(
    name: &str,
    nested: NestedGraph,
    inputs: impl IntoIterator<Item = (S, TsType)>,
    output: Option<TsType>,
) -> NodeBuilder {
    let nested = Arc::new(nested);
    let mut fields = vec![(EXCEPTION_FIELD, TsType::Value)];
    if let Some(output) = output {
        fields.push((OUT_FIELD, output));
    }
    NodeBuilder::new(NodeSignature::new(name, NodeKind::Compute), move || {
        Box::new(TryExceptNode {
            nested: nested.clone(),
            graph: None,
            failed: false,
            bindings: IndexMap::new(),
        })
    })
    .with_inputs(inputs)
    .with_output(TsType::bundle(fields))
}

type Binding = (Option<OutputId>, Option<TimeSeriesReference>);

struct TryExceptNode {
    nested: Arc<NestedGraph>,
    graph: Option<GraphKey>,
    failed: bool,
    bindings: IndexMap<String, Binding>,
}

impl TryExceptNode {
    fn graph(&self) -> Result<GraphKey> {
        self.graph
            .ok_or_else(|| EngineError::Lifecycle("try-except node has no nested graph".to_string()))
    }

    fn rebind(&mut self, ctx: &mut NodeContext<'_>, graph: GraphKey) -> Result<()> {
        let node = ctx.node();
        let rt = ctx.runtime_mut();
        for arg in self.nested.input_node_ids.keys() {
            let outer = rt.node_input(node, arg)?;
            let binding = (rt.input_output(outer), rt.reference_input_value(outer));
            if self.bindings.get(arg) != Some(&binding) {
                self.nested.bind_input(rt, graph, arg, outer)?;
                self.bindings.insert(arg.clone(), binding);
            }
        }
        Ok(())
    }
}

impl NodeLogic for TryExceptNode {
    fn initialise(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let node = ctx.node();
        let graph = self.nested.instantiate(ctx.runtime_mut(), node, 0, None)?;
        self.graph = Some(graph);
        if self.nested.output_node_id.is_some() {
            let output = ctx.output()?;
            let rt = ctx.runtime_mut();
            let out = rt.output_field(output, OUT_FIELD)?;
            self.nested.bind_output(rt, graph, out)?;
        }
        Ok(())
    }

    fn start(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let graph = self.graph()?;
        self.failed = false;
        self.rebind(ctx, graph)?;
        ctx.runtime_mut().start_graph(graph)
    }

    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        if self.failed {
            return Ok(());
        }
        let graph = self.graph()?;
        self.rebind(ctx, graph)?;

        let node = ctx.node();
        let now = ctx.evaluation_time();
        let output = ctx.output()?;
        let rt = ctx.runtime_mut();
        match rt.nested_engine(graph).evaluate() {
            Ok(next) => {
                if next > now && next < MAX_DT {
                    rt.schedule_node(node, next)?;
                }
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                let error = rt.capture_node_error(node, &err, "During nested evaluation")?;
                warn!(node = %node, error = %error, "nested graph failed");
                let exception = rt.output_field(output, EXCEPTION_FIELD)?;
                rt.set_scalar(exception, error)?;
                self.failed = true;
                rt.stop_graph(graph)
            }
        }
    }

    fn stop(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let graph = self.graph()?;
        ctx.runtime_mut().stop_graph(graph)
    }

    fn dispose(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        self.bindings.clear();
        match self.graph.take() {
            Some(graph) => ctx.runtime_mut().dispose_graph(graph),
            None => Ok(()),
        }
    }
}
