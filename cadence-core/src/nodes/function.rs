//! Function nodes.
//!
//! Ready-made node builders around plain closures, plus the source nodes
//! every graph needs: a replaying pull source, a push source fed from other
//! threads, and a recording sink.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::graph::{NodeBuilder, NodeContext, NodeKind, NodeLogic, NodeSignature};
use crate::series::TsType;
use crate::time::EngineTime;
use crate::value::DeltaValue;

type EvalFn = Arc<dyn Fn(&mut NodeContext<'_>) -> Result<()> + Send + Sync>;

/// Logic that calls a shared closure on every evaluation.
#[derive(Clone)]
pub struct FnNode {
    eval: EvalFn,
}

impl FnNode {
    pub fn new<F>(eval: F) -> Self
    where
        F: Fn(&mut NodeContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self { eval: Arc::new(eval) }
    }
}

impl NodeLogic for FnNode {
    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        (self.eval)(ctx)
    }
}

fn fn_builder<S: Into<String>>(
    signature: NodeSignature,
    inputs: impl IntoIterator<Item = (S, TsType)>,
    logic: FnNode,
) -> NodeBuilder {
    NodeBuilder::new(signature, move || Box::new(logic.clone())).with_inputs(inputs)
}

/// A compute node evaluating `eval` whenever an active input ticks.
pub fn compute_node<S, F>(
    name: &str,
    inputs: impl IntoIterator<Item = (S, TsType)>,
    output: TsType,
    eval: F,
) -> NodeBuilder
where
    S: Into<String>,
    F: Fn(&mut NodeContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    fn_builder(NodeSignature::new(name, NodeKind::Compute), inputs, FnNode::new(eval)).with_output(output)
}

/// Like [`compute_node`] but with a caller-supplied signature, for custom
/// validity, activity, scheduling or error capture.
pub fn compute_node_with<S, F>(
    signature: NodeSignature,
    inputs: impl IntoIterator<Item = (S, TsType)>,
    output: Option<TsType>,
    eval: F,
) -> NodeBuilder
where
    S: Into<String>,
    F: Fn(&mut NodeContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    let builder = fn_builder(signature, inputs, FnNode::new(eval));
    match output {
        Some(output) => builder.with_output(output),
        None => builder,
    }
}

/// A node without output.
pub fn sink_node<S, F>(name: &str, inputs: impl IntoIterator<Item = (S, TsType)>, eval: F) -> NodeBuilder
where
    S: Into<String>,
    F: Fn(&mut NodeContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    fn_builder(NodeSignature::new(name, NodeKind::Sink), inputs, FnNode::new(eval))
}

/// Pull source emitting a fixed sequence of `(time, value)` ticks.
#[derive(Debug, Clone)]
struct ReplaySource {
    values: Arc<[(EngineTime, DeltaValue)]>,
    position: usize,
}

impl ReplaySource {
    fn schedule_next(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let now = ctx.evaluation_time();
        while let Some((when, _)) = self.values.get(self.position) {
            if *when >= now {
                let node = ctx.node();
                return ctx.runtime_mut().schedule_node(node, *when);
            }
            self.position += 1;
        }
        Ok(())
    }
}

impl NodeLogic for ReplaySource {
    fn start(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        self.position = 0;
        self.schedule_next(ctx)
    }

    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let now = ctx.evaluation_time();
        if let Some((when, value)) = self.values.get(self.position) {
            if *when == now {
                ctx.apply_output(value.clone())?;
                self.position += 1;
            }
        }
        self.schedule_next(ctx)
    }
}

/// A pull source replaying `values`, whose times must be strictly increasing.
pub fn replay_source(name: &str, output: TsType, values: Vec<(EngineTime, DeltaValue)>) -> NodeBuilder {
    let values: Arc<[(EngineTime, DeltaValue)]> = values.into();
    NodeBuilder::new(NodeSignature::new(name, NodeKind::PullSource), move || {
        Box::new(ReplaySource {
            values: values.clone(),
            position: 0,
        })
    })
    .with_output(output)
}

#[derive(Debug, Clone, Copy)]
struct PushSourceNode;

impl NodeLogic for PushSourceNode {
    fn eval(&mut self, _ctx: &mut NodeContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// A push source; feed it with [`PushMessageSender`](crate::runtime::PushMessageSender).
pub fn push_source(name: &str, output: TsType) -> NodeBuilder {
    NodeBuilder::new(NodeSignature::new(name, NodeKind::PushSource), || Box::new(PushSourceNode))
        .with_output(output)
}

/// Ticks captured by [`record_sink`].
pub type Recording = Arc<Mutex<Vec<(EngineTime, DeltaValue)>>>;

/// A sink that records the delta of its `ts` input every time it ticks.
pub fn record_sink(name: &str, tp: TsType) -> (NodeBuilder, Recording) {
    let recording = Recording::default();
    let sink = recording.clone();
    let builder = sink_node(name, [("ts", tp)], move |ctx| {
        let input = ctx.input("ts")?;
        if let Some(delta) = ctx.runtime().input_delta_value(input) {
            sink.lock().push((ctx.evaluation_time(), delta));
        }
        Ok(())
    });
    (builder, recording)
}

#[derive(Debug, Clone, Copy)]
struct RecordedReplay;

impl NodeLogic for RecordedReplay {
    fn start(&mut self, _ctx: &mut NodeContext<'_>) -> Result<()> {
        Err(EngineError::NotImplemented("replay of recorded state"))
    }

    fn eval(&mut self, _ctx: &mut NodeContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// A source restoring recorded state under `record_replay_id`.
///
/// Recording and replay are not supported; starting this node fails.
pub fn recorded_replay_source(name: &str, record_replay_id: &str, output: TsType) -> NodeBuilder {
    let signature = NodeSignature::new(name, NodeKind::PullSource).with_record_replay_id(record_replay_id);
    NodeBuilder::new(signature, || Box::new(RecordedReplay)).with_output(output)
}
