//! Graph Nodes
//!
//! A node is a slot in a graph: its signature, its lifecycle state, the cells
//! it owns and the user logic that computes it. The logic is a
//! [`NodeLogic`] trait object; while it runs it is taken out of the node
//! record so that it can freely borrow the runtime through a
//! [`NodeContext`].
//!
//! # Evaluation
//!
//! ```text
//! scheduled = uses_scheduler && scheduler.is_scheduled_now
//! if any required input is invalid:            skip
//! if uses_scheduler && !scheduled && no input modified: skip
//! last_evaluation_time = now
//! logic.eval(ctx)
//! scheduled ? scheduler.advance : schedule next pending event
//! ```

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{trace, warn};

use super::scheduler::{NodeScheduler, SchedulerHandle};
use super::signature::NodeSignature;
use crate::error::{EngineError, NodeError, Result};
use crate::lifecycle::LifecycleState;
use crate::runtime::Runtime;
use crate::series::{GraphKey, InputId, OutputId};
use crate::time::{EngineTime, MIN_DT};
use crate::value::{DeltaValue, Scalar};

/// Address of a node: its graph and its position in that graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub graph: GraphKey,
    pub ndx: usize,
}

impl NodeRef {
    pub fn new(graph: GraphKey, ndx: usize) -> Self {
        Self { graph, ndx }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.graph, self.ndx)
    }
}

/// User logic of a node.
///
/// Only `eval` is required. Lifecycle hooks default to doing nothing.
pub trait NodeLogic: Send {
    fn initialise(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn start(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<()>;

    fn stop(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn dispose(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Apply a push message. Returning `false` leaves the message queued for
    /// the next cycle; by default a message is deferred if the output already
    /// ticked this cycle.
    fn apply_message(&mut self, ctx: &mut NodeContext<'_>, message: DeltaValue) -> Result<bool> {
        let output = ctx.output()?;
        if ctx.runtime().output_modified(output) {
            return Ok(false);
        }
        ctx.runtime_mut().apply_result(output, message)?;
        Ok(true)
    }
}

pub(crate) struct NodeRecord {
    pub signature: Arc<NodeSignature>,
    pub state: LifecycleState,
    pub last_evaluation_time: EngineTime,
    /// Root input bundle, one field per argument.
    pub input: Option<InputId>,
    pub output: Option<OutputId>,
    pub error_output: Option<OutputId>,
    pub recordable_state: Option<OutputId>,
    /// The output belongs to another node (e.g. a map's per-key element).
    pub output_borrowed: bool,
    pub scheduler: NodeScheduler,
    /// `None` while the logic is executing.
    pub logic: Option<Box<dyn NodeLogic>>,
}

/// What a node's logic sees while it runs.
pub struct NodeContext<'a> {
    rt: &'a mut Runtime,
    node: NodeRef,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(rt: &'a mut Runtime, node: NodeRef) -> Self {
        Self { rt, node }
    }

    pub fn runtime(&self) -> &Runtime {
        self.rt
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        self.rt
    }

    pub fn node(&self) -> NodeRef {
        self.node
    }

    pub fn evaluation_time(&self) -> EngineTime {
        self.rt.evaluation_time()
    }

    pub fn signature(&self) -> Result<Arc<NodeSignature>> {
        Ok(self.rt.node_record(self.node)?.signature.clone())
    }

    pub fn graph_id(&self) -> Result<SmallVec<[i64; 4]>> {
        Ok(self.rt.graph(self.node.graph)?.id.clone())
    }

    /// The input bound to argument `name`.
    pub fn input(&self, name: &str) -> Result<InputId> {
        let root = self.rt.node_record(self.node)?.input.ok_or_else(|| {
            EngineError::wiring(format!("node {} has no inputs", self.node))
        })?;
        self.rt.input_field(root, name)
    }

    /// The primary output.
    pub fn output(&self) -> Result<OutputId> {
        self.rt
            .node_record(self.node)?
            .output
            .ok_or_else(|| EngineError::wiring(format!("node {} has no output", self.node)))
    }

    pub fn error_output(&self) -> Option<OutputId> {
        self.rt.node_record(self.node).ok()?.error_output
    }

    pub fn recordable_state(&self) -> Option<OutputId> {
        self.rt.node_record(self.node).ok()?.recordable_state
    }

    /// Scalar value of input `name`.
    pub fn value(&self, name: &str) -> Result<Option<Scalar>> {
        Ok(self.rt.input_value(self.input(name)?))
    }

    pub fn modified(&self, name: &str) -> bool {
        self.input(name).is_ok_and(|i| self.rt.input_modified(i))
    }

    pub fn valid(&self, name: &str) -> bool {
        self.input(name).is_ok_and(|i| self.rt.input_valid(i))
    }

    /// Set the primary output to a scalar.
    pub fn set_output(&mut self, value: impl Into<Scalar>) -> Result<()> {
        let output = self.output()?;
        self.rt.set_scalar(output, value)
    }

    pub fn apply_output(&mut self, value: DeltaValue) -> Result<()> {
        let output = self.output()?;
        self.rt.apply_result(output, value)
    }

    pub fn scheduler(&mut self) -> SchedulerHandle<'_> {
        SchedulerHandle::new(self.rt, self.node)
    }

    /// Ask the engine to stop after the current cycle.
    pub fn request_stop(&mut self) {
        self.rt.request_stop();
    }
}

impl Runtime {
    pub(crate) fn node_record(&self, node: NodeRef) -> Result<&NodeRecord> {
        self.graph(node.graph)?
            .nodes
            .get(node.ndx)
            .ok_or_else(|| EngineError::StaleHandle(format!("node {node}")))
    }

    pub(crate) fn node_record_mut(&mut self, node: NodeRef) -> Result<&mut NodeRecord> {
        self.graph_mut(node.graph)?
            .nodes
            .get_mut(node.ndx)
            .ok_or_else(|| EngineError::StaleHandle(format!("node {node}")))
    }

    pub fn node_state(&self, node: NodeRef) -> Option<LifecycleState> {
        self.node_record(node).ok().map(|n| n.state)
    }

    /// Starting or started.
    pub fn node_is_running(&self, node: NodeRef) -> bool {
        self.node_record(node).is_ok_and(|n| n.state.is_running())
    }

    pub fn node_last_evaluation_time(&self, node: NodeRef) -> EngineTime {
        self.node_record(node)
            .map_or(MIN_DT, |n| n.last_evaluation_time)
    }

    pub fn node_signature(&self, node: NodeRef) -> Result<Arc<NodeSignature>> {
        Ok(self.node_record(node)?.signature.clone())
    }

    pub fn node_input(&self, node: NodeRef, name: &str) -> Result<InputId> {
        let root = self
            .node_record(node)?
            .input
            .ok_or_else(|| EngineError::wiring(format!("node {node} has no inputs")))?;
        self.input_field(root, name)
    }

    pub fn node_output(&self, node: NodeRef) -> Option<OutputId> {
        self.node_record(node).ok()?.output
    }

    pub fn node_error_output(&self, node: NodeRef) -> Option<OutputId> {
        self.node_record(node).ok()?.error_output
    }

    /// `[graph ids]:ndx`, used in errors and alarm names.
    pub fn wiring_path(&self, node: NodeRef) -> Result<String> {
        let graph = self.graph(node.graph)?;
        let ids: Vec<String> = graph.id.iter().map(i64::to_string).collect();
        Ok(format!("[{}]:{}", ids.join(", "), node.ndx))
    }

    /// Point the node at an output owned elsewhere, releasing its own.
    pub(crate) fn replace_node_output(&mut self, node: NodeRef, output: OutputId) -> Result<()> {
        let record = self.node_record_mut(node)?;
        let previous = record.output.replace(output);
        let previous_owned = !record.output_borrowed;
        record.output_borrowed = true;
        if let Some(previous) = previous.filter(|p| previous_owned && *p != output) {
            self.release_output(previous);
        }
        Ok(())
    }

    /// Wake the node at `t` if it is running. Notifications to nodes that are
    /// not running are dropped; they sample their inputs when they start.
    pub fn notify_node(&mut self, node: NodeRef, t: EngineTime) -> Result<()> {
        if self.node_is_running(node) {
            self.schedule_node(node, t)
        } else {
            Ok(())
        }
    }

    /// Run one lifecycle hook of the node's logic with a context.
    pub(crate) fn with_node_logic<R>(
        &mut self,
        node: NodeRef,
        f: impl FnOnce(&mut dyn NodeLogic, &mut NodeContext<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut logic = self
            .node_record_mut(node)?
            .logic
            .take()
            .ok_or_else(|| EngineError::Lifecycle(format!("node {node} is already executing")))?;
        let result = {
            let mut ctx = NodeContext::new(self, node);
            f(logic.as_mut(), &mut ctx)
        };
        if let Ok(record) = self.node_record_mut(node) {
            record.logic = Some(logic);
        }
        result
    }

    pub(crate) fn initialise_node(&mut self, node: NodeRef) -> Result<()> {
        self.with_node_logic(node, |logic, ctx| logic.initialise(ctx))?;
        let record = self.node_record_mut(node)?;
        record.state = record.state.transition(LifecycleState::Initialised)?;
        Ok(())
    }

    pub(crate) fn start_node(&mut self, node: NodeRef) -> Result<()> {
        {
            let record = self.node_record_mut(node)?;
            record.state = record.state.transition(LifecycleState::Starting)?;
        }
        self.notify_before_start_node(node);
        let (signature, input) = {
            let record = self.node_record(node)?;
            (record.signature.clone(), record.input)
        };
        if let Some(input) = input {
            for (ndx, arg) in signature.args.iter().enumerate() {
                if signature.is_active(arg) {
                    let child = self.input_child(input, ndx)?;
                    self.make_active(child)?;
                }
            }
        }
        self.with_node_logic(node, |logic, ctx| logic.start(ctx))?;

        let next = {
            let scheduler = &self.node_record(node)?.scheduler;
            scheduler.requires_scheduling().then(|| scheduler.next_scheduled_time())
        };
        if let Some(next) = next {
            self.schedule_node(node, next)?;
        }
        {
            let record = self.node_record_mut(node)?;
            record.state = record.state.transition(LifecycleState::Started)?;
        }
        if let Some(input) = input {
            if self.apply_start_samples(input)? {
                let now = self.evaluation_time();
                self.notify_node(node, now)?;
            }
        }
        self.notify_after_start_node(node);
        Ok(())
    }

    pub(crate) fn eval_node(&mut self, node: NodeRef) -> Result<()> {
        let now = self.evaluation_time();
        let (signature, input) = {
            let record = self.node_record(node)?;
            (record.signature.clone(), record.input)
        };
        let uses_scheduler = signature.uses_scheduler;
        let scheduled = uses_scheduler && self.node_record(node)?.scheduler.is_scheduled_now(now);

        if let Some(input) = input.filter(|_| !signature.args.is_empty()) {
            if !self.node_inputs_ready(&signature, input)? {
                if scheduled {
                    self.advance_node_scheduler(node)?;
                }
                return Ok(());
            }
            if uses_scheduler && !scheduled {
                let mut any_modified = false;
                for ndx in 0..signature.args.len() {
                    any_modified |= self.input_modified(self.input_child(input, ndx)?);
                }
                if !any_modified {
                    self.schedule_pending_event(node)?;
                    return Ok(());
                }
            }
        }

        self.node_record_mut(node)?.last_evaluation_time = now;
        trace!(node = %node, name = %signature.name, "evaluating node");
        if let Err(err) = self.with_node_logic(node, |logic, ctx| logic.eval(ctx)) {
            if err.is_fatal() {
                return Err(err);
            }
            let error = self.capture_node_error(node, &err, "During evaluation")?;
            if !signature.capture_exception {
                return Err(error.into());
            }
            warn!(node = %node, error = %error, "captured node error");
            if let Some(error_output) = self.node_record(node)?.error_output {
                self.set_scalar(error_output, error)?;
            }
        }

        if scheduled {
            self.advance_node_scheduler(node)
        } else if uses_scheduler {
            self.schedule_pending_event(node)
        } else {
            Ok(())
        }
    }

    fn schedule_pending_event(&mut self, node: NodeRef) -> Result<()> {
        let now = self.evaluation_time();
        let next = self.node_record(node)?.scheduler.next_scheduled_time();
        if next > now {
            self.schedule_node(node, next)?;
        }
        Ok(())
    }

    fn node_inputs_ready(&self, signature: &NodeSignature, input: InputId) -> Result<bool> {
        for (ndx, arg) in signature.args.iter().enumerate() {
            let child = self.input_child(input, ndx)?;
            if signature.requires_valid(arg) && !self.input_valid(child) {
                return Ok(false);
            }
            let all_valid = signature
                .all_valid_inputs
                .as_ref()
                .is_some_and(|names| names.iter().any(|n| n == arg));
            if all_valid && !self.input_all_valid(child) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn stop_node(&mut self, node: NodeRef) -> Result<()> {
        {
            let record = self.node_record_mut(node)?;
            record.state = record.state.transition(LifecycleState::Stopping)?;
        }
        self.notify_before_stop_node(node);
        let result = self.with_node_logic(node, |logic, ctx| logic.stop(ctx));
        if let Some(input) = self.node_record(node)?.input {
            self.make_passive(input)?;
        }
        self.cancel_node_alarms(node)?;
        let record = self.node_record_mut(node)?;
        record.scheduler.reset();
        record.state = record.state.transition(LifecycleState::Stopped)?;
        self.notify_after_stop_node(node);
        result
    }

    pub(crate) fn dispose_node(&mut self, node: NodeRef) -> Result<()> {
        let result = self.with_node_logic(node, |logic, ctx| logic.dispose(ctx));
        let record = self.node_record_mut(node)?;
        record.state = record.state.transition(LifecycleState::Disposed)?;
        let input = record.input.take();
        let output = record.output.take().filter(|_| !record.output_borrowed);
        let owned: Vec<OutputId> = output
            .into_iter()
            .chain(record.error_output.take())
            .chain(record.recordable_state.take())
            .collect();
        if let Some(input) = input {
            self.release_input(input)?;
        }
        for output in owned {
            self.release_output(output);
        }
        result
    }
}
