//! Mesh node.
//!
//! A mesh is a map whose key graphs may read each other's results. A key
//! graph asks for another key through the mesh's named context (see
//! [`Runtime::request_mesh_dependency`]); the mesh creates a graph for the
//! requested key if it has none and ranks keys so that a key is always
//! evaluated after everything it depends on. A request that would close a
//! cycle fails with [`EngineError::MeshCycle`].

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use super::map::{keyed_node_builder, KeyedGraphs, MapSpec};
use crate::error::{EngineError, Result};
use crate::graph::{NodeBuilder, NodeContext, NodeKind, NodeLogic, NodeRef, NodeSignature};
use crate::runtime::Runtime;
use crate::series::{OutputId, TsType};
use crate::value::{Scalar, TimeSeriesReference};

/// Dependency state of one mesh, shared with its key graphs by name.
#[derive(Debug)]
pub(crate) struct MeshContext {
    owner: NodeRef,
    output: Option<OutputId>,
    ranks: IndexMap<Scalar, usize>,
    /// Key to the keys it reads.
    dependencies: IndexMap<Scalar, IndexSet<Scalar>>,
    /// Requested keys still waiting for a graph.
    pending: IndexSet<Scalar>,
    /// Keys that gained a dependency while evaluating and must run again.
    reevaluate: IndexSet<Scalar>,
}

impl MeshContext {
    fn new(owner: NodeRef, output: Option<OutputId>) -> Self {
        Self {
            owner,
            output,
            ranks: IndexMap::new(),
            dependencies: IndexMap::new(),
            pending: IndexSet::new(),
            reevaluate: IndexSet::new(),
        }
    }

    fn rank(&self, key: &Scalar) -> usize {
        self.ranks.get(key).copied().unwrap_or(0)
    }

    /// Whether `from` reads `to`, directly or through other keys.
    fn reaches(&self, from: &Scalar, to: &Scalar) -> bool {
        let mut seen = IndexSet::new();
        let mut stack = vec![from];
        while let Some(key) = stack.pop() {
            if key == to {
                return true;
            }
            if !seen.insert(key) {
                continue;
            }
            if let Some(deps) = self.dependencies.get(key) {
                stack.extend(deps.iter());
            }
        }
        false
    }

    /// Raise ranks from `key` onwards until every key outranks what it reads.
    fn rerank(&mut self, key: &Scalar) {
        let mut stack = vec![key.clone()];
        while let Some(key) = stack.pop() {
            let rank = self
                .dependencies
                .get(&key)
                .and_then(|deps| deps.iter().map(|d| self.rank(d) + 1).max())
                .unwrap_or(0);
            if rank <= self.rank(&key) && self.ranks.contains_key(&key) {
                continue;
            }
            self.ranks.insert(key.clone(), rank);
            for (dependent, deps) in &self.dependencies {
                if deps.contains(&key) {
                    stack.push(dependent.clone());
                }
            }
        }
    }

    /// Keys some other key depends on.
    fn required_keys(&self) -> IndexSet<Scalar> {
        self.dependencies.values().flatten().cloned().collect()
    }

    fn dependents_of(&self, key: &Scalar) -> Vec<Scalar> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.contains(key))
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }

    /// Drop the state of keys that no longer have a graph.
    fn retain_keys(&mut self, active: &IndexSet<Scalar>) {
        let pending = &self.pending;
        self.dependencies.retain(|key, _| active.contains(key) || pending.contains(key));
        self.ranks.retain(|key, _| active.contains(key) || pending.contains(key));
    }

    fn forget(&mut self, key: &Scalar) {
        self.dependencies.shift_remove(key);
        self.ranks.shift_remove(key);
        self.pending.shift_remove(key);
        self.reevaluate.shift_remove(key);
    }
}

impl Runtime {
    fn mesh_context(&self, name: &str) -> Result<&MeshContext> {
        self.mesh_contexts
            .get(name)
            .ok_or_else(|| EngineError::wiring(format!("no mesh named `{name}`")))
    }

    fn mesh_context_mut(&mut self, name: &str) -> Result<&mut MeshContext> {
        self.mesh_contexts
            .get_mut(name)
            .ok_or_else(|| EngineError::wiring(format!("no mesh named `{name}`")))
    }

    /// Record that the graph for `key` in mesh `context` reads the result of
    /// `depends_on`, and return a reference to that result.
    pub fn request_mesh_dependency(
        &mut self,
        context: &str,
        key: &Scalar,
        depends_on: Scalar,
    ) -> Result<TimeSeriesReference> {
        let mesh = self.mesh_context_mut(context)?;
        if mesh.reaches(&depends_on, key) {
            return Err(EngineError::MeshCycle {
                context: context.to_string(),
                from: key.to_string(),
                to: depends_on.to_string(),
            });
        }
        if mesh.dependencies.entry(key.clone()).or_default().insert(depends_on.clone()) {
            debug!(mesh = context, from = %key, to = %depends_on, "mesh dependency added");
            if !mesh.ranks.contains_key(&depends_on) {
                mesh.ranks.insert(depends_on.clone(), 0);
                mesh.pending.insert(depends_on.clone());
            }
            mesh.rerank(key);
            mesh.reevaluate.insert(key.clone());
        }
        let output = mesh.output;
        match output {
            Some(output) => Ok(self.dict_get_or_create(output, depends_on)?.into()),
            None => Ok(TimeSeriesReference::Empty),
        }
    }

    /// Rank of `key` within mesh `context`; keys are evaluated in rank order.
    pub fn mesh_rank(&self, context: &str, key: &Scalar) -> Result<usize> {
        Ok(self.mesh_context(context)?.rank(key))
    }
}

impl NodeContext<'_> {
    /// See [`Runtime::request_mesh_dependency`].
    pub fn request_mesh_dependency(
        &mut self,
        context: &str,
        key: &Scalar,
        depends_on: Scalar,
    ) -> Result<TimeSeriesReference> {
        self.runtime_mut().request_mesh_dependency(context, key, depends_on)
    }
}

struct MeshNode {
    context: String,
    graphs: KeyedGraphs,
}

impl MeshNode {
    fn create_pending(&mut self, rt: &mut Runtime, node: NodeRef) -> Result<()> {
        let pending: Vec<Scalar> = rt.mesh_context_mut(&self.context)?.pending.drain(..).collect();
        for key in pending {
            if self.graphs.graph(&key).is_none() {
                self.graphs.create_key(rt, node, key)?;
            }
        }
        Ok(())
    }

    /// Remove graphs nothing asks for any more.
    fn drop_orphans(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let keys = self.graphs.key_set_input(ctx)?;
        let node = ctx.node();
        let rt = ctx.runtime_mut();
        let present: IndexSet<Scalar> = rt.input_set_values(keys).into_iter().collect();
        loop {
            let active: IndexSet<Scalar> = self.graphs.keys().into_iter().collect();
            let mesh = rt.mesh_context_mut(&self.context)?;
            mesh.retain_keys(&active);
            let required = mesh.required_keys();
            let orphans: Vec<Scalar> = self
                .graphs
                .keys()
                .into_iter()
                .filter(|k| !present.contains(k) && !required.contains(k))
                .collect();
            if orphans.is_empty() {
                return Ok(());
            }
            for key in orphans {
                self.graphs.remove_key(rt, node, &key)?;
                rt.mesh_context_mut(&self.context)?.forget(&key);
            }
        }
    }
}

impl NodeLogic for MeshNode {
    fn initialise(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        self.graphs.validate(ctx)
    }

    fn start(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let node = ctx.node();
        let output = ctx.runtime().node_output(node);
        let rt = ctx.runtime_mut();
        if let Some(existing) = rt.mesh_contexts.get(&self.context) {
            return Err(EngineError::wiring(format!(
                "mesh `{}` is already registered by node {}",
                self.context, existing.owner
            )));
        }
        rt.mesh_contexts
            .insert(self.context.clone(), MeshContext::new(node, output));
        self.graphs.start(ctx)
    }

    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let node = ctx.node();
        let now = ctx.evaluation_time();
        let required = ctx.runtime().mesh_context(&self.context)?.required_keys();
        self.graphs.sync_keys(ctx, &required)?;
        self.drop_orphans(ctx)?;

        let rt = ctx.runtime_mut();
        let mut evaluated: IndexSet<Scalar> = IndexSet::new();
        loop {
            self.create_pending(rt, node)?;
            self.graphs.collect_schedules(rt)?;
            let rerun: Vec<Scalar> = rt.mesh_context_mut(&self.context)?.reevaluate.drain(..).collect();
            for key in rerun {
                evaluated.shift_remove(&key);
                self.graphs.schedule_key(key, now);
            }

            let mesh = rt.mesh_context(&self.context)?;
            let next = self
                .graphs
                .due_keys(now)
                .into_iter()
                .filter(|(key, _)| !evaluated.contains(key))
                .min_by_key(|(key, _)| mesh.rank(key));
            let Some((key, due)) = next else {
                break;
            };

            self.graphs.evaluate_key(rt, node, &key, due, true)?;
            let ticked = rt
                .node_output(node)
                .and_then(|output| rt.dict_get(output, &key))
                .is_some_and(|element| rt.output_modified(element));
            if ticked {
                let dependents = rt.mesh_context(&self.context)?.dependents_of(&key);
                for dependent in dependents {
                    evaluated.shift_remove(&dependent);
                    self.graphs.schedule_key(dependent, now);
                }
            }
            evaluated.insert(key);
        }
        self.graphs.reschedule(rt, node)
    }

    fn stop(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let result = self.graphs.stop_all(ctx);
        ctx.runtime_mut().mesh_contexts.remove(&self.context);
        result
    }

    fn dispose(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        self.graphs.dispose_all(ctx.runtime_mut())
    }
}

/// A mesh node registered under `context`.
pub fn mesh_node<S: Into<String>>(
    name: &str,
    context: &str,
    spec: MapSpec,
    inputs: impl IntoIterator<Item = (S, TsType)>,
    output: Option<TsType>,
) -> NodeBuilder {
    let spec = Arc::new(spec);
    let factory_spec = spec.clone();
    let context = context.to_string();
    keyed_node_builder(name, &spec, inputs, output, move || {
        Box::new(MeshNode {
            context: context.clone(),
            graphs: KeyedGraphs::new(factory_spec.clone()),
        })
    })
}

#[derive(Debug, Clone)]
struct MeshLookup {
    context: String,
}

impl NodeLogic for MeshLookup {
    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let key = ctx
            .value("key")?
            .ok_or_else(|| EngineError::evaluation("mesh lookup without a key"))?;
        let depends_on = ctx
            .value("depends_on")?
            .ok_or_else(|| EngineError::evaluation("mesh lookup without a dependency"))?;
        let reference = ctx.request_mesh_dependency(&self.context, &key, depends_on)?;
        let output = ctx.output()?;
        let rt = ctx.runtime_mut();
        if rt.output_valid(output) && rt.reference_output_value(output).as_ref() == Some(&reference) {
            return Ok(());
        }
        rt.set_reference(output, reference)
    }
}

/// Node for use inside a mesh key graph: given the graph's own `key` and a
/// `depends_on` key, publishes a reference to the mesh result for
/// `depends_on`, whose type is `tp`.
pub fn mesh_lookup(name: &str, context: &str, tp: TsType) -> NodeBuilder {
    let context = context.to_string();
    NodeBuilder::new(NodeSignature::new(name, NodeKind::Compute), move || {
        Box::new(MeshLookup {
            context: context.clone(),
        })
    })
    .with_inputs([("key", TsType::Value), ("depends_on", TsType::Value)])
    .with_output(TsType::reference(tp))
}
