//! Reduce node.
//!
//! Folds a binary operation over every element of a dict input without
//! re-running the pairs that did not change. The operation graph is
//! instantiated once per node of a complete binary tree whose leaves are key
//! slots:
//!
//! ```text
//!                  op6
//!          op2             op5
//!      op0     op1     op3     op4
//!     s0  s1  s2  s3  s4  s5  s6  s7
//! ```
//!
//! Ops are laid out left subtree first, then right subtree, then root, so
//! the tree of half the capacity is always a prefix of the larger one:
//! growing appends a right subtree and a new root, shrinking truncates them.
//! Free leaves are bound to the `zero` input.
//!
//! Keys occupy the lowest slots. Removing a key moves the key in the highest
//! bound slot into the hole, which reorders operands; the operation must be
//! commutative as well as associative.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use super::nested::NestedGraph;
use super::stubs::STUB_INPUT;
use crate::error::{EngineError, Result};
use crate::graph::{GraphBuilder, NodeBuilder, NodeContext, NodeKind, NodeLogic, NodeRef, NodeSignature};
use crate::runtime::Runtime;
use crate::series::{GraphKey, InputId, OutputId, TsType};
use crate::time::MAX_DT;
use crate::value::{Scalar, TimeSeriesReference};

/// Where one operand of a tree op comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operand {
    Slot(usize),
    Op(usize),
}

/// Slot bookkeeping of a reduce tree, independent of any graph.
#[derive(Debug, Clone)]
pub(crate) struct ReduceTree {
    capacity: usize,
    layout: Vec<(Operand, Operand)>,
    bound: IndexMap<Scalar, usize>,
    /// Free slots, highest first so `pop` yields the lowest.
    free: Vec<usize>,
}

/// What adding or removing a key did to the tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct TreeChange {
    /// Capacity before the tree grew.
    pub grown_from: Option<usize>,
    /// Slot that now holds a key and needs rebinding.
    pub bound: Option<(Scalar, usize)>,
    /// Slot that became free and needs zeroing.
    pub freed: Option<usize>,
}

impl ReduceTree {
    const MIN_CAPACITY: usize = 2;
    const SHRINK_ABOVE: usize = 8;

    pub(crate) fn new() -> Self {
        Self {
            capacity: Self::MIN_CAPACITY,
            layout: Self::layout(Self::MIN_CAPACITY),
            bound: IndexMap::new(),
            free: (0..Self::MIN_CAPACITY).rev().collect(),
        }
    }

    /// Operands of every op of a tree with `capacity` leaves, in op order.
    fn layout(capacity: usize) -> Vec<(Operand, Operand)> {
        fn build(base_slot: usize, capacity: usize, out: &mut Vec<(Operand, Operand)>) -> usize {
            if capacity <= 2 {
                out.push((Operand::Slot(base_slot), Operand::Slot(base_slot + 1)));
            } else {
                let half = capacity / 2;
                let left = build(base_slot, half, out);
                let right = build(base_slot + half, half, out);
                out.push((Operand::Op(left), Operand::Op(right)));
            }
            out.len() - 1
        }
        let mut out = Vec::with_capacity(capacity - 1);
        build(0, capacity, &mut out);
        out
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn op_count(&self) -> usize {
        self.layout.len()
    }

    pub(crate) fn root(&self) -> usize {
        self.layout.len() - 1
    }

    pub(crate) fn operands(&self, op: usize) -> Option<(Operand, Operand)> {
        self.layout.get(op).copied()
    }

    /// The op and side (`false` for lhs) reading `slot`.
    pub(crate) fn leaf(&self, slot: usize) -> Option<(usize, bool)> {
        self.layout.iter().enumerate().find_map(|(op, (lhs, rhs))| {
            if *lhs == Operand::Slot(slot) {
                Some((op, false))
            } else if *rhs == Operand::Slot(slot) {
                Some((op, true))
            } else {
                None
            }
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.bound.len()
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn slot(&self, key: &Scalar) -> Option<usize> {
        self.bound.get(key).copied()
    }

    pub(crate) fn key_at(&self, slot: usize) -> Option<&Scalar> {
        self.bound.iter().find(|(_, s)| **s == slot).map(|(k, _)| k)
    }

    pub(crate) fn keys(&self) -> Vec<Scalar> {
        self.bound.keys().cloned().collect()
    }

    /// Bind `key` to the lowest free slot, growing by one layer if full.
    pub(crate) fn add(&mut self, key: Scalar) -> TreeChange {
        let mut change = TreeChange::default();
        if let Some(slot) = self.bound.get(&key) {
            change.bound = Some((key, *slot));
            return change;
        }
        if self.free.is_empty() {
            change.grown_from = Some(self.capacity);
            let previous = self.capacity;
            self.capacity *= 2;
            self.layout = Self::layout(self.capacity);
            self.free.extend((previous..self.capacity).rev());
        }
        // Free slots are kept sorted, highest first.
        if let Some(slot) = self.free.pop() {
            self.bound.insert(key.clone(), slot);
            change.bound = Some((key, slot));
        }
        change
    }

    /// Free the slot of `key`, keeping bound slots packed at the bottom.
    pub(crate) fn remove(&mut self, key: &Scalar) -> TreeChange {
        let mut change = TreeChange::default();
        let Some(slot) = self.bound.shift_remove(key) else {
            return change;
        };
        let highest = self
            .bound
            .iter()
            .max_by_key(|(_, s)| **s)
            .map(|(k, s)| (k.clone(), *s));
        let freed = match highest {
            Some((moved, from)) if from > slot => {
                self.bound.insert(moved.clone(), slot);
                change.bound = Some((moved, slot));
                from
            }
            _ => slot,
        };
        self.free.push(freed);
        self.free.sort_unstable_by(|a, b| b.cmp(a));
        change.freed = Some(freed);
        change
    }

    /// Whether the tree is sparse enough to halve.
    pub(crate) fn should_shrink(&self) -> bool {
        self.capacity > Self::SHRINK_ABOVE
            && 4 * self.free.len() > 3 * self.bound.len()
            && self.bound.len() <= self.capacity / 2
    }

    /// Halve the capacity, dropping the free slots above it.
    pub(crate) fn shrink(&mut self) {
        self.capacity /= 2;
        self.layout.truncate(self.capacity - 1);
        let capacity = self.capacity;
        self.free.retain(|s| *s < capacity);
        self.free.sort_unstable_by(|a, b| b.cmp(a));
    }
}

/// A reduce node folding `op` over the elements of its `ts` dict input.
///
/// `op` must name `lhs` and `rhs` reference stubs and an output node. Leaves
/// without a key read the `zero` input. The result is published as a
/// reference to the root op's output.
pub fn reduce_node(name: &str, op: NestedGraph, element: TsType) -> NodeBuilder {
    let op = Arc::new(op);
    let signature = NodeSignature::new(name, NodeKind::Compute)
        .with_valid_inputs(Vec::<String>::new())
        .with_active_inputs(["zero"]);
    NodeBuilder::new(signature, move || Box::new(ReduceNode::new(op.clone())))
        .with_inputs([("ts", TsType::dict(element.clone())), ("zero", element.clone())])
        .with_output(TsType::reference(element))
}

type Binding = (Option<OutputId>, Option<TimeSeriesReference>);

struct ReduceNode {
    op: Arc<NestedGraph>,
    tree: ReduceTree,
    graph: Option<GraphKey>,
    zero: Option<Binding>,
}

impl ReduceNode {
    fn new(op: Arc<NestedGraph>) -> Self {
        Self {
            op,
            tree: ReduceTree::new(),
            graph: None,
            zero: None,
        }
    }

    fn graph(&self) -> Result<GraphKey> {
        self.graph
            .ok_or_else(|| EngineError::Lifecycle("reduce node has no tree graph".to_string()))
    }

    fn op_node(&self, graph: GraphKey, op: usize, ndx: usize) -> NodeRef {
        NodeRef::new(graph, op * self.op.builder.len() + ndx)
    }

    fn operand_input(&self, rt: &Runtime, graph: GraphKey, op: usize, rhs: bool) -> Result<InputId> {
        let arg = if rhs { "rhs" } else { "lhs" };
        let ndx = self
            .op
            .input_node_ids
            .get(arg)
            .copied()
            .ok_or_else(|| EngineError::wiring(format!("reduce op has no `{arg}` input")))?;
        rt.node_input(self.op_node(graph, op, ndx), STUB_INPUT)
    }

    fn op_output(&self, rt: &Runtime, graph: GraphKey, op: usize) -> Result<OutputId> {
        let ndx = self
            .op
            .output_node_id
            .ok_or_else(|| EngineError::wiring("reduce op has no output node"))?;
        let node = self.op_node(graph, op, ndx);
        rt.node_output(node)
            .ok_or_else(|| EngineError::wiring(format!("reduce op output node {node} has no output")))
    }

    /// Point `slot` at its key's element, or at zero when free.
    fn bind_slot(&self, ctx: &mut NodeContext<'_>, graph: GraphKey, slot: usize) -> Result<()> {
        let Some((op, rhs)) = self.tree.leaf(slot) else {
            return Ok(());
        };
        let ts = ctx.input("ts")?;
        let zero = ctx.input("zero")?;
        let rt = ctx.runtime_mut();
        let source = self
            .tree
            .key_at(slot)
            .and_then(|key| rt.dict_input_get(ts, key))
            .unwrap_or(zero);
        let stub = self.operand_input(rt, graph, op, rhs)?;
        rt.clone_binding(stub, source)
    }

    /// Append and wire the ops from `first` to the end of the layout.
    fn build_ops(&self, ctx: &mut NodeContext<'_>, graph: GraphKey, first: usize) -> Result<()> {
        let op_len = self.op.builder.len();
        let start = first * op_len;
        for _ in first..self.tree.op_count() {
            ctx.runtime_mut().extend_graph(graph, &self.op.builder, true)?;
        }
        for op in first..self.tree.op_count() {
            let Some(operands) = self.tree.operands(op) else {
                continue;
            };
            for (operand, rhs) in [(operands.0, false), (operands.1, true)] {
                match operand {
                    Operand::Slot(slot) => self.bind_slot(ctx, graph, slot)?,
                    Operand::Op(child) => {
                        let rt = ctx.runtime_mut();
                        let stub = self.operand_input(rt, graph, op, rhs)?;
                        let output = self.op_output(rt, graph, child)?;
                        rt.bind_output(stub, output)?;
                    }
                }
            }
        }
        let end = self.tree.op_count() * op_len;
        let rt = ctx.runtime_mut();
        if rt.graph_state(graph).is_some_and(|s| s.is_running()) {
            rt.start_subgraph(graph, start, end)?;
        }
        Ok(())
    }

    fn publish_root(&self, ctx: &mut NodeContext<'_>, graph: GraphKey) -> Result<()> {
        let output = ctx.output()?;
        let rt = ctx.runtime_mut();
        let root = TimeSeriesReference::from(self.op_output(rt, graph, self.tree.root())?);
        if rt.reference_output_value(output).as_ref() == Some(&root) {
            return Ok(());
        }
        rt.set_reference(output, root)
    }

    fn apply_change(&mut self, ctx: &mut NodeContext<'_>, graph: GraphKey, change: TreeChange) -> Result<()> {
        if let Some(previous) = change.grown_from {
            debug!(node = %ctx.node(), capacity = self.tree.capacity(), "reduce tree grown");
            self.build_ops(ctx, graph, previous - 1)?;
        }
        if let Some((_, slot)) = change.bound {
            self.bind_slot(ctx, graph, slot)?;
        }
        if let Some(slot) = change.freed {
            self.bind_slot(ctx, graph, slot)?;
        }
        Ok(())
    }

    fn sync_keys(&mut self, ctx: &mut NodeContext<'_>, graph: GraphKey) -> Result<()> {
        let ts = ctx.input("ts")?;
        let rt = ctx.runtime();
        let keys = rt.dict_input_key_set(ts)?;
        let removed = rt.input_set_removed(keys);
        let added = rt.input_set_added(keys);
        let present: Vec<Scalar> = rt.input_set_values(keys);

        for key in removed {
            let change = self.tree.remove(&key);
            self.apply_change(ctx, graph, change)?;
        }
        for key in added {
            let change = self.tree.add(key);
            self.apply_change(ctx, graph, change)?;
        }
        for key in self.tree.keys() {
            if !present.contains(&key) {
                let change = self.tree.remove(&key);
                self.apply_change(ctx, graph, change)?;
            }
        }
        for key in present {
            if self.tree.slot(&key).is_none() {
                let change = self.tree.add(key);
                self.apply_change(ctx, graph, change)?;
            }
        }

        while self.tree.should_shrink() {
            self.tree.shrink();
            debug!(
                node = %ctx.node(),
                capacity = self.tree.capacity(),
                keys = self.tree.len(),
                free = self.tree.free_len(),
                "reduce tree shrunk"
            );
            self.publish_root(ctx, graph)?;
            let start = self.tree.op_count() * self.op.builder.len();
            ctx.runtime_mut().reduce_graph(graph, start)?;
        }
        Ok(())
    }

    fn rebind_zero(&mut self, ctx: &mut NodeContext<'_>, graph: GraphKey) -> Result<()> {
        let zero = ctx.input("zero")?;
        let rt = ctx.runtime();
        let binding = (rt.input_output(zero), rt.reference_input_value(zero));
        if self.zero.as_ref() == Some(&binding) {
            return Ok(());
        }
        self.zero = Some(binding);
        for slot in 0..self.tree.capacity() {
            if self.tree.key_at(slot).is_none() {
                self.bind_slot(ctx, graph, slot)?;
            }
        }
        Ok(())
    }
}

impl NodeLogic for ReduceNode {
    fn initialise(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        for arg in ["lhs", "rhs"] {
            if !self.op.input_node_ids.contains_key(arg) {
                return Err(EngineError::wiring(format!("reduce op has no `{arg}` input")));
            }
        }
        if self.op.output_node_id.is_none() {
            return Err(EngineError::wiring("reduce op has no output node"));
        }
        let tree = NestedGraph::new(GraphBuilder::new());
        let node = ctx.node();
        self.graph = Some(tree.instantiate(ctx.runtime_mut(), node, 0, None)?);
        Ok(())
    }

    fn start(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let graph = self.graph()?;
        self.tree = ReduceTree::new();
        self.zero = None;
        self.build_ops(ctx, graph, 0)?;
        ctx.runtime_mut().start_graph(graph)?;
        self.publish_root(ctx, graph)?;

        let ts = ctx.input("ts")?;
        let node = ctx.node();
        let now = ctx.evaluation_time();
        let rt = ctx.runtime_mut();
        let keys = rt.dict_input_key_set(ts)?;
        rt.make_active(keys)?;
        rt.schedule_node(node, now)
    }

    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let graph = self.graph()?;
        self.rebind_zero(ctx, graph)?;
        self.sync_keys(ctx, graph)?;
        self.publish_root(ctx, graph)?;

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
        let ts = ctx.input("ts")?;
        let rt = ctx.runtime_mut();
        let keys = rt.dict_input_key_set(ts)?;
        rt.make_passive(keys)?;
        let graph = self.graph()?;
        let stopped = rt.stop_graph(graph);
        let len = rt.graph_len(graph);
        // Restarting rebuilds the tree from scratch.
        let reduced = rt.reduce_graph(graph, 0);
        debug!(node = %ctx.node(), nodes = len, "reduce tree stopped");
        stopped.and(reduced)
    }

    fn dispose(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        match self.graph.take() {
            Some(graph) => ctx.runtime_mut().dispose_graph(graph),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: i64) -> Scalar {
        Scalar::Int(i)
    }

    fn assert_packed(tree: &ReduceTree) {
        assert!(tree.capacity().is_power_of_two());
        assert_eq!(tree.len() + tree.free_len(), tree.capacity());
        assert_eq!(tree.op_count(), tree.capacity() - 1);
        for k in tree.keys() {
            assert!(tree.slot(&k).unwrap() < tree.len(), "bound slots are packed low");
        }
    }

    #[test]
    fn test_layout_root_combines_halves() {
        let tree = ReduceTree {
            capacity: 8,
            layout: ReduceTree::layout(8),
            bound: IndexMap::new(),
            free: (0..8).rev().collect(),
        };
        assert_eq!(tree.op_count(), 7);
        assert_eq!(tree.operands(6), Some((Operand::Op(2), Operand::Op(5))));
        assert_eq!(tree.operands(2), Some((Operand::Op(0), Operand::Op(1))));
        assert_eq!(tree.operands(3), Some((Operand::Slot(4), Operand::Slot(5))));
        assert_eq!(tree.leaf(7), Some((4, true)));
    }

    #[test]
    fn test_smaller_layout_is_prefix() {
        let small = ReduceTree::layout(4);
        let large = ReduceTree::layout(16);
        assert_eq!(&large[..small.len()], &small[..]);
    }

    #[test]
    fn test_grows_one_layer_when_full() {
        let mut tree = ReduceTree::new();
        tree.add(key(1));
        let change = tree.add(key(2));
        assert_eq!(change.grown_from, None);
        let change = tree.add(key(3));
        assert_eq!(change.grown_from, Some(2));
        assert_eq!(change.bound, Some((key(3), 2)));
        assert_eq!(tree.capacity(), 4);
        assert_packed(&tree);
    }

    #[test]
    fn test_remove_moves_highest_into_hole() {
        let mut tree = ReduceTree::new();
        for i in 0..4 {
            tree.add(key(i));
        }
        let change = tree.remove(&key(1));
        assert_eq!(change.bound, Some((key(3), 1)));
        assert_eq!(change.freed, Some(3));
        assert_eq!(tree.slot(&key(3)), Some(1));
        assert_packed(&tree);

        let change = tree.remove(&key(3));
        assert_eq!(change.bound, Some((key(2), 1)));
        assert_eq!(change.freed, Some(2));

        let change = tree.remove(&key(2));
        assert_eq!(change.bound, None);
        assert_eq!(change.freed, Some(1));
        assert_packed(&tree);
    }

    #[test]
    fn test_shrinks_conservatively() {
        let mut tree = ReduceTree::new();
        for i in 0..16 {
            tree.add(key(i));
        }
        assert_eq!(tree.capacity(), 16);
        for i in 4..16 {
            tree.remove(&key(i));
            while tree.should_shrink() {
                tree.shrink();
            }
            assert_packed(&tree);
        }
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.capacity(), 8, "never shrinks to 8 or below");
        assert!(!tree.should_shrink());
    }

    #[test]
    fn test_readding_keeps_slot() {
        let mut tree = ReduceTree::new();
        tree.add(key(1));
        let change = tree.add(key(1));
        assert_eq!(change.bound, Some((key(1), 0)));
        assert_eq!(tree.len(), 1);
    }
}
