//! The output side of the time-series protocol.
//!
//! An output is valid once it has ticked (`last_modified_time > MIN_DT`) and
//! modified in the cycle it ticked in. Ticking propagates upwards through the
//! parent chain and then fans out to the subscribed nodes:
//!
//! ```text
//! mark_modified(child, t)
//!     -> child.last_modified_time = t
//!     -> mark_child_modified(parent, child, t)   (dicts record the key)
//!     -> mark_modified(parent, t)
//!     -> notify child subscribers at t
//! ```
//!
//! `mark_modified` is idempotent within a cycle, so a composite whose children
//! tick one after another notifies its own subscribers once.

use indexmap::IndexSet;

use super::handle::{InputId, OutputId};
use super::store::{InputData, OutputData};
use crate::error::{EngineError, Result};
use crate::graph::NodeRef;
use crate::runtime::Runtime;
use crate::time::{EngineTime, MIN_DT};
use crate::value::{DeltaValue, Scalar};

/// Coarse kind of an output, used to dispatch without holding a borrow.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Value,
    Indexed,
    Dict,
    Set,
    Window,
    Reference,
}

impl Runtime {
    fn output_kind(&self, id: OutputId) -> Result<(Kind, &'static str)> {
        let data = &self.output_cell(id)?.data;
        let kind = match data {
            OutputData::Value(_) => Kind::Value,
            OutputData::Bundle { .. } | OutputData::List(_) => Kind::Indexed,
            OutputData::Dict(_) => Kind::Dict,
            OutputData::Set(_) => Kind::Set,
            OutputData::Window(_) => Kind::Window,
            OutputData::Reference(_) => Kind::Reference,
        };
        Ok((kind, data.kind_name()))
    }

    pub fn output_valid(&self, id: OutputId) -> bool {
        self.outputs
            .get(id)
            .is_some_and(|cell| cell.last_modified_time > MIN_DT)
    }

    pub fn output_modified(&self, id: OutputId) -> bool {
        self.outputs
            .get(id)
            .is_some_and(|cell| cell.last_modified_time == self.evaluation_time())
    }

    pub fn output_last_modified_time(&self, id: OutputId) -> EngineTime {
        self.outputs
            .get(id)
            .map_or(MIN_DT, |cell| cell.last_modified_time)
    }

    /// Valid, and every child (recursively) valid.
    pub fn output_all_valid(&self, id: OutputId) -> bool {
        let Some(cell) = self.outputs.get(id) else {
            return false;
        };
        if cell.last_modified_time <= MIN_DT {
            return false;
        }
        match &cell.data {
            OutputData::Bundle { items, .. } | OutputData::List(items) => {
                items.iter().all(|child| self.output_all_valid(*child))
            }
            OutputData::Dict(state) => state
                .items
                .values()
                .all(|child| self.output_all_valid(*child)),
            OutputData::Window(state) => state.buffer.len() >= state.min_size,
            _ => true,
        }
    }

    /// The node that writes this output.
    pub fn output_owner(&self, id: OutputId) -> Option<NodeRef> {
        self.outputs.get(id).map(|cell| cell.node)
    }

    pub fn output_parent(&self, id: OutputId) -> Option<OutputId> {
        self.outputs.get(id).and_then(|cell| cell.parent)
    }

    pub fn is_reference_output(&self, id: OutputId) -> bool {
        self.outputs
            .get(id)
            .is_some_and(|cell| cell.data.is_reference())
    }

    /// Add one subscription path from `node` to this output.
    pub fn subscribe(&mut self, id: OutputId, node: NodeRef) -> Result<()> {
        self.output_cell_mut(id)?.subscribers.subscribe(node);
        Ok(())
    }

    /// Drop one subscription path. Released outputs are ignored.
    pub fn un_subscribe(&mut self, id: OutputId, node: NodeRef) {
        if let Some(cell) = self.outputs.get_mut(id) {
            cell.subscribers.un_subscribe(node);
        }
    }

    pub fn has_subscriber(&self, id: OutputId, node: NodeRef) -> bool {
        self.outputs
            .get(id)
            .is_some_and(|cell| cell.subscribers.contains(node))
    }

    /// Mark the output as ticked in the current cycle.
    pub fn mark_modified(&mut self, id: OutputId) -> Result<()> {
        let now = self.evaluation_time();
        self.mark_modified_at(id, now)
    }

    /// Mark the output as ticked at `t`; a no-op unless `t` is later than the
    /// last tick.
    pub fn mark_modified_at(&mut self, id: OutputId, t: EngineTime) -> Result<()> {
        let cell = self.output_cell_mut(id)?;
        if t <= cell.last_modified_time {
            return Ok(());
        }
        cell.last_modified_time = t;
        let parent = cell.parent;
        if let Some(parent) = parent {
            self.mark_child_modified(parent, id, t)?;
        }
        self.notify_subscribers(id, t)
    }

    fn mark_child_modified(&mut self, parent: OutputId, child: OutputId, t: EngineTime) -> Result<()> {
        let mut is_element = false;
        if let OutputData::Dict(state) = &mut self.output_cell_mut(parent)?.data {
            if let Some(key) = state.keys_by_id.get(&child) {
                state.modified.insert(key.clone());
                is_element = true;
            }
        }
        if is_element {
            self.schedule_dict_cleanup(parent);
        }
        self.mark_modified_at(parent, t)
    }

    pub(crate) fn notify_subscribers(&mut self, id: OutputId, t: EngineTime) -> Result<()> {
        let subscribers = self.output_cell(id)?.subscribers.to_vec();
        for node in subscribers {
            self.notify_node(node, t)?;
        }
        Ok(())
    }

    /// Invalidate the output and its children, notifying subscribers.
    pub fn mark_invalid(&mut self, id: OutputId) -> Result<()> {
        let cell = self.output_cell(id)?;
        if cell.last_modified_time <= MIN_DT {
            return Ok(());
        }
        let children: Vec<OutputId> = match &cell.data {
            OutputData::Bundle { items, .. } | OutputData::List(items) => items.clone(),
            OutputData::Dict(state) => std::iter::once(state.key_set)
                .chain(state.items.values().copied())
                .collect(),
            _ => Vec::new(),
        };
        for child in children {
            self.mark_invalid(child)?;
        }
        self.output_cell_mut(id)?.last_modified_time = MIN_DT;
        let now = self.evaluation_time();
        self.notify_subscribers(id, now)
    }

    /// Reset the payload, leaving the modification time untouched.
    pub fn clear_output(&mut self, id: OutputId) -> Result<()> {
        let (kind, _) = self.output_kind(id)?;
        match kind {
            Kind::Value => {
                if let OutputData::Value(slot) = &mut self.output_cell_mut(id)?.data {
                    *slot = None;
                }
            }
            Kind::Indexed => {
                for child in self.output_items(id) {
                    self.clear_output(child)?;
                }
            }
            Kind::Dict => self.dict_clear(id)?,
            Kind::Set => self.set_clear(id)?,
            Kind::Window => {
                if let OutputData::Window(state) = &mut self.output_cell_mut(id)?.data {
                    state.buffer.clear();
                    state.removed = None;
                }
            }
            Kind::Reference => self.clear_reference(id)?,
        }
        Ok(())
    }

    /// The scalar payload of a `TS` output, or the newest entry of a window.
    pub fn output_value(&self, id: OutputId) -> Option<Scalar> {
        match &self.outputs.get(id)?.data {
            OutputData::Value(v) => v.clone(),
            OutputData::Window(state) => state.buffer.back().map(|(v, _)| v.clone()),
            _ => None,
        }
    }

    /// Set a scalar output (or push onto a window) and tick it.
    pub fn set_scalar(&mut self, id: OutputId, value: impl Into<Scalar>) -> Result<()> {
        let value = value.into();
        match self.output_kind(id)? {
            (Kind::Value, _) => {
                if let OutputData::Value(slot) = &mut self.output_cell_mut(id)?.data {
                    *slot = Some(value);
                }
                self.mark_modified(id)
            }
            (Kind::Window, _) => self.window_push(id, value),
            (_, kind_name) => Err(EngineError::TypeMismatch {
                expected: kind_name,
                found: "scalar",
            }),
        }
    }

    /// Apply a change set to the output. The output always ticks.
    pub fn apply_result(&mut self, id: OutputId, delta: DeltaValue) -> Result<()> {
        let (kind, kind_name) = self.output_kind(id)?;
        match (kind, delta) {
            (Kind::Value, DeltaValue::Scalar(v)) => return self.set_scalar(id, v),
            (Kind::Window, DeltaValue::Scalar(v)) => return self.window_push(id, v),
            (Kind::Window, DeltaValue::List(items)) => {
                for (_, item) in items {
                    if let DeltaValue::Scalar(v) = item {
                        self.window_push(id, v)?;
                    }
                }
            }
            (Kind::Indexed, DeltaValue::Bundle(items) | DeltaValue::List(items)) => {
                for (ndx, item) in items {
                    let child = self.output_child(id, ndx)?;
                    self.apply_result(child, item)?;
                }
            }
            (Kind::Dict, DeltaValue::Dict { modified, removed }) => {
                for key in removed {
                    self.dict_remove(id, &key)?;
                }
                for (key, item) in modified {
                    let child = self.dict_get_or_create(id, key)?;
                    self.apply_result(child, item)?;
                }
            }
            (Kind::Set, DeltaValue::Set { added, removed }) => {
                for item in removed {
                    self.set_remove(id, &item)?;
                }
                for item in added {
                    self.set_add(id, item)?;
                }
            }
            (Kind::Reference, DeltaValue::Reference(r)) => return self.set_reference(id, r),
            (_, delta) => {
                return Err(EngineError::TypeMismatch {
                    expected: kind_name,
                    found: delta.kind_name(),
                })
            }
        }
        self.mark_modified(id)
    }

    /// What changed in the current cycle, or `None` if the output is invalid.
    pub fn delta_value(&self, id: OutputId) -> Option<DeltaValue> {
        let cell = self.outputs.get(id)?;
        if cell.last_modified_time <= MIN_DT {
            return None;
        }
        Some(match &cell.data {
            OutputData::Value(v) => DeltaValue::Scalar(v.clone()?),
            OutputData::Window(state) => DeltaValue::Scalar(state.buffer.back()?.0.clone()),
            OutputData::Bundle { items, .. } => DeltaValue::Bundle(self.modified_children(items)),
            OutputData::List(items) => DeltaValue::List(self.modified_children(items)),
            OutputData::Dict(state) => DeltaValue::Dict {
                modified: state
                    .modified
                    .iter()
                    .filter_map(|key| {
                        let child = state.items.get(key)?;
                        Some((key.clone(), self.delta_value(*child)?))
                    })
                    .collect(),
                removed: self.set_removed(state.key_set),
            },
            OutputData::Set(state) => DeltaValue::Set {
                added: state.added.iter().cloned().collect(),
                removed: state.removed.iter().cloned().collect(),
            },
            OutputData::Reference(state) => DeltaValue::Reference(state.value.clone()?),
        })
    }

    fn modified_children(&self, items: &[OutputId]) -> Vec<(usize, DeltaValue)> {
        items
            .iter()
            .enumerate()
            .filter(|(_, child)| self.output_modified(**child))
            .filter_map(|(ndx, child)| Some((ndx, self.delta_value(*child)?)))
            .collect()
    }

    /// The full current value expressed as a change set from empty.
    pub fn value_snapshot(&self, id: OutputId) -> Option<DeltaValue> {
        let cell = self.outputs.get(id)?;
        if cell.last_modified_time <= MIN_DT {
            return None;
        }
        let children = |items: &[OutputId]| -> Vec<(usize, DeltaValue)> {
            items
                .iter()
                .enumerate()
                .filter_map(|(ndx, child)| Some((ndx, self.value_snapshot(*child)?)))
                .collect()
        };
        Some(match &cell.data {
            OutputData::Value(v) => DeltaValue::Scalar(v.clone()?),
            OutputData::Window(state) => DeltaValue::List(
                state
                    .buffer
                    .iter()
                    .enumerate()
                    .map(|(ndx, (v, _))| (ndx, DeltaValue::Scalar(v.clone())))
                    .collect(),
            ),
            OutputData::Bundle { items, .. } => DeltaValue::Bundle(children(items)),
            OutputData::List(items) => DeltaValue::List(children(items)),
            OutputData::Dict(state) => DeltaValue::Dict {
                modified: state
                    .items
                    .iter()
                    .filter_map(|(key, child)| Some((key.clone(), self.value_snapshot(*child)?)))
                    .collect(),
                removed: Vec::new(),
            },
            OutputData::Set(state) => DeltaValue::Set {
                added: state.values.iter().cloned().collect(),
                removed: Vec::new(),
            },
            OutputData::Reference(state) => DeltaValue::Reference(state.value.clone()?),
        })
    }

    /// Children of a bundle or list, in position order.
    pub fn output_items(&self, id: OutputId) -> Vec<OutputId> {
        self.outputs
            .get(id)
            .and_then(|cell| cell.data.indexed_items())
            .map(<[OutputId]>::to_vec)
            .unwrap_or_default()
    }

    pub fn output_child(&self, id: OutputId, ndx: usize) -> Result<OutputId> {
        let data = &self.output_cell(id)?.data;
        let items = data.indexed_items().ok_or(EngineError::TypeMismatch {
            expected: "TSB or TSL",
            found: data.kind_name(),
        })?;
        items
            .get(ndx)
            .copied()
            .ok_or_else(|| EngineError::wiring(format!("index {ndx} out of range for {id}")))
    }

    /// A bundle field by name.
    pub fn output_field(&self, id: OutputId, name: &str) -> Result<OutputId> {
        match &self.output_cell(id)?.data {
            OutputData::Bundle { schema, items } => schema
                .index_of(name)
                .and_then(|ndx| items.get(ndx).copied())
                .ok_or_else(|| EngineError::wiring(format!("no field `{name}` on {id}"))),
            other => Err(EngineError::TypeMismatch {
                expected: "TSB",
                found: other.kind_name(),
            }),
        }
    }

    /// Make `dst` hold the same value as `src`, ticking `dst`.
    pub fn copy_from_output(&mut self, dst: OutputId, src: OutputId) -> Result<()> {
        let Some(value) = self.value_snapshot(src) else {
            return Ok(());
        };
        let value = self.with_removals(dst, value)?;
        self.apply_result(dst, value)
    }

    /// Make `dst` hold the value visible through `input`.
    pub fn copy_from_input(&mut self, dst: OutputId, input: InputId) -> Result<()> {
        let cell = self.input_cell(input)?;
        if let Some(src) = cell.output {
            return self.copy_from_output(dst, src);
        }
        let (indexed, dict) = match &cell.data {
            InputData::Bundle { items, .. } | InputData::List(items) => (items.clone(), Vec::new()),
            InputData::Dict(state) => (
                Vec::new(),
                state.items.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            ),
            InputData::Reference(_) => {
                if let Some(r) = self.reference_input_value(input) {
                    self.set_reference(dst, r)?;
                }
                return Ok(());
            }
            InputData::Value | InputData::Set | InputData::Window => return Ok(()),
        };
        for (ndx, child) in indexed.into_iter().enumerate() {
            let dst_child = self.output_child(dst, ndx)?;
            self.copy_from_input(dst_child, child)?;
        }
        if self.output_kind(dst)?.0 == Kind::Dict {
            let keep: IndexSet<Scalar> = dict.iter().map(|(k, _)| k.clone()).collect();
            for key in self.dict_keys(dst) {
                if !keep.contains(&key) {
                    self.dict_remove(dst, &key)?;
                }
            }
            for (key, child) in dict {
                let dst_child = self.dict_get_or_create(dst, key)?;
                self.copy_from_input(dst_child, child)?;
            }
        }
        Ok(())
    }

    /// Extend a snapshot so that applying it also drops what `dst` has extra.
    fn with_removals(&self, dst: OutputId, value: DeltaValue) -> Result<DeltaValue> {
        Ok(match (&self.output_cell(dst)?.data, value) {
            (OutputData::Dict(state), DeltaValue::Dict { modified, .. }) => {
                let keep: IndexSet<&Scalar> = modified.iter().map(|(k, _)| k).collect();
                let removed = state
                    .items
                    .keys()
                    .filter(|k| !keep.contains(k))
                    .cloned()
                    .collect();
                DeltaValue::Dict { modified, removed }
            }
            (OutputData::Set(state), DeltaValue::Set { added, .. }) => {
                let removed = state
                    .values
                    .iter()
                    .filter(|v| !added.contains(v))
                    .cloned()
                    .collect();
                DeltaValue::Set { added, removed }
            }
            (_, value) => value,
        })
    }
}
