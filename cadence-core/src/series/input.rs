//! The input side of the time-series protocol.
//!
//! # Binding
//!
//! An input is either *peered* (bound 1:1 to an output of the same shape) or,
//! for composites, bound element-wise with no single peer. A composite is
//! peered only when every child is peered to the matching child output.
//! Property reads delegate to the peer when there is one and aggregate across
//! children otherwise.
//!
//! Binding a non-reference input to a reference output is special: the input
//! registers itself as an observer of the reference and binds to whatever the
//! reference currently points at, rebinding whenever it changes.
//!
//! # Activity
//!
//! An active input subscribes its node to its peer. Every structural change
//! (bind, unbind) is bracketed by `make_passive` / `make_active` so that the
//! subscription always follows the current peer.
//!
//! # Sampling
//!
//! When a running node's input is rebound to a valid output, the input is
//! *sampled*: `sample_time` is set to the current cycle, which makes the input
//! read as modified even though its new output did not tick.

use super::handle::{InputId, OutputId};
use super::store::InputData;
use crate::error::{EngineError, Result};
use crate::graph::NodeRef;
use crate::runtime::Runtime;
use crate::time::{EngineTime, MIN_DT};
use crate::value::{DeltaValue, Scalar};

impl Runtime {
    /// The peer output, if bound 1:1.
    pub fn input_output(&self, id: InputId) -> Option<OutputId> {
        self.inputs.get(id).and_then(|cell| cell.output)
    }

    pub fn input_has_peer(&self, id: InputId) -> bool {
        self.input_output(id).is_some()
    }

    pub fn input_owner(&self, id: InputId) -> Option<NodeRef> {
        self.inputs.get(id).map(|cell| cell.node)
    }

    pub fn input_active(&self, id: InputId) -> bool {
        self.inputs.get(id).is_some_and(|cell| cell.active)
    }

    /// The reference output this input follows, if any.
    pub fn input_reference_output(&self, id: InputId) -> Option<OutputId> {
        self.inputs.get(id).and_then(|cell| cell.reference_output)
    }

    pub fn input_bound(&self, id: InputId) -> bool {
        let Some(cell) = self.inputs.get(id) else {
            return false;
        };
        if cell.output.is_some() {
            return true;
        }
        match &cell.data {
            InputData::Reference(state) => {
                state.value.is_some() || state.items.iter().any(|i| self.input_bound(*i))
            }
            InputData::Bundle { items, .. } | InputData::List(items) => {
                items.iter().any(|i| self.input_bound(*i))
            }
            InputData::Dict(state) => state.observed.is_some(),
            InputData::Value | InputData::Set | InputData::Window => false,
        }
    }

    /// True when the binding changed in the current cycle.
    pub fn input_sampled(&self, id: InputId) -> bool {
        self.inputs
            .get(id)
            .is_some_and(|cell| cell.sample_time == self.evaluation_time())
    }

    pub fn input_valid(&self, id: InputId) -> bool {
        let Some(cell) = self.inputs.get(id) else {
            return false;
        };
        if let Some(output) = cell.output {
            return self.output_valid(output);
        }
        match &cell.data {
            InputData::Reference(state) => {
                state.value.is_some() || state.items.iter().any(|i| self.input_valid(*i))
            }
            InputData::Bundle { items, .. } | InputData::List(items) => {
                items.iter().any(|i| self.input_valid(*i))
            }
            InputData::Dict(state) => state.observed.is_some() && self.input_valid(state.key_set),
            InputData::Value | InputData::Set | InputData::Window => false,
        }
    }

    pub fn input_modified(&self, id: InputId) -> bool {
        let Some(cell) = self.inputs.get(id) else {
            return false;
        };
        if cell.sample_time == self.evaluation_time() {
            return true;
        }
        if let Some(output) = cell.output {
            return self.output_modified(output);
        }
        match &cell.data {
            InputData::Reference(state) => state.items.iter().any(|i| self.input_modified(*i)),
            InputData::Bundle { items, .. } | InputData::List(items) => {
                items.iter().any(|i| self.input_modified(*i))
            }
            InputData::Dict(state) => {
                self.input_modified(state.key_set)
                    || state.items.values().any(|i| self.input_modified(*i))
            }
            InputData::Value | InputData::Set | InputData::Window => false,
        }
    }

    pub fn input_all_valid(&self, id: InputId) -> bool {
        let Some(cell) = self.inputs.get(id) else {
            return false;
        };
        if let Some(output) = cell.output {
            return self.output_all_valid(output);
        }
        match &cell.data {
            InputData::Reference(_) => self.input_valid(id),
            InputData::Bundle { items, .. } | InputData::List(items) => {
                items.iter().all(|i| self.input_all_valid(*i))
            }
            InputData::Dict(state) => {
                self.input_valid(id) && state.items.values().all(|i| self.input_all_valid(*i))
            }
            InputData::Value | InputData::Set | InputData::Window => false,
        }
    }

    /// `max(peer.last_modified_time, sample_time)`, or the latest child time
    /// when unpeered.
    pub fn input_last_modified_time(&self, id: InputId) -> EngineTime {
        let Some(cell) = self.inputs.get(id) else {
            return MIN_DT;
        };
        let bound = match (cell.output, &cell.data) {
            (Some(output), _) => self.output_last_modified_time(output),
            (None, InputData::Bundle { items, .. } | InputData::List(items)) => items
                .iter()
                .map(|i| self.input_last_modified_time(*i))
                .max()
                .unwrap_or(MIN_DT),
            (None, InputData::Dict(state)) => state
                .items
                .values()
                .map(|i| self.input_last_modified_time(*i))
                .chain(std::iter::once(self.input_last_modified_time(state.key_set)))
                .max()
                .unwrap_or(MIN_DT),
            (None, InputData::Reference(state)) => state
                .items
                .iter()
                .map(|i| self.input_last_modified_time(*i))
                .max()
                .unwrap_or(MIN_DT),
            (None, _) => MIN_DT,
        };
        bound.max(cell.sample_time)
    }

    /// The scalar visible through a `TS` (or window) input.
    pub fn input_value(&self, id: InputId) -> Option<Scalar> {
        self.output_value(self.input_output(id)?)
    }

    pub fn input_delta_value(&self, id: InputId) -> Option<DeltaValue> {
        let cell = self.inputs.get(id)?;
        if let Some(output) = cell.output {
            return self.delta_value(output);
        }
        let modified_children = |items: &[InputId]| -> Vec<(usize, DeltaValue)> {
            items
                .iter()
                .enumerate()
                .filter(|(_, i)| self.input_modified(**i))
                .filter_map(|(ndx, i)| Some((ndx, self.input_delta_value(*i)?)))
                .collect()
        };
        match &cell.data {
            InputData::Reference(_) => self.reference_input_value(id).map(DeltaValue::Reference),
            InputData::Bundle { items, .. } => Some(DeltaValue::Bundle(modified_children(items))),
            InputData::List(items) => Some(DeltaValue::List(modified_children(items))),
            InputData::Dict(state) => Some(DeltaValue::Dict {
                modified: state
                    .items
                    .iter()
                    .filter(|(_, i)| self.input_modified(**i))
                    .filter_map(|(k, i)| Some((k.clone(), self.input_delta_value(*i)?)))
                    .collect(),
                removed: self.dict_input_removed_keys(id),
            }),
            InputData::Value | InputData::Set | InputData::Window => None,
        }
    }

    /// Children of a bundle or list input, in position order.
    pub fn input_items(&self, id: InputId) -> Vec<InputId> {
        match self.inputs.get(id).map(|cell| &cell.data) {
            Some(InputData::Bundle { items, .. } | InputData::List(items)) => items.clone(),
            Some(InputData::Reference(state)) => state.items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn input_child(&self, id: InputId, ndx: usize) -> Result<InputId> {
        let data = &self.input_cell(id)?.data;
        let items = match data {
            InputData::Bundle { items, .. } | InputData::List(items) => items,
            InputData::Reference(state) => &state.items,
            other => {
                return Err(EngineError::TypeMismatch {
                    expected: "TSB or TSL",
                    found: other.kind_name(),
                })
            }
        };
        items
            .get(ndx)
            .copied()
            .ok_or_else(|| EngineError::wiring(format!("index {ndx} out of range for {id}")))
    }

    /// A bundle field by name.
    pub fn input_field(&self, id: InputId, name: &str) -> Result<InputId> {
        match &self.input_cell(id)?.data {
            InputData::Bundle { schema, items } => schema
                .index_of(name)
                .and_then(|ndx| items.get(ndx).copied())
                .ok_or_else(|| EngineError::wiring(format!("no input named `{name}`"))),
            other => Err(EngineError::TypeMismatch {
                expected: "TSB",
                found: other.kind_name(),
            }),
        }
    }

    /// Bind the input to an output. Returns whether the input is now peered.
    pub fn bind_output(&mut self, input: InputId, output: OutputId) -> Result<bool> {
        let output_is_ref = self.output_cell(output)?.data.is_reference();
        let input_is_ref = self.input_cell(input)?.data.is_reference();

        if output_is_ref && !input_is_ref {
            let previous = self.input_cell_mut(input)?.reference_output.replace(output);
            if let Some(previous) = previous.filter(|p| *p != output) {
                self.stop_observing_reference(previous, input);
            }
            self.observe_reference(output, input)?;
            if let Some(reference) = self.reference_output_value(output) {
                self.bind_reference_input(&reference, input)?;
            }
            return Ok(false);
        }

        let active = self.input_cell(input)?.active;
        self.make_passive(input)?;
        let peer = self.do_bind_output(input, output)?;
        if active {
            self.make_active(input)?;
        }
        if input_is_ref || self.output_valid(output) {
            self.sample_input(input, active)?;
        }
        Ok(peer)
    }

    fn do_bind_output(&mut self, input: InputId, output: OutputId) -> Result<bool> {
        let output_kind = self.output_cell(output)?.data.kind_name();
        let cell = self.input_cell_mut(input)?;
        match &mut cell.data {
            InputData::Value | InputData::Set | InputData::Window => {
                if cell.data.kind_name() != output_kind {
                    return Err(EngineError::TypeMismatch {
                        expected: cell.data.kind_name(),
                        found: output_kind,
                    });
                }
                cell.output = Some(output);
                Ok(true)
            }
            InputData::Reference(state) => {
                if output_kind == "REF" {
                    state.value = None;
                    cell.output = Some(output);
                    Ok(true)
                } else {
                    state.value = Some(output.into());
                    cell.output = None;
                    Ok(false)
                }
            }
            InputData::Bundle { items, .. } | InputData::List(items) => {
                let inputs = items.clone();
                let outputs = self.output_items(output);
                if inputs.len() != outputs.len() {
                    return Err(EngineError::wiring(format!(
                        "cannot bind {} elements to {} ({output_kind})",
                        inputs.len(),
                        outputs.len()
                    )));
                }
                let mut peer = true;
                for (child_in, child_out) in inputs.into_iter().zip(outputs) {
                    peer &= self.bind_output(child_in, child_out)?;
                }
                self.input_cell_mut(input)?.output = peer.then_some(output);
                Ok(peer)
            }
            InputData::Dict(_) => self.bind_dict_input(input, output),
        }
    }

    /// Detach the input from its output(s).
    ///
    /// With `unbind_refs` the input also stops following a reference output.
    pub fn un_bind_output(&mut self, input: InputId, unbind_refs: bool) -> Result<()> {
        let was_valid = self.input_valid(input);
        if unbind_refs {
            if let Some(reference) = self.input_cell_mut(input)?.reference_output.take() {
                self.stop_observing_reference(reference, input);
            }
        }
        if !self.input_bound(input) {
            return Ok(());
        }
        let active = self.input_cell(input)?.active;
        self.make_passive(input)?;
        self.do_un_bind_output(input, unbind_refs)?;
        if active {
            self.make_active(input)?;
        }
        if was_valid {
            self.sample_input(input, active)?;
        }
        Ok(())
    }

    fn do_un_bind_output(&mut self, input: InputId, unbind_refs: bool) -> Result<()> {
        let cell = self.input_cell_mut(input)?;
        cell.output = None;
        let children = match &mut cell.data {
            InputData::Reference(state) => {
                state.value = None;
                state.items.clone()
            }
            InputData::Bundle { items, .. } | InputData::List(items) => items.clone(),
            InputData::Dict(_) => return self.un_bind_dict_input(input),
            InputData::Value | InputData::Set | InputData::Window => Vec::new(),
        };
        for child in children {
            self.un_bind_output(child, unbind_refs)?;
        }
        Ok(())
    }

    /// Subscribe the owning node to changes of this input.
    pub fn make_active(&mut self, input: InputId) -> Result<()> {
        let cell = self.input_cell_mut(input)?;
        if cell.active {
            return Ok(());
        }
        cell.active = true;
        let node = cell.node;
        let output = cell.output;
        match output {
            Some(output) => {
                if self.output_exists(output) {
                    self.subscribe(output, node)?;
                    if self.output_modified(output) {
                        let t = self.output_last_modified_time(output);
                        self.notify_node(node, t)?;
                    }
                }
            }
            None => {
                for child in self.input_cell(input)?.data.children() {
                    self.make_active(child)?;
                }
            }
        }
        if self.input_sampled(input) {
            let now = self.evaluation_time();
            self.notify_node(node, now)?;
        }
        Ok(())
    }

    /// Stop the owning node from being notified by this input.
    pub fn make_passive(&mut self, input: InputId) -> Result<()> {
        let cell = self.input_cell_mut(input)?;
        if !cell.active {
            return Ok(());
        }
        cell.active = false;
        let node = cell.node;
        let output = cell.output;
        match output {
            Some(output) => self.un_subscribe(output, node),
            None => {
                for child in self.input_cell(input)?.data.children() {
                    self.make_passive(child)?;
                }
            }
        }
        Ok(())
    }

    /// Record that the binding changed in this cycle, or defer it to start.
    pub(crate) fn sample_input(&mut self, input: InputId, notify: bool) -> Result<()> {
        let node = self.input_cell(input)?.node;
        if self.node_is_running(node) {
            let now = self.evaluation_time();
            self.input_cell_mut(input)?.sample_time = now;
            if notify {
                self.notify_node(node, now)?;
            }
        } else {
            self.input_cell_mut(input)?.sample_on_start = true;
        }
        Ok(())
    }

    /// Turn deferred samples into samples at the current time.
    ///
    /// Returns whether anything in the tree was sampled.
    pub(crate) fn apply_start_samples(&mut self, input: InputId) -> Result<bool> {
        let now = self.evaluation_time();
        let cell = self.input_cell_mut(input)?;
        let mut sampled = std::mem::take(&mut cell.sample_on_start);
        if sampled {
            cell.sample_time = now;
        }
        for child in cell.data.children() {
            sampled |= self.apply_start_samples(child)?;
        }
        Ok(sampled)
    }
}
