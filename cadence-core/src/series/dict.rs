//! Dynamic-key containers (`TSD`).
//!
//! A dict output owns one element per key plus a key set (`TSS`) that records
//! which keys were added or removed this cycle. Removed elements stay readable
//! until the after-evaluation cleanup of the cycle they were removed in.
//!
//! Dict inputs bound to a dict output register themselves as key observers:
//! every key added to the output creates a child input bound to the new
//! element, and every key removed releases the matching child input.

use super::handle::{InputId, OutputId};
use super::store::{InputData, OutputData};
use super::TsType;
use crate::error::{EngineError, Result};
use crate::runtime::Runtime;
use crate::value::Scalar;

impl Runtime {
    fn dict_state(&self, id: OutputId) -> Result<&super::store::DictOutputState> {
        match &self.output_cell(id)?.data {
            OutputData::Dict(state) => Ok(state),
            other => Err(EngineError::TypeMismatch {
                expected: "TSD",
                found: other.kind_name(),
            }),
        }
    }

    fn dict_state_mut(&mut self, id: OutputId) -> Result<&mut super::store::DictOutputState> {
        match &mut self.output_cell_mut(id)?.data {
            OutputData::Dict(state) => Ok(state),
            other => Err(EngineError::TypeMismatch {
                expected: "TSD",
                found: other.kind_name(),
            }),
        }
    }

    /// The element for `key`, created (and the key added) if missing.
    pub fn dict_get_or_create(&mut self, id: OutputId, key: Scalar) -> Result<OutputId> {
        if let Some(existing) = self.dict_state(id)?.items.get(&key) {
            return Ok(*existing);
        }
        let node = self.output_cell(id)?.node;
        let element = self.dict_state(id)?.element.clone();
        let child = self.create_output(node, Some(id), &element)?;

        let state = self.dict_state_mut(id)?;
        if let Some(previous) = state.removed.shift_remove(&key) {
            state.graveyard.push(previous);
        }
        state.items.insert(key.clone(), child);
        state.keys_by_id.insert(child, key.clone());
        let key_set = state.key_set;
        let observers: Vec<InputId> = state.key_observers.iter().copied().collect();

        self.set_add(key_set, key.clone())?;
        for observer in observers {
            if self.input_exists(observer) {
                self.dict_input_add_key(observer, key.clone(), child)?;
            }
        }
        self.schedule_dict_cleanup(id);
        Ok(child)
    }

    /// Remove `key`. The element stays readable until the end of the cycle,
    /// unless it was created in this same cycle.
    pub fn dict_remove(&mut self, id: OutputId, key: &Scalar) -> Result<()> {
        let state = self.dict_state_mut(id)?;
        let Some(child) = state.items.shift_remove(key) else {
            return Ok(());
        };
        state.keys_by_id.remove(&child);
        state.modified.shift_remove(key);
        let key_set = state.key_set;
        let observers: Vec<InputId> = state.key_observers.iter().copied().collect();

        let created_this_cycle = self.set_was_added(key_set, key) && !self.set_was_readded(key_set, key);
        let state = self.dict_state_mut(id)?;
        if created_this_cycle {
            state.graveyard.push(child);
        } else {
            state.removed.insert(key.clone(), child);
        }

        self.set_remove(key_set, key)?;
        for observer in observers {
            if self.input_exists(observer) {
                self.dict_input_remove_key(observer, key)?;
            }
        }
        self.schedule_dict_cleanup(id);
        self.mark_modified(id)
    }

    /// Remove every key.
    pub fn dict_clear(&mut self, id: OutputId) -> Result<()> {
        for key in self.dict_keys(id) {
            self.dict_remove(id, &key)?;
        }
        Ok(())
    }

    pub fn dict_keys(&self, id: OutputId) -> Vec<Scalar> {
        self.dict_state(id)
            .map(|state| state.items.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dict_get(&self, id: OutputId, key: &Scalar) -> Option<OutputId> {
        self.dict_state(id).ok()?.items.get(key).copied()
    }

    pub fn dict_contains(&self, id: OutputId, key: &Scalar) -> bool {
        self.dict_get(id, key).is_some()
    }

    pub fn dict_len(&self, id: OutputId) -> usize {
        self.dict_state(id).map_or(0, |state| state.items.len())
    }

    pub fn dict_items(&self, id: OutputId) -> Vec<(Scalar, OutputId)> {
        self.dict_state(id)
            .map(|state| state.items.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }

    /// The `TSS` of keys.
    pub fn dict_key_set(&self, id: OutputId) -> Result<OutputId> {
        Ok(self.dict_state(id)?.key_set)
    }

    /// Keys whose element ticked this cycle.
    pub fn dict_modified_keys(&self, id: OutputId) -> Vec<Scalar> {
        self.dict_state(id)
            .map(|state| state.modified.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dict_added_keys(&self, id: OutputId) -> Vec<Scalar> {
        self.dict_state(id)
            .map(|state| self.set_added(state.key_set))
            .unwrap_or_default()
    }

    pub fn dict_removed_keys(&self, id: OutputId) -> Vec<Scalar> {
        self.dict_state(id)
            .map(|state| self.set_removed(state.key_set))
            .unwrap_or_default()
    }

    /// An element removed this cycle, still readable until cleanup.
    pub fn dict_removed_item(&self, id: OutputId, key: &Scalar) -> Option<OutputId> {
        self.dict_state(id).ok()?.removed.get(key).copied()
    }

    /// Register the end-of-cycle cleanup for this dict, once per cycle.
    pub(crate) fn schedule_dict_cleanup(&mut self, id: OutputId) {
        let Ok(state) = self.dict_state_mut(id) else {
            return;
        };
        if state.cleanup_scheduled {
            return;
        }
        state.cleanup_scheduled = true;
        self.add_after_evaluation_notification(move |rt| rt.end_dict_cycle(id));
    }

    fn end_dict_cycle(&mut self, id: OutputId) -> Result<()> {
        let Ok(state) = self.dict_state_mut(id) else {
            return Ok(());
        };
        state.cleanup_scheduled = false;
        state.modified.clear();
        let released: Vec<OutputId> = state
            .removed
            .drain(..)
            .map(|(_, child)| child)
            .chain(state.graveyard.drain(..))
            .collect();
        for child in released {
            self.release_output(child);
        }
        Ok(())
    }

    // Inputs

    fn dict_input_state(&self, id: InputId) -> Result<&super::store::DictInputState> {
        match &self.input_cell(id)?.data {
            InputData::Dict(state) => Ok(state),
            other => Err(EngineError::TypeMismatch {
                expected: "TSD",
                found: other.kind_name(),
            }),
        }
    }

    fn dict_input_state_mut(&mut self, id: InputId) -> Result<&mut super::store::DictInputState> {
        match &mut self.input_cell_mut(id)?.data {
            InputData::Dict(state) => Ok(state),
            other => Err(EngineError::TypeMismatch {
                expected: "TSD",
                found: other.kind_name(),
            }),
        }
    }

    /// Follow the keys of a dict output. The input is peered unless the
    /// output holds references that the input dereferences per key.
    pub(crate) fn bind_dict_input(&mut self, input: InputId, output: OutputId) -> Result<bool> {
        let (output_key_set, output_element) = {
            let state = self.dict_state(output)?;
            (state.key_set, state.element.clone())
        };
        let previous = self.dict_input_state(input)?.observed;
        if previous.is_some_and(|p| p != output) {
            self.un_bind_dict_input(input)?;
        }

        let (key_set, element) = {
            let state = self.dict_input_state(input)?;
            (state.key_set, state.element.clone())
        };
        self.bind_output(key_set, output_key_set)?;
        self.dict_input_state_mut(input)?.observed = Some(output);
        self.dict_state_mut(output)?.key_observers.insert(input);

        for (key, child) in self.dict_items(output) {
            self.dict_input_add_key(input, key, child)?;
        }

        let peer = !(output_element.is_reference() && !element.is_reference());
        self.input_cell_mut(input)?.output = peer.then_some(output);
        Ok(peer)
    }

    pub(crate) fn un_bind_dict_input(&mut self, input: InputId) -> Result<()> {
        let state = self.dict_input_state_mut(input)?;
        let Some(output) = state.observed.take() else {
            return Ok(());
        };
        let key_set = state.key_set;
        let children: Vec<InputId> = state.items.drain(..).map(|(_, child)| child).collect();
        if let Ok(state) = self.dict_state_mut(output) {
            state.key_observers.shift_remove(&input);
        }
        self.un_bind_output(key_set, false)?;
        for child in children {
            self.release_input(child)?;
        }
        Ok(())
    }

    fn dict_input_add_key(&mut self, input: InputId, key: Scalar, output: OutputId) -> Result<()> {
        if self.dict_input_state(input)?.items.contains_key(&key) {
            return Ok(());
        }
        let cell = self.input_cell(input)?;
        let node = cell.node;
        let expand_activity = cell.active && cell.output.is_none();
        let element: TsType = self.dict_input_state(input)?.element.clone();
        let child = self.create_input(node, Some(input), &element)?;
        self.dict_input_state_mut(input)?.items.insert(key, child);
        self.bind_output(child, output)?;
        if expand_activity {
            self.make_active(child)?;
        }
        Ok(())
    }

    fn dict_input_remove_key(&mut self, input: InputId, key: &Scalar) -> Result<()> {
        let Some(child) = self.dict_input_state_mut(input)?.items.shift_remove(key) else {
            return Ok(());
        };
        self.release_input(child)
    }

    pub fn dict_input_keys(&self, input: InputId) -> Vec<Scalar> {
        self.dict_input_state(input)
            .map(|state| state.items.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dict_input_get(&self, input: InputId, key: &Scalar) -> Option<InputId> {
        self.dict_input_state(input).ok()?.items.get(key).copied()
    }

    pub fn dict_input_items(&self, input: InputId) -> Vec<(Scalar, InputId)> {
        self.dict_input_state(input)
            .map(|state| state.items.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }

    /// Keys whose element input reads as modified.
    pub fn dict_input_modified_items(&self, input: InputId) -> Vec<(Scalar, InputId)> {
        self.dict_input_items(input)
            .into_iter()
            .filter(|(_, child)| self.input_modified(*child))
            .collect()
    }

    pub fn dict_input_key_set(&self, input: InputId) -> Result<InputId> {
        Ok(self.dict_input_state(input)?.key_set)
    }

    pub fn dict_input_added_keys(&self, input: InputId) -> Vec<Scalar> {
        match self.dict_input_state(input).ok().and_then(|s| s.observed) {
            Some(output) if !self.input_sampled(input) => self.dict_added_keys(output),
            Some(_) => self.dict_input_keys(input),
            None => Vec::new(),
        }
    }

    pub fn dict_input_removed_keys(&self, input: InputId) -> Vec<Scalar> {
        self.dict_input_state(input)
            .ok()
            .and_then(|state| state.observed)
            .map(|output| self.dict_removed_keys(output))
            .unwrap_or_default()
    }
}
