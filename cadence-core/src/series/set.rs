//! Set containers (`TSS`).
//!
//! Within a cycle `added` and `removed` are disjoint. Adding an item that was
//! removed earlier in the cycle reports it as added only; removing an item
//! that was added in the same cycle cancels the add.

use super::handle::{InputId, OutputId};
use super::store::{FeatureOutput, OutputData, SetOutputState};
use super::TsType;
use crate::error::{EngineError, Result};
use crate::runtime::Runtime;
use crate::value::Scalar;

impl Runtime {
    fn set_state(&self, id: OutputId) -> Option<&SetOutputState> {
        match &self.outputs.get(id)?.data {
            OutputData::Set(state) => Some(state),
            _ => None,
        }
    }

    fn set_state_mut(&mut self, id: OutputId) -> Result<&mut SetOutputState> {
        match &mut self.output_cell_mut(id)?.data {
            OutputData::Set(state) => Ok(state),
            other => Err(EngineError::TypeMismatch {
                expected: "TSS",
                found: other.kind_name(),
            }),
        }
    }

    /// Add an item. Adding a present item is a no-op.
    pub fn set_add(&mut self, id: OutputId, item: Scalar) -> Result<()> {
        let state = self.set_state_mut(id)?;
        if !state.values.insert(item.clone()) {
            return Ok(());
        }
        if state.removed.shift_remove(&item) {
            state.readded.insert(item.clone());
        }
        state.added.insert(item.clone());
        self.after_set_change(id, &item, true)
    }

    /// Remove an item. Removing an absent item is a no-op.
    pub fn set_remove(&mut self, id: OutputId, item: &Scalar) -> Result<()> {
        let state = self.set_state_mut(id)?;
        if !state.values.shift_remove(item) {
            return Ok(());
        }
        if state.added.shift_remove(item) {
            if state.readded.shift_remove(item) {
                state.removed.insert(item.clone());
            }
        } else {
            state.removed.insert(item.clone());
        }
        self.after_set_change(id, item, false)
    }

    pub fn set_clear(&mut self, id: OutputId) -> Result<()> {
        for item in self.set_values(id) {
            self.set_remove(id, &item)?;
        }
        Ok(())
    }

    fn after_set_change(&mut self, id: OutputId, item: &Scalar, present: bool) -> Result<()> {
        let state = self.set_state_mut(id)?;
        let schedule = !state.cleanup_scheduled;
        state.cleanup_scheduled = true;
        let is_empty = state.values.is_empty();
        let is_empty_output = state.is_empty.as_ref().map(|f| f.output);
        let contains_output = state.contains.get(item).map(|f| f.output);
        if schedule {
            self.add_after_evaluation_notification(move |rt| rt.end_set_cycle(id));
        }
        if let Some(feature) = is_empty_output {
            if self.output_value(feature) != Some(Scalar::Bool(is_empty)) {
                self.set_scalar(feature, is_empty)?;
            }
        }
        if let Some(feature) = contains_output {
            self.set_scalar(feature, present)?;
        }
        self.mark_modified(id)
    }

    fn end_set_cycle(&mut self, id: OutputId) -> Result<()> {
        if let Ok(state) = self.set_state_mut(id) {
            state.added.clear();
            state.removed.clear();
            state.readded.clear();
            state.cleanup_scheduled = false;
        }
        Ok(())
    }

    pub fn set_values(&self, id: OutputId) -> Vec<Scalar> {
        self.set_state(id)
            .map(|state| state.values.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_contains(&self, id: OutputId, item: &Scalar) -> bool {
        self.set_state(id).is_some_and(|state| state.values.contains(item))
    }

    pub fn set_len(&self, id: OutputId) -> usize {
        self.set_state(id).map_or(0, |state| state.values.len())
    }

    /// Items added this cycle.
    pub fn set_added(&self, id: OutputId) -> Vec<Scalar> {
        self.set_state(id)
            .map(|state| state.added.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Items removed this cycle.
    pub fn set_removed(&self, id: OutputId) -> Vec<Scalar> {
        self.set_state(id)
            .map(|state| state.removed.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn set_was_added(&self, id: OutputId, item: &Scalar) -> bool {
        self.set_state(id).is_some_and(|state| state.added.contains(item))
    }

    pub(crate) fn set_was_readded(&self, id: OutputId, item: &Scalar) -> bool {
        self.set_state(id).is_some_and(|state| state.readded.contains(item))
    }

    /// A `TS[bool]` tracking whether the set is empty. Each call adds a
    /// requester; pair it with [`Runtime::release_is_empty_output`].
    pub fn is_empty_output(&mut self, id: OutputId) -> Result<OutputId> {
        if let Some(feature) = self.set_state_mut(id)?.is_empty.as_mut() {
            feature.requesters += 1;
            return Ok(feature.output);
        }
        let node = self.output_cell(id)?.node;
        let output = self.create_output(node, None, &TsType::Value)?;
        let empty = self.set_len(id) == 0;
        self.set_scalar(output, empty)?;
        self.set_state_mut(id)?.is_empty = Some(FeatureOutput {
            output,
            requesters: 1,
        });
        Ok(output)
    }

    pub fn release_is_empty_output(&mut self, id: OutputId) -> Result<()> {
        let state = self.set_state_mut(id)?;
        let Some(feature) = state.is_empty.as_mut() else {
            return Ok(());
        };
        feature.requesters = feature.requesters.saturating_sub(1);
        if feature.requesters == 0 {
            let output = feature.output;
            state.is_empty = None;
            self.release_output(output);
        }
        Ok(())
    }

    /// A `TS[bool]` tracking whether `item` is in the set.
    pub fn contains_output(&mut self, id: OutputId, item: Scalar) -> Result<OutputId> {
        if let Some(feature) = self.set_state_mut(id)?.contains.get_mut(&item) {
            feature.requesters += 1;
            return Ok(feature.output);
        }
        let node = self.output_cell(id)?.node;
        let output = self.create_output(node, None, &TsType::Value)?;
        let present = self.set_contains(id, &item);
        self.set_scalar(output, present)?;
        self.set_state_mut(id)?.contains.insert(
            item,
            FeatureOutput {
                output,
                requesters: 1,
            },
        );
        Ok(output)
    }

    pub fn release_contains_output(&mut self, id: OutputId, item: &Scalar) -> Result<()> {
        let state = self.set_state_mut(id)?;
        let Some(feature) = state.contains.get_mut(item) else {
            return Ok(());
        };
        feature.requesters = feature.requesters.saturating_sub(1);
        if feature.requesters == 0 {
            let output = feature.output;
            state.contains.shift_remove(item);
            self.release_output(output);
        }
        Ok(())
    }

    // Inputs

    pub fn input_set_values(&self, input: InputId) -> Vec<Scalar> {
        self.input_output(input)
            .map(|output| self.set_values(output))
            .unwrap_or_default()
    }

    /// Items added this cycle. A freshly sampled input reports its whole value.
    pub fn input_set_added(&self, input: InputId) -> Vec<Scalar> {
        match self.input_output(input) {
            Some(output) if self.input_sampled(input) => self.set_values(output),
            Some(output) => self.set_added(output),
            None => Vec::new(),
        }
    }

    pub fn input_set_removed(&self, input: InputId) -> Vec<Scalar> {
        match self.input_output(input) {
            Some(output) if !self.input_sampled(input) => self.set_removed(output),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::Runtime;
    use crate::series::TsType;
    use crate::time::EngineTime;
    use crate::value::Scalar;

    fn set_output(rt: &mut Runtime) -> crate::series::OutputId {
        rt.test_output(&TsType::Set)
    }

    #[test]
    fn remove_then_add_reports_added_only() {
        let mut rt = Runtime::for_tests(EngineTime::from_secs(1));
        let set = set_output(&mut rt);
        rt.set_add(set, Scalar::from("a")).unwrap();
        rt.run_after_evaluation().unwrap();

        rt.set_test_time(EngineTime::from_secs(2));
        rt.set_remove(set, &Scalar::from("a")).unwrap();
        assert_eq!(rt.set_removed(set), vec![Scalar::from("a")]);
        rt.set_add(set, Scalar::from("a")).unwrap();

        assert_eq!(rt.set_added(set), vec![Scalar::from("a")]);
        assert!(rt.set_removed(set).is_empty());

        // A second removal reports the original item as removed.
        rt.set_remove(set, &Scalar::from("a")).unwrap();
        assert!(rt.set_added(set).is_empty());
        assert_eq!(rt.set_removed(set), vec![Scalar::from("a")]);
    }

    #[test]
    fn add_then_remove_cancels() {
        let mut rt = Runtime::for_tests(EngineTime::from_secs(1));
        let set = set_output(&mut rt);
        rt.set_add(set, Scalar::from(1)).unwrap();
        rt.set_remove(set, &Scalar::from(1)).unwrap();
        assert!(rt.set_added(set).is_empty());
        assert!(rt.set_removed(set).is_empty());
        assert!(rt.output_modified(set));
    }

    #[test]
    fn deltas_clear_after_the_cycle() {
        let mut rt = Runtime::for_tests(EngineTime::from_secs(1));
        let set = set_output(&mut rt);
        rt.set_add(set, Scalar::from(1)).unwrap();
        rt.run_after_evaluation().unwrap();
        assert!(rt.set_added(set).is_empty());
        assert_eq!(rt.set_values(set), vec![Scalar::from(1)]);
    }

    #[test]
    fn feature_outputs_follow_the_set() {
        let mut rt = Runtime::for_tests(EngineTime::from_secs(1));
        let set = set_output(&mut rt);
        let empty = rt.is_empty_output(set).unwrap();
        let again = rt.is_empty_output(set).unwrap();
        assert_eq!(empty, again);
        let has_x = rt.contains_output(set, Scalar::from("x")).unwrap();
        assert_eq!(rt.output_value(empty), Some(Scalar::Bool(true)));
        assert_eq!(rt.output_value(has_x), Some(Scalar::Bool(false)));

        rt.set_add(set, Scalar::from("x")).unwrap();
        assert_eq!(rt.output_value(empty), Some(Scalar::Bool(false)));
        assert_eq!(rt.output_value(has_x), Some(Scalar::Bool(true)));

        rt.release_is_empty_output(set).unwrap();
        assert!(rt.output_exists(empty));
        rt.release_is_empty_output(set).unwrap();
        assert!(!rt.output_exists(empty));
        rt.release_contains_output(set, &Scalar::from("x")).unwrap();
        assert!(!rt.output_exists(has_x));
    }
}
