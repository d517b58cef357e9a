//! Reference-typed outputs and inputs.
//!
//! A reference output publishes a [`TimeSeriesReference`]. Two kinds of
//! input consume it:
//!
//! - a reference input bound to it is an ordinary peer and reads the value;
//! - a non-reference input bound to it becomes an *observer* and is rebound
//!   to the referenced output every time the value changes.
//!
//! A reference input bound to a non-reference output has no peer; it reads a
//! synthesised `Bound` value pointing at that output.

use super::handle::{InputId, OutputId};
use super::store::{InputData, OutputData};
use crate::error::{EngineError, Result};
use crate::runtime::Runtime;
use crate::value::TimeSeriesReference;

impl Runtime {
    /// The value currently published by a reference output.
    pub fn reference_output_value(&self, id: OutputId) -> Option<TimeSeriesReference> {
        match &self.outputs.get(id)?.data {
            OutputData::Reference(state) => state.value.clone(),
            _ => None,
        }
    }

    /// Publish a new reference and rebind every observer to it.
    pub fn set_reference(&mut self, id: OutputId, value: TimeSeriesReference) -> Result<()> {
        let OutputData::Reference(state) = &mut self.output_cell_mut(id)?.data else {
            return Err(EngineError::TypeMismatch {
                expected: "REF",
                found: "reference value",
            });
        };
        let changed = state.value.as_ref() != Some(&value);
        state.value = Some(value.clone());
        let observers: Vec<InputId> = state.observers.iter().copied().collect();
        self.mark_modified(id)?;
        if changed {
            for observer in observers {
                if self.input_exists(observer) {
                    self.bind_reference_input(&value, observer)?;
                }
            }
        }
        Ok(())
    }

    /// Drop the published value, unbinding observers.
    pub(crate) fn clear_reference(&mut self, id: OutputId) -> Result<()> {
        let OutputData::Reference(state) = &mut self.output_cell_mut(id)?.data else {
            return Ok(());
        };
        state.value = None;
        let observers: Vec<InputId> = state.observers.iter().copied().collect();
        for observer in observers {
            if self.input_exists(observer) {
                self.un_bind_output(observer, false)?;
            }
        }
        Ok(())
    }

    pub(crate) fn observe_reference(&mut self, id: OutputId, input: InputId) -> Result<()> {
        if let OutputData::Reference(state) = &mut self.output_cell_mut(id)?.data {
            state.observers.insert(input);
        }
        Ok(())
    }

    pub(crate) fn stop_observing_reference(&mut self, id: OutputId, input: InputId) {
        if let Some(OutputData::Reference(state)) = self.outputs.get_mut(id).map(|c| &mut c.data) {
            state.observers.shift_remove(&input);
        }
    }

    /// Number of inputs following this reference output.
    pub fn reference_observer_count(&self, id: OutputId) -> usize {
        match self.outputs.get(id).map(|c| &c.data) {
            Some(OutputData::Reference(state)) => state.observers.len(),
            _ => 0,
        }
    }

    /// Bind `input` to whatever `reference` points at.
    pub fn bind_reference_input(
        &mut self,
        reference: &TimeSeriesReference,
        input: InputId,
    ) -> Result<()> {
        match reference {
            TimeSeriesReference::Empty => self.un_bind_output(input, false),
            TimeSeriesReference::Bound(output) => {
                if self.input_bound(input) && !self.input_has_peer(input) {
                    self.un_bind_output(input, false)?;
                }
                self.bind_output(input, *output).map(|_| ())
            }
            TimeSeriesReference::Unbound(items) => {
                if self.input_has_peer(input) {
                    self.un_bind_output(input, false)?;
                }
                let children = if self.input_cell(input)?.data.is_reference() {
                    self.reference_input_items(input)?
                } else {
                    self.input_items(input)
                };
                for (child, item) in children.into_iter().zip(items) {
                    match item {
                        TimeSeriesReference::Empty => {
                            if self.input_bound(child) {
                                self.un_bind_output(child, false)?;
                            }
                        }
                        item => self.bind_reference_input(item, child)?,
                    }
                }
                Ok(())
            }
        }
    }

    /// The reference visible through a reference input.
    pub fn reference_input_value(&self, id: InputId) -> Option<TimeSeriesReference> {
        let cell = self.inputs.get(id)?;
        if let Some(output) = cell.output {
            return self.reference_output_value(output);
        }
        let InputData::Reference(state) = &cell.data else {
            return None;
        };
        if state.items.iter().any(|i| self.input_valid(*i)) {
            return Some(TimeSeriesReference::Unbound(
                state
                    .items
                    .iter()
                    .map(|i| self.reference_input_value(*i).unwrap_or_default())
                    .collect(),
            ));
        }
        state.value.clone()
    }

    /// Element-wise reference inputs of a composite reference input, created
    /// on first use.
    pub(crate) fn reference_input_items(&mut self, id: InputId) -> Result<Vec<InputId>> {
        let cell = self.input_cell(id)?;
        let node = cell.node;
        let InputData::Reference(state) = &cell.data else {
            return Err(EngineError::TypeMismatch {
                expected: "REF",
                found: cell.data.kind_name(),
            });
        };
        if !state.items.is_empty() {
            return Ok(state.items.clone());
        }
        let element_types = match &state.target {
            super::TsType::Bundle(schema) => schema.types().to_vec(),
            super::TsType::List { element, size } => vec![(**element).clone(); *size],
            other => {
                return Err(EngineError::wiring(format!(
                    "REF[{other}] has no elements to bind"
                )))
            }
        };
        let items = element_types
            .iter()
            .map(|tp| self.create_input(node, Some(id), &super::TsType::reference(tp.clone())))
            .collect::<Result<Vec<_>>>()?;
        if let InputData::Reference(state) = &mut self.input_cell_mut(id)?.data {
            state.items = items.clone();
        }
        Ok(items)
    }

    /// Copy the binding of reference input `src` onto reference input `dst`.
    pub fn clone_binding(&mut self, dst: InputId, src: InputId) -> Result<()> {
        if !self.input_cell(dst)?.data.is_reference() {
            return Err(EngineError::TypeMismatch {
                expected: "REF",
                found: self.input_cell(dst)?.data.kind_name(),
            });
        }
        self.un_bind_output(dst, false)?;
        if let Some(output) = self.input_output(src) {
            self.bind_output(dst, output)?;
        } else if let Some(value) = self.reference_input_value(src) {
            if let InputData::Reference(state) = &mut self.input_cell_mut(dst)?.data {
                state.value = Some(value);
            }
            let active = self.input_active(dst);
            self.sample_input(dst, active)?;
        }
        Ok(())
    }
}
