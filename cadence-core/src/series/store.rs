//! Cell storage.
//!
//! Every output and input lives in one of the runtime's two arenas. Composite
//! cells hold the handles of their children; children hold their parent's
//! handle for change propagation only. Creation walks a [`TsType`] and
//! release walks the tree it produced.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use super::handle::{InputId, OutputId};
use super::schema::{BundleSchema, TsType};
use super::subscriber::SubscriberSet;
use crate::error::{EngineError, Result};
use crate::graph::NodeRef;
use crate::runtime::Runtime;
use crate::time::{EngineTime, MIN_DT};
use crate::value::{Scalar, TimeSeriesReference};

pub(crate) struct OutputCell {
    /// The node whose evaluation writes this cell.
    pub node: NodeRef,
    pub parent: Option<OutputId>,
    pub last_modified_time: EngineTime,
    pub subscribers: SubscriberSet<NodeRef>,
    pub data: OutputData,
}

pub(crate) enum OutputData {
    Value(Option<Scalar>),
    Bundle {
        schema: Arc<BundleSchema>,
        items: Vec<OutputId>,
    },
    List(Vec<OutputId>),
    Dict(Box<DictOutputState>),
    Set(Box<SetOutputState>),
    Window(Box<WindowOutputState>),
    Reference(ReferenceOutputState),
}

impl OutputData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Value(_) => "TS",
            Self::Bundle { .. } => "TSB",
            Self::List(_) => "TSL",
            Self::Dict(_) => "TSD",
            Self::Set(_) => "TSS",
            Self::Window(_) => "TSW",
            Self::Reference(_) => "REF",
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_))
    }

    /// Children in position order, for bundles and lists.
    pub fn indexed_items(&self) -> Option<&[OutputId]> {
        match self {
            Self::Bundle { items, .. } | Self::List(items) => Some(items),
            _ => None,
        }
    }
}

pub(crate) struct DictOutputState {
    pub key_set: OutputId,
    pub element: TsType,
    pub items: IndexMap<Scalar, OutputId>,
    pub keys_by_id: HashMap<OutputId, Scalar>,
    pub modified: IndexSet<Scalar>,
    /// Elements removed this cycle, readable until the cycle ends.
    pub removed: IndexMap<Scalar, OutputId>,
    /// Elements dropped without ever being reported as removed.
    pub graveyard: Vec<OutputId>,
    pub key_observers: IndexSet<InputId>,
    pub cleanup_scheduled: bool,
}

pub(crate) struct SetOutputState {
    pub values: IndexSet<Scalar>,
    pub added: IndexSet<Scalar>,
    pub removed: IndexSet<Scalar>,
    /// Items removed then added back within the current cycle.
    pub readded: IndexSet<Scalar>,
    pub is_empty: Option<FeatureOutput>,
    pub contains: IndexMap<Scalar, FeatureOutput>,
    pub cleanup_scheduled: bool,
}

/// A derived `TS[bool]` kept in sync with a set, shared by its requesters.
pub(crate) struct FeatureOutput {
    pub output: OutputId,
    pub requesters: usize,
}

pub(crate) struct WindowOutputState {
    pub buffer: VecDeque<(Scalar, EngineTime)>,
    pub size: usize,
    pub min_size: usize,
    pub removed: Option<(Scalar, EngineTime)>,
    pub cleanup_scheduled: bool,
}

pub(crate) struct ReferenceOutputState {
    pub value: Option<TimeSeriesReference>,
    pub target: TsType,
    /// Non-reference inputs following this output's current target.
    pub observers: IndexSet<InputId>,
}

pub(crate) struct InputCell {
    pub node: NodeRef,
    pub parent: Option<InputId>,
    /// The peer, when bound 1:1 to an output.
    pub output: Option<OutputId>,
    /// The reference output being followed, for non-reference inputs.
    pub reference_output: Option<OutputId>,
    pub active: bool,
    pub sample_time: EngineTime,
    /// Bound while the owning node was not running; sampled when it starts.
    pub sample_on_start: bool,
    pub data: InputData,
}

pub(crate) enum InputData {
    Value,
    Set,
    Window,
    Bundle {
        schema: Arc<BundleSchema>,
        items: Vec<InputId>,
    },
    List(Vec<InputId>),
    Dict(Box<DictInputState>),
    Reference(ReferenceInputState),
}

impl InputData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Value => "TS",
            Self::Set => "TSS",
            Self::Window => "TSW",
            Self::Bundle { .. } => "TSB",
            Self::List(_) => "TSL",
            Self::Dict(_) => "TSD",
            Self::Reference(_) => "REF",
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_))
    }

    /// Children that structurally belong to this input.
    pub fn children(&self) -> Vec<InputId> {
        match self {
            Self::Bundle { items, .. } | Self::List(items) => items.clone(),
            Self::Dict(state) => std::iter::once(state.key_set)
                .chain(state.items.values().copied())
                .collect(),
            Self::Reference(state) => state.items.clone(),
            Self::Value | Self::Set | Self::Window => Vec::new(),
        }
    }
}

pub(crate) struct DictInputState {
    pub key_set: InputId,
    pub element: TsType,
    pub items: IndexMap<Scalar, InputId>,
    /// The dict output whose keys this input follows.
    pub observed: Option<OutputId>,
}

pub(crate) struct ReferenceInputState {
    /// Set when the input is bound to a non-reference output or cloned.
    pub value: Option<TimeSeriesReference>,
    pub target: TsType,
    /// Element-wise reference inputs for a composite target.
    pub items: Vec<InputId>,
}

impl Runtime {
    pub(crate) fn output_cell(&self, id: OutputId) -> Result<&OutputCell> {
        self.outputs
            .get(id)
            .ok_or_else(|| EngineError::StaleHandle(format!("output {id}")))
    }

    pub(crate) fn output_cell_mut(&mut self, id: OutputId) -> Result<&mut OutputCell> {
        self.outputs
            .get_mut(id)
            .ok_or_else(|| EngineError::StaleHandle(format!("output {id}")))
    }

    pub(crate) fn input_cell(&self, id: InputId) -> Result<&InputCell> {
        self.inputs
            .get(id)
            .ok_or_else(|| EngineError::StaleHandle(format!("input {id}")))
    }

    pub(crate) fn input_cell_mut(&mut self, id: InputId) -> Result<&mut InputCell> {
        self.inputs
            .get_mut(id)
            .ok_or_else(|| EngineError::StaleHandle(format!("input {id}")))
    }

    /// True while the handle refers to a live output.
    pub fn output_exists(&self, id: OutputId) -> bool {
        self.outputs.contains(id)
    }

    pub fn input_exists(&self, id: InputId) -> bool {
        self.inputs.contains(id)
    }

    /// Build an output tree of the given shape.
    pub(crate) fn create_output(
        &mut self,
        node: NodeRef,
        parent: Option<OutputId>,
        tp: &TsType,
    ) -> Result<OutputId> {
        tp.validate()?;
        let id = self.outputs.insert(OutputCell {
            node,
            parent,
            last_modified_time: MIN_DT,
            subscribers: SubscriberSet::new(),
            data: OutputData::Value(None),
        });
        let data = match tp {
            TsType::Value => OutputData::Value(None),
            TsType::Bundle(schema) => {
                let items = schema
                    .types()
                    .iter()
                    .map(|child| self.create_output(node, Some(id), child))
                    .collect::<Result<Vec<_>>>()?;
                OutputData::Bundle {
                    schema: schema.clone(),
                    items,
                }
            }
            TsType::List { element, size } => {
                let items = (0..*size)
                    .map(|_| self.create_output(node, Some(id), element))
                    .collect::<Result<Vec<_>>>()?;
                OutputData::List(items)
            }
            TsType::Dict { element } => {
                let key_set = self.create_output(node, Some(id), &TsType::Set)?;
                OutputData::Dict(Box::new(DictOutputState {
                    key_set,
                    element: (**element).clone(),
                    items: IndexMap::new(),
                    keys_by_id: HashMap::new(),
                    modified: IndexSet::new(),
                    removed: IndexMap::new(),
                    graveyard: Vec::new(),
                    key_observers: IndexSet::new(),
                    cleanup_scheduled: false,
                }))
            }
            TsType::Set => OutputData::Set(Box::new(SetOutputState {
                values: IndexSet::new(),
                added: IndexSet::new(),
                removed: IndexSet::new(),
                readded: IndexSet::new(),
                is_empty: None,
                contains: IndexMap::new(),
                cleanup_scheduled: false,
            })),
            TsType::Window { size, min_size } => OutputData::Window(Box::new(WindowOutputState {
                buffer: VecDeque::with_capacity(*size),
                size: *size,
                min_size: *min_size,
                removed: None,
                cleanup_scheduled: false,
            })),
            TsType::Reference(target) => OutputData::Reference(ReferenceOutputState {
                value: None,
                target: (**target).clone(),
                observers: IndexSet::new(),
            }),
        };
        self.output_cell_mut(id)?.data = data;
        Ok(id)
    }

    /// Build an input tree of the given shape. Inputs start unbound and passive.
    pub(crate) fn create_input(
        &mut self,
        node: NodeRef,
        parent: Option<InputId>,
        tp: &TsType,
    ) -> Result<InputId> {
        tp.validate()?;
        let id = self.inputs.insert(InputCell {
            node,
            parent,
            output: None,
            reference_output: None,
            active: false,
            sample_time: MIN_DT,
            sample_on_start: false,
            data: InputData::Value,
        });
        let data = match tp {
            TsType::Value => InputData::Value,
            TsType::Set => InputData::Set,
            TsType::Window { .. } => InputData::Window,
            TsType::Bundle(schema) => {
                let items = schema
                    .types()
                    .iter()
                    .map(|child| self.create_input(node, Some(id), child))
                    .collect::<Result<Vec<_>>>()?;
                InputData::Bundle {
                    schema: schema.clone(),
                    items,
                }
            }
            TsType::List { element, size } => {
                let items = (0..*size)
                    .map(|_| self.create_input(node, Some(id), element))
                    .collect::<Result<Vec<_>>>()?;
                InputData::List(items)
            }
            TsType::Dict { element } => {
                let key_set = self.create_input(node, Some(id), &TsType::Set)?;
                InputData::Dict(Box::new(DictInputState {
                    key_set,
                    element: (**element).clone(),
                    items: IndexMap::new(),
                    observed: None,
                }))
            }
            TsType::Reference(target) => InputData::Reference(ReferenceInputState {
                value: None,
                target: (**target).clone(),
                items: Vec::new(),
            }),
        };
        self.input_cell_mut(id)?.data = data;
        Ok(id)
    }

    /// Release an output tree. Stale handles are ignored.
    pub(crate) fn release_output(&mut self, id: OutputId) {
        let Some(cell) = self.outputs.remove(id) else {
            return;
        };
        match cell.data {
            OutputData::Bundle { items, .. } | OutputData::List(items) => {
                for child in items {
                    self.release_output(child);
                }
            }
            OutputData::Dict(state) => {
                self.release_output(state.key_set);
                for child in state
                    .items
                    .into_values()
                    .chain(state.removed.into_values())
                    .chain(state.graveyard)
                {
                    self.release_output(child);
                }
            }
            OutputData::Set(state) => {
                for feature in state.is_empty.into_iter().chain(state.contains.into_values()) {
                    self.release_output(feature.output);
                }
            }
            OutputData::Reference(state) => {
                for observer in state.observers {
                    if let Some(input) = self.inputs.get_mut(observer) {
                        if input.reference_output == Some(id) {
                            input.reference_output = None;
                        }
                    }
                }
            }
            OutputData::Value(_) | OutputData::Window(_) => {}
        }
    }

    /// Unbind and release an input tree.
    pub(crate) fn release_input(&mut self, id: InputId) -> Result<()> {
        if !self.inputs.contains(id) {
            return Ok(());
        }
        self.make_passive(id)?;
        self.un_bind_output(id, true)?;
        let children = self.input_cell(id)?.data.children();
        for child in children {
            self.release_input(child)?;
        }
        self.inputs.remove(id);
        Ok(())
    }

    /// Reconstruct the type descriptor of a live output.
    pub fn output_type(&self, id: OutputId) -> Result<TsType> {
        Ok(match &self.output_cell(id)?.data {
            OutputData::Value(_) => TsType::Value,
            OutputData::Bundle { schema, .. } => TsType::Bundle(schema.clone()),
            OutputData::List(items) => {
                let element = match items.first() {
                    Some(first) => self.output_type(*first)?,
                    None => TsType::Value,
                };
                TsType::list(element, items.len())
            }
            OutputData::Dict(state) => TsType::dict(state.element.clone()),
            OutputData::Set(_) => TsType::Set,
            OutputData::Window(state) => TsType::window(state.size, state.min_size),
            OutputData::Reference(state) => TsType::reference(state.target.clone()),
        })
    }
}
