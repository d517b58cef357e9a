//! Time-series type descriptors.
//!
//! A [`TsType`] describes the shape of a cell tree: which container kind sits
//! at each position and what its children look like. Builders use it to
//! create matching output and input trees, and wiring uses it to check that
//! an edge connects compatible cells.

use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TsType {
    /// A scalar time-series, `TS[T]`.
    Value,
    /// Named, fixed-arity fields, `TSB[...]`.
    Bundle(Arc<BundleSchema>),
    /// Indexed, fixed-arity elements, `TSL[T, size]`.
    List { element: Box<TsType>, size: usize },
    /// Dynamic keys, `TSD[K, V]`.
    Dict { element: Box<TsType> },
    /// `TSS[T]`.
    Set,
    /// Ring buffer of the last `size` ticks, `TSW[T, size, min_size]`.
    Window { size: usize, min_size: usize },
    /// A reference to a time-series of the wrapped type, `REF[T]`.
    Reference(Box<TsType>),
}

impl TsType {
    pub fn bundle<S: Into<String>>(fields: impl IntoIterator<Item = (S, TsType)>) -> Self {
        Self::Bundle(Arc::new(BundleSchema::new(fields)))
    }

    pub fn list(element: TsType, size: usize) -> Self {
        Self::List {
            element: Box::new(element),
            size,
        }
    }

    pub fn dict(element: TsType) -> Self {
        Self::Dict {
            element: Box::new(element),
        }
    }

    pub fn window(size: usize, min_size: usize) -> Self {
        Self::Window { size, min_size }
    }

    pub fn reference(target: TsType) -> Self {
        Self::Reference(Box::new(target))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_))
    }

    /// Reject descriptors that cannot be instantiated.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Window { size, min_size } if *size == 0 || min_size > size => Err(
                EngineError::wiring(format!("invalid window size {size} with min size {min_size}")),
            ),
            Self::Bundle(schema) => schema.types.iter().try_for_each(TsType::validate),
            Self::List { element, .. } | Self::Dict { element } | Self::Reference(element) => {
                element.validate()
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for TsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value => write!(f, "TS"),
            Self::Bundle(schema) => {
                write!(f, "TSB[")?;
                for (i, (key, tp)) in schema.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {tp}")?;
                }
                write!(f, "]")
            }
            Self::List { element, size } => write!(f, "TSL[{element}, {size}]"),
            Self::Dict { element } => write!(f, "TSD[{element}]"),
            Self::Set => write!(f, "TSS"),
            Self::Window { size, min_size } => write!(f, "TSW[{size}, {min_size}]"),
            Self::Reference(target) => write!(f, "REF[{target}]"),
        }
    }
}

/// Field names and types of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleSchema {
    keys: Vec<String>,
    types: Vec<TsType>,
}

impl BundleSchema {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = (S, TsType)>) -> Self {
        let (keys, types) = fields.into_iter().map(|(k, t)| (k.into(), t)).unzip();
        Self { keys, types }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn types(&self) -> &[TsType] {
        &self.types
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TsType)> {
        self.keys.iter().map(String::as_str).zip(self.types.iter())
    }
}
