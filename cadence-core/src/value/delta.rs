//! Per-cycle change sets.
//!
//! [`DeltaValue`] is both what an output reports as "what changed this cycle"
//! and what `apply_result` accepts. Composite variants only carry the
//! children that changed.

use std::fmt;

use super::{Scalar, TimeSeriesReference};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaValue {
    Scalar(Scalar),
    /// Modified bundle fields, by schema position.
    Bundle(Vec<(usize, DeltaValue)>),
    /// Modified list elements, by index.
    List(Vec<(usize, DeltaValue)>),
    Dict {
        modified: Vec<(Scalar, DeltaValue)>,
        removed: Vec<Scalar>,
    },
    Set {
        added: Vec<Scalar>,
        removed: Vec<Scalar>,
    },
    Reference(TimeSeriesReference),
}

impl DeltaValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Bundle(_) => "bundle",
            Self::List(_) => "list",
            Self::Dict { .. } => "dict",
            Self::Set { .. } => "set",
            Self::Reference(_) => "reference",
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// A dict delta that only sets values.
    pub fn dict<K, V>(items: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Scalar>,
        V: Into<Scalar>,
    {
        Self::Dict {
            modified: items
                .into_iter()
                .map(|(k, v)| (k.into(), Self::Scalar(v.into())))
                .collect(),
            removed: Vec::new(),
        }
    }

    /// A set delta that only adds.
    pub fn set_added<V: Into<Scalar>>(items: impl IntoIterator<Item = V>) -> Self {
        Self::Set {
            added: items.into_iter().map(Into::into).collect(),
            removed: Vec::new(),
        }
    }
}

macro_rules! scalar_delta {
    ($($t:ty),*) => {
        $(
            impl From<$t> for DeltaValue {
                fn from(v: $t) -> Self {
                    Self::Scalar(v.into())
                }
            }
        )*
    };
}

scalar_delta!(Scalar, bool, i32, i64, f64, &str, String);

impl From<TimeSeriesReference> for DeltaValue {
    fn from(r: TimeSeriesReference) -> Self {
        Self::Reference(r)
    }
}

impl fmt::Display for DeltaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "{s}"),
            Self::Bundle(items) | Self::List(items) => {
                write!(f, "{{")?;
                for (i, (ndx, v)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{ndx}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Dict { modified, removed } => {
                write!(f, "{{")?;
                for (i, (k, v)) in modified.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                for k in removed {
                    write!(f, ", {k}: <removed>")?;
                }
                write!(f, "}}")
            }
            Self::Set { added, removed } => {
                write!(f, "+{added:?} -{removed:?}")
            }
            Self::Reference(r) => write!(f, "{r}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_helper_wraps_scalars() {
        let delta = DeltaValue::dict([("a", 1), ("b", 2)]);
        match delta {
            DeltaValue::Dict { modified, removed } => {
                assert_eq!(modified[1], (Scalar::from("b"), DeltaValue::from(2)));
                assert!(removed.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
