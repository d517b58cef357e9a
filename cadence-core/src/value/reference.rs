//! Time-series references.
//!
//! A reference is a value whose payload is the *identity* of an output rather
//! than a scalar. Reference-typed outputs publish them; inputs that observe a
//! reference output rebind themselves whenever the published value changes.

use std::fmt;

use crate::series::OutputId;

/// Which output (or outputs) an input should be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TimeSeriesReference {
    /// Points at nothing; binding it unbinds the input.
    #[default]
    Empty,
    /// Points at exactly one output.
    Bound(OutputId),
    /// Element-wise references for a composite input, by position.
    Unbound(Vec<TimeSeriesReference>),
}

impl TimeSeriesReference {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The referenced output, for a [`TimeSeriesReference::Bound`] value.
    pub fn output(&self) -> Option<OutputId> {
        match self {
            Self::Bound(output) => Some(*output),
            _ => None,
        }
    }

    pub fn items(&self) -> &[TimeSeriesReference] {
        match self {
            Self::Unbound(items) => items,
            _ => &[],
        }
    }
}

impl From<OutputId> for TimeSeriesReference {
    fn from(output: OutputId) -> Self {
        Self::Bound(output)
    }
}

impl fmt::Display for TimeSeriesReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "REF[<Empty>]"),
            Self::Bound(output) => write!(f, "REF[{output}]"),
            Self::Unbound(items) => {
                write!(f, "REF[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::ArenaHandle;

    #[test]
    fn accessors_match_variant() {
        let out = OutputId::from_parts(4, 0);
        let bound = TimeSeriesReference::from(out);
        assert_eq!(bound.output(), Some(out));
        assert!(bound.items().is_empty());

        let unbound = TimeSeriesReference::Unbound(vec![bound.clone(), TimeSeriesReference::Empty]);
        assert_eq!(unbound.items().len(), 2);
        assert!(unbound.output().is_none());
        assert_eq!(unbound.to_string(), "REF[REF[out4v0], REF[<Empty>]]");
    }
}
