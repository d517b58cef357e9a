//! Scalar payloads.
//!
//! Every leaf time-series carries a [`Scalar`]. The container logic is written
//! once over this type; host-language objects travel as one more variant,
//! [`Scalar::Object`], behind the narrow [`ExternalValue`] trait.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::NodeError;
use crate::time::{EngineTime, EngineTimeDelta};

/// Behaviour required of a foreign value stored in a time-series.
pub trait ExternalValue: fmt::Debug + Send + Sync + 'static {
    fn type_name(&self) -> &'static str;
    fn equals(&self, other: &dyn ExternalValue) -> bool;
    fn hash_value(&self) -> u64;
    fn render(&self) -> String;
    fn as_any(&self) -> &dyn Any;
}

/// Adapter turning any hashable, printable Rust value into an [`ExternalValue`].
#[derive(Debug)]
struct Opaque<T>(T);

impl<T> ExternalValue for Opaque<T>
where
    T: fmt::Debug + fmt::Display + PartialEq + Hash + Send + Sync + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn equals(&self, other: &dyn ExternalValue) -> bool {
        other
            .as_any()
            .downcast_ref::<Opaque<T>>()
            .is_some_and(|o| o.0 == self.0)
    }

    fn hash_value(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish()
    }

    fn render(&self) -> String {
        self.0.to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A shared handle to a foreign value.
#[derive(Clone)]
pub struct ObjectValue(Arc<dyn ExternalValue>);

impl ObjectValue {
    pub fn new<T>(value: T) -> Self
    where
        T: fmt::Debug + fmt::Display + PartialEq + Hash + Send + Sync + 'static,
    {
        Self(Arc::new(Opaque(value)))
    }

    pub fn from_external(value: Arc<dyn ExternalValue>) -> Self {
        Self(value)
    }

    pub fn external(&self) -> &dyn ExternalValue {
        self.0.as_ref()
    }

    /// Recover the wrapped Rust value, if it was created with [`ObjectValue::new`].
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<Opaque<T>>().map(|o| &o.0)
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object<{}>({})", self.0.type_name(), self.0.render())
    }
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.equals(other.0.as_ref())
    }
}

impl Eq for ObjectValue {}

impl Hash for ObjectValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_value().hash(state);
    }
}

/// The payload of a scalar time-series.
#[derive(Debug, Clone)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Time(EngineTime),
    Duration(EngineTimeDelta),
    Tuple(Arc<[Scalar]>),
    Error(Arc<NodeError>),
    Object(ObjectValue),
}

impl Scalar {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Time(_) => "datetime",
            Self::Duration(_) => "timedelta",
            Self::Tuple(_) => "tuple",
            Self::Error(_) => "NodeError",
            Self::Object(_) => "object",
        }
    }

    pub fn tuple(items: impl IntoIterator<Item = Scalar>) -> Self {
        Self::Tuple(items.into_iter().collect::<Vec<_>>().into())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Integers widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(&**v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<EngineTime> {
        match self {
            Self::Time(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&NodeError> {
        match self {
            Self::Error(e) => Some(&**e),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectValue> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            // Bitwise so that equality agrees with hashing (NaN == NaN).
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Time(a), Self::Time(b)) => a == b,
            (Self::Duration(a), Self::Duration(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Bool(v) => v.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::Str(v) => v.hash(state),
            Self::Time(v) => v.hash(state),
            Self::Duration(v) => v.hash(state),
            Self::Tuple(v) => v.hash(state),
            Self::Error(v) => v.hash(state),
            Self::Object(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
            Self::Time(v) => write!(f, "{v}"),
            Self::Duration(v) => write!(f, "{v}"),
            Self::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Self::Error(e) => write!(f, "{}", e.error_msg),
            Self::Object(o) => write!(f, "{}", o.external().render()),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::Str(v.into())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::Str(v.into())
    }
}

impl From<EngineTime> for Scalar {
    fn from(v: EngineTime) -> Self {
        Self::Time(v)
    }
}

impl From<EngineTimeDelta> for Scalar {
    fn from(v: EngineTimeDelta) -> Self {
        Self::Duration(v)
    }
}

impl From<NodeError> for Scalar {
    fn from(v: NodeError) -> Self {
        Self::Error(Arc::new(v))
    }
}

impl From<ObjectValue> for Scalar {
    fn from(v: ObjectValue) -> Self {
        Self::Object(v)
    }
}
