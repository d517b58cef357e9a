//! Conversion between engine values and a host representation.
//!
//! The container logic never sees foreign values directly. A bridge converts
//! at the edge: reading an output into the host's native form, and turning a
//! host value into a [`DeltaValue`] that `apply_result` understands. The
//! [`JsonBridge`] maps to `serde_json::Value`; the Python bridge lives behind
//! the `python` feature.

use serde_json::{json, Map, Number, Value};

use super::{DeltaValue, Scalar};
use crate::error::{EngineError, NodeError, Result};
use crate::runtime::Runtime;
use crate::series::{OutputId, TsType};
use crate::time::{EngineTime, EngineTimeDelta};

/// Two-way conversion between engine values and a host type.
pub trait ExternalBridge {
    type Value;

    /// Render a change set (or a full snapshot) of a time-series of type `tp`.
    fn to_external(&self, value: &DeltaValue, tp: &TsType) -> Result<Self::Value>;

    /// Validate and convert a host value destined for a time-series of type `tp`.
    fn from_external(&self, value: &Self::Value, tp: &TsType) -> Result<DeltaValue>;
}

impl Runtime {
    /// The full current value of `output` in the bridge's representation.
    pub fn external_value<B: ExternalBridge>(
        &self,
        bridge: &B,
        output: OutputId,
    ) -> Result<Option<B::Value>> {
        let tp = self.output_type(output)?;
        self.value_snapshot(output)
            .map(|v| bridge.to_external(&v, &tp))
            .transpose()
    }

    /// What changed on `output` this cycle, in the bridge's representation.
    pub fn external_delta_value<B: ExternalBridge>(
        &self,
        bridge: &B,
        output: OutputId,
    ) -> Result<Option<B::Value>> {
        if !self.output_modified(output) {
            return Ok(None);
        }
        let tp = self.output_type(output)?;
        self.delta_value(output)
            .map(|v| bridge.to_external(&v, &tp))
            .transpose()
    }

    /// Convert a host value and apply it to `output`.
    pub fn apply_external<B: ExternalBridge>(
        &mut self,
        bridge: &B,
        output: OutputId,
        value: &B::Value,
    ) -> Result<()> {
        let tp = self.output_type(output)?;
        let delta = bridge.from_external(value, &tp)?;
        self.apply_result(output, delta)
    }
}

/// Maps engine values to JSON.
///
/// Times and durations are tagged objects (`{"datetime": micros}`,
/// `{"timedelta": micros}`); tuples are arrays; a dict entry of `null`
/// removes the key; sets are `{"added": [...], "removed": [...]}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBridge;

impl JsonBridge {
    pub fn scalar_to_json(&self, scalar: &Scalar) -> Result<Value> {
        Ok(match scalar {
            Scalar::Bool(v) => Value::Bool(*v),
            Scalar::Int(v) => Value::from(*v),
            Scalar::Float(v) => Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Str(v) => Value::String(v.to_string()),
            Scalar::Time(v) => json!({ "datetime": v.micros() }),
            Scalar::Duration(v) => json!({ "timedelta": v.micros() }),
            Scalar::Tuple(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.scalar_to_json(item))
                    .collect::<Result<_>>()?,
            ),
            Scalar::Error(e) => json!({ "error": serde_json::to_value(&**e)? }),
            Scalar::Object(o) => Value::String(o.external().render()),
        })
    }

    pub fn scalar_from_json(&self, value: &Value) -> Result<Scalar> {
        match value {
            Value::Bool(v) => Ok(Scalar::Bool(*v)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Scalar::Int(i)),
                None => n
                    .as_f64()
                    .map(Scalar::Float)
                    .ok_or_else(|| EngineError::evaluation(format!("unsupported number {n}"))),
            },
            Value::String(s) => Ok(Scalar::from(s.as_str())),
            Value::Array(items) => Ok(Scalar::tuple(
                items
                    .iter()
                    .map(|item| self.scalar_from_json(item))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Value::Object(map) => {
                if let Some(t) = map.get("datetime").and_then(Value::as_i64) {
                    Ok(Scalar::Time(EngineTime::from_micros(t)))
                } else if let Some(d) = map.get("timedelta").and_then(Value::as_i64) {
                    Ok(Scalar::Duration(EngineTimeDelta::from_micros(d)))
                } else if let Some(e) = map.get("error") {
                    let error: NodeError = serde_json::from_value(e.clone())?;
                    Ok(Scalar::from(error))
                } else {
                    Err(EngineError::evaluation(format!("cannot convert {value} to a scalar")))
                }
            }
            Value::Null => Err(EngineError::evaluation("cannot apply null to a scalar")),
        }
    }

    fn key_to_json(&self, key: &Scalar) -> String {
        match key {
            Scalar::Str(s) => s.to_string(),
            other => other.to_string(),
        }
    }

    fn key_from_json(&self, key: &str) -> Scalar {
        key.parse::<i64>().map_or_else(|_| Scalar::from(key), Scalar::Int)
    }
}

impl ExternalBridge for JsonBridge {
    type Value = Value;

    fn to_external(&self, value: &DeltaValue, tp: &TsType) -> Result<Value> {
        Ok(match (value, tp) {
            (DeltaValue::Scalar(s), _) => self.scalar_to_json(s)?,
            (DeltaValue::Bundle(items), TsType::Bundle(schema)) => {
                let mut map = Map::new();
                for (ndx, item) in items {
                    let (Some(key), Some(child)) = (schema.keys().get(*ndx), schema.types().get(*ndx))
                    else {
                        return Err(EngineError::wiring(format!("bundle index {ndx} out of range")));
                    };
                    map.insert(key.clone(), self.to_external(item, child)?);
                }
                Value::Object(map)
            }
            (DeltaValue::List(items), TsType::List { element, .. }) => {
                let mut map = Map::new();
                for (ndx, item) in items {
                    map.insert(ndx.to_string(), self.to_external(item, element)?);
                }
                Value::Object(map)
            }
            (DeltaValue::List(items), TsType::Window { .. }) => Value::Array(
                items
                    .iter()
                    .map(|(_, item)| self.to_external(item, &TsType::Value))
                    .collect::<Result<_>>()?,
            ),
            (DeltaValue::Dict { modified, removed }, TsType::Dict { element }) => {
                let mut map = Map::new();
                for (key, item) in modified {
                    map.insert(self.key_to_json(key), self.to_external(item, element)?);
                }
                for key in removed {
                    map.insert(self.key_to_json(key), Value::Null);
                }
                Value::Object(map)
            }
            (DeltaValue::Set { added, removed }, _) => json!({
                "added": added.iter().map(|v| self.scalar_to_json(v)).collect::<Result<Vec<_>>>()?,
                "removed": removed.iter().map(|v| self.scalar_to_json(v)).collect::<Result<Vec<_>>>()?,
            }),
            (DeltaValue::Reference(r), _) => Value::String(r.to_string()),
            (value, tp) => {
                return Err(EngineError::wiring(format!(
                    "cannot render {} as {tp}",
                    value.kind_name()
                )))
            }
        })
    }

    fn from_external(&self, value: &Value, tp: &TsType) -> Result<DeltaValue> {
        match tp {
            TsType::Value | TsType::Window { .. } => Ok(DeltaValue::Scalar(self.scalar_from_json(value)?)),
            TsType::Bundle(schema) => {
                let map = expect_object(value, tp)?;
                let mut items = Vec::with_capacity(map.len());
                for (key, item) in map {
                    let ndx = schema
                        .index_of(key)
                        .ok_or_else(|| EngineError::evaluation(format!("no field `{key}` in {tp}")))?;
                    if !item.is_null() {
                        items.push((ndx, self.from_external(item, &schema.types()[ndx])?));
                    }
                }
                items.sort_by_key(|(ndx, _)| *ndx);
                Ok(DeltaValue::Bundle(items))
            }
            TsType::List { element, size } => {
                let entries: Vec<(usize, &Value)> = match value {
                    Value::Array(items) => items.iter().enumerate().collect(),
                    Value::Object(map) => map
                        .iter()
                        .map(|(k, v)| {
                            k.parse::<usize>()
                                .map(|ndx| (ndx, v))
                                .map_err(|_| EngineError::evaluation(format!("bad list index `{k}`")))
                        })
                        .collect::<Result<_>>()?,
                    _ => return Err(mismatch(value, tp)),
                };
                let mut items = Vec::new();
                for (ndx, item) in entries {
                    if ndx >= *size {
                        return Err(EngineError::evaluation(format!("index {ndx} out of range for {tp}")));
                    }
                    if !item.is_null() {
                        items.push((ndx, self.from_external(item, element)?));
                    }
                }
                Ok(DeltaValue::List(items))
            }
            TsType::Dict { element } => {
                let mut modified = Vec::new();
                let mut removed = Vec::new();
                for (key, item) in expect_object(value, tp)? {
                    let key = self.key_from_json(key);
                    if item.is_null() {
                        removed.push(key);
                    } else {
                        modified.push((key, self.from_external(item, element)?));
                    }
                }
                Ok(DeltaValue::Dict { modified, removed })
            }
            TsType::Set => {
                let scalars = |v: Option<&Value>| -> Result<Vec<Scalar>> {
                    match v {
                        Some(Value::Array(items)) => items.iter().map(|i| self.scalar_from_json(i)).collect(),
                        Some(Value::Null) | None => Ok(Vec::new()),
                        Some(other) => Err(mismatch(other, tp)),
                    }
                };
                match value {
                    Value::Array(_) => Ok(DeltaValue::Set {
                        added: scalars(Some(value))?,
                        removed: Vec::new(),
                    }),
                    Value::Object(map) => Ok(DeltaValue::Set {
                        added: scalars(map.get("added"))?,
                        removed: scalars(map.get("removed"))?,
                    }),
                    _ => Err(mismatch(value, tp)),
                }
            }
            TsType::Reference(_) => Err(EngineError::NotImplemented("references cannot be built from JSON")),
        }
    }
}

fn expect_object<'a>(value: &'a Value, tp: &TsType) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| mismatch(value, tp))
}

fn mismatch(value: &Value, tp: &TsType) -> EngineError {
    EngineError::evaluation(format!("cannot apply {value} to {tp}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_survive_json() {
        let bridge = JsonBridge;
        for scalar in [
            Scalar::from(true),
            Scalar::from(42),
            Scalar::from(1.5),
            Scalar::from("abc"),
            Scalar::Time(EngineTime::from_secs(3)),
            Scalar::Duration(EngineTimeDelta::from_millis(5)),
            Scalar::tuple([Scalar::from(1), Scalar::from("x")]),
        ] {
            let json = bridge.scalar_to_json(&scalar).unwrap();
            assert_eq!(bridge.scalar_from_json(&json).unwrap(), scalar);
        }
    }

    #[test]
    fn null_dict_entries_remove_keys() {
        let tp = TsType::dict(TsType::Value);
        let delta = JsonBridge
            .from_external(&json!({"a": 1, "b": null, "7": 2}), &tp)
            .unwrap();
        let DeltaValue::Dict { modified, removed } = delta else {
            panic!("expected a dict delta");
        };
        assert_eq!(removed, vec![Scalar::from("b")]);
        assert!(modified.contains(&(Scalar::from(7), DeltaValue::from(2))));
    }

    #[test]
    fn bundles_are_keyed_by_field() {
        let tp = TsType::bundle([("x", TsType::Value), ("y", TsType::Value)]);
        let delta = JsonBridge.from_external(&json!({"y": "b", "x": 1}), &tp).unwrap();
        assert_eq!(
            delta,
            DeltaValue::Bundle(vec![(0, DeltaValue::from(1)), (1, DeltaValue::from("b"))])
        );
        let back = JsonBridge.to_external(&delta, &tp).unwrap();
        assert_eq!(back, json!({"x": 1, "y": "b"}));
    }

    #[test]
    fn wrong_shapes_are_rejected() {
        let tp = TsType::list(TsType::Value, 2);
        assert!(JsonBridge.from_external(&json!([1, 2, 3]), &tp).is_err());
        assert!(JsonBridge.from_external(&json!("x"), &TsType::Set).is_err());
        assert!(JsonBridge.scalar_from_json(&Value::Null).is_err());
    }
}
