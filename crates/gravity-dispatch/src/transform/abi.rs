//! Value ABI between the record model and the script engine.
//!
//! Conversions are lossless for every leaf and composite type: native
//! script types carry `int`, `float`, `string`, `bool`, `binary` (blob),
//! `map`, and `array`; `uint`, `time`, and `any` travel as typed dynamics
//! that round-trip unchanged when a script passes them through.

use chrono::{DateTime, Utc};
use gravity_record::{Record, Value};
use rhai::Dynamic;

/// Converts a record into a script map.
#[must_use]
pub fn record_to_map(record: &Record) -> rhai::Map {
    record
        .iter()
        .map(|field| (field.name.as_str().into(), value_to_dynamic(&field.value)))
        .collect()
}

/// Converts a script map back into a record.
#[must_use]
pub fn map_to_record(map: rhai::Map) -> Record {
    map.into_iter()
        .map(|(name, dynamic)| gravity_record::Field::new(name.to_string(), dynamic_to_value(dynamic)))
        .collect()
}

/// Converts one value into its script representation.
#[must_use]
pub fn value_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Int(v) => Dynamic::from(*v),
        Value::UInt(v) => Dynamic::from(*v),
        Value::Float(v) => Dynamic::from(*v),
        Value::Str(v) => Dynamic::from(v.clone()),
        Value::Bool(v) => Dynamic::from(*v),
        Value::Time(v) => Dynamic::from(*v),
        Value::Binary(v) => Dynamic::from_blob(v.clone()),
        Value::Any(v) => Dynamic::from(v.clone()),
        Value::Map(record) => Dynamic::from_map(record_to_map(record)),
        Value::Array(items) => {
            Dynamic::from_array(items.iter().map(value_to_dynamic).collect())
        }
    }
}

/// Converts one script value back into the record model.
#[must_use]
pub fn dynamic_to_value(dynamic: Dynamic) -> Value {
    if dynamic.is_unit() {
        return Value::Null;
    }
    if dynamic.is_int() {
        return Value::Int(dynamic.as_int().unwrap_or_default());
    }
    if dynamic.is_bool() {
        return Value::Bool(dynamic.as_bool().unwrap_or_default());
    }
    if dynamic.is_float() {
        return Value::Float(dynamic.as_float().unwrap_or_default());
    }
    if dynamic.is_string() {
        return Value::Str(
            dynamic
                .into_immutable_string()
                .map(|s| s.to_string())
                .unwrap_or_default(),
        );
    }
    if dynamic.is_char() {
        return Value::Str(
            dynamic
                .as_char()
                .map(String::from)
                .unwrap_or_default(),
        );
    }
    if dynamic.is_map() {
        if let Some(map) = dynamic.try_cast::<rhai::Map>() {
            return Value::Map(map_to_record(map));
        }
        return Value::Null;
    }
    if dynamic.is_array() {
        if let Some(items) = dynamic.try_cast::<rhai::Array>() {
            return Value::Array(items.into_iter().map(dynamic_to_value).collect());
        }
        return Value::Null;
    }
    if dynamic.is::<rhai::Blob>() {
        if let Some(blob) = dynamic.try_cast::<rhai::Blob>() {
            return Value::Binary(blob);
        }
        return Value::Null;
    }
    if dynamic.is::<u64>() {
        if let Some(v) = dynamic.try_cast::<u64>() {
            return Value::UInt(v);
        }
        return Value::Null;
    }
    if dynamic.is::<DateTime<Utc>>() {
        if let Some(t) = dynamic.try_cast::<DateTime<Utc>>() {
            return Value::Time(t);
        }
        return Value::Null;
    }
    if dynamic.is::<serde_json::Value>() {
        if let Some(v) = dynamic.try_cast::<serde_json::Value>() {
            return Value::Any(v);
        }
        return Value::Null;
    }
    // Unknown host type produced by a script: keep its text form rather
    // than failing the whole message.
    Value::Str(dynamic.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gravity_record::Field;

    fn sample_record() -> Record {
        let mut nested = Record::new();
        nested.set("inner", Value::Int(1));

        [
            Field::new("i", Value::Int(-5)),
            Field::new("u", Value::UInt(u64::MAX)),
            Field::new("f", Value::Float(0.25)),
            Field::new("s", Value::Str("text".into())),
            Field::new("b", Value::Bool(true)),
            Field::new(
                "t",
                Value::Time(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            ),
            Field::new("bin", Value::Binary(vec![0, 1, 2])),
            Field::new("any", Value::Any(serde_json::json!({"x": 1}))),
            Field::new("m", Value::Map(nested)),
            Field::new("a", Value::Array(vec![Value::Int(1), Value::Str("two".into())])),
            Field::new("n", Value::Null),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_round_trip_all_variants() {
        let record = sample_record();
        let map = record_to_map(&record);
        let back = map_to_record(map);

        // Script maps are sorted by key, so compare by content.
        assert_eq!(back.len(), record.len());
        for field in record.iter() {
            assert_eq!(
                back.get(&field.name),
                Some(&field.value),
                "field '{}' did not round-trip",
                field.name
            );
        }
    }

    #[test]
    fn test_unit_becomes_null() {
        assert_eq!(dynamic_to_value(Dynamic::UNIT), Value::Null);
    }

    #[test]
    fn test_char_becomes_string() {
        assert_eq!(dynamic_to_value(Dynamic::from('x')), Value::Str("x".into()));
    }

    #[test]
    fn test_nested_composites_round_trip() {
        let mut inner = Record::new();
        inner.set("deep", Value::Array(vec![Value::Map(Record::new())]));
        let value = Value::Map(inner);

        let back = dynamic_to_value(value_to_dynamic(&value));
        assert_eq!(back, value);
    }
}
