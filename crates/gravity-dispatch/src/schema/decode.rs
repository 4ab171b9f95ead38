//! Structural decoding of raw JSON payloads into typed records.
//!
//! Decode failures are deliberately asymmetric: only structurally
//! unparseable JSON fails the message (`BadInput`). A field that cannot be
//! coerced to its declared type is dropped and recorded as a warning, so
//! one bad field never poisons the event.
//!
//! Payload kinds:
//!
//! - **Full record** — plain keys only. Fields decode in schema declaration
//!   order; input fields not in the schema are dropped.
//! - **Partial update** — detected by the presence of `$removedFields` or
//!   any dotted key. Fields keep input insertion order; dotted keys build
//!   nested maps/arrays; `$removedFields` stays a literal top-level field.

use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use gravity_record::{FieldPath, PathSegment, Record, Value, REMOVED_FIELDS};
use serde_json::Value as Json;

use super::{Schema, SchemaNode, SchemaType};
use crate::error::{DispatchError, Result};

/// Epoch values at or above this are interpreted as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// A decoded payload: the typed record plus any per-field coercion
/// warnings collected along the way.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    /// The decoded record.
    pub record: Record,
    /// Fields dropped because their value could not be coerced.
    pub warnings: Vec<FieldWarning>,
    /// Whether the payload was a partial update.
    pub partial: bool,
}

/// A dropped field: the input value did not match the declared type and no
/// unambiguous coercion existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWarning {
    /// Dotted path of the offending field.
    pub field: String,
    /// The declared type name.
    pub expected: &'static str,
    /// The JSON type that was actually present.
    pub actual: &'static str,
}

impl std::fmt::Display for FieldWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "field '{}': cannot coerce {} to {}",
            self.field, self.actual, self.expected
        )
    }
}

impl Schema {
    /// Decodes a raw JSON payload against this schema.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::BadInput` only when the payload is not a
    /// JSON object; individual field mismatches are dropped, never fatal.
    pub fn decode(&self, raw: &[u8]) -> Result<DecodedRecord> {
        let json: Json = serde_json::from_slice(raw)
            .map_err(|e| DispatchError::BadInput(format!("payload is not valid JSON: {e}")))?;
        let object = json
            .as_object()
            .ok_or_else(|| DispatchError::BadInput("payload is not a JSON object".into()))?;

        let partial = object
            .keys()
            .any(|key| key == REMOVED_FIELDS || key.contains('.'));

        let mut warnings = Vec::new();
        let record = if partial {
            self.decode_partial(object, &mut warnings)
        } else {
            self.decode_full(object, &mut warnings)
        };

        Ok(DecodedRecord {
            record,
            warnings,
            partial,
        })
    }

    /// Full record: schema declaration order, unknown input fields dropped.
    fn decode_full(
        &self,
        object: &serde_json::Map<String, Json>,
        warnings: &mut Vec<FieldWarning>,
    ) -> Record {
        let mut record = Record::with_capacity(self.len());
        for (name, node) in self.fields() {
            let Some(json) = object.get(name) else {
                continue;
            };
            if let Some(value) = coerce(node, json, name, warnings) {
                record.set(name, value);
            }
        }
        record
    }

    /// Partial update: input insertion order, dotted keys resolved into
    /// nested structures, `$removedFields` kept literal.
    fn decode_partial(
        &self,
        object: &serde_json::Map<String, Json>,
        warnings: &mut Vec<FieldWarning>,
    ) -> Record {
        let mut record = Record::new();
        for (key, json) in object {
            if key == REMOVED_FIELDS {
                if let Some(paths) = decode_removed_fields(json) {
                    record.set(REMOVED_FIELDS, paths);
                } else {
                    warnings.push(FieldWarning {
                        field: REMOVED_FIELDS.to_string(),
                        expected: "array",
                        actual: json_type_name(json),
                    });
                }
                continue;
            }

            let path = FieldPath::parse(key);
            let Some(node) = self.resolve_path(&path) else {
                continue;
            };
            if let Some(value) = coerce(node, json, key, warnings) {
                record.set_path(&path, value);
            }
        }
        record
    }

    /// Normalizes an already-decoded record: fields are reordered into
    /// schema declaration order and fields the schema does not declare are
    /// dropped. The removed-fields marker survives, ahead of the schema
    /// fields.
    #[must_use]
    pub fn validate(&self, record: &Record) -> Record {
        let mut normalized = Record::with_capacity(record.len());
        if let Some(removed) = record.get(REMOVED_FIELDS) {
            normalized.set(REMOVED_FIELDS, removed.clone());
        }
        for (name, _) in self.fields() {
            if let Some(value) = record.get(name) {
                normalized.set(name, value.clone());
            }
        }
        normalized
    }

    /// Walks the schema tree along a dotted path, returning the node the
    /// path addresses (field segments descend maps, index segments descend
    /// into array subtypes).
    fn resolve_path(&self, path: &FieldPath) -> Option<&SchemaNode> {
        let segments = path.segments();
        let first = match segments.first()? {
            PathSegment::Field(name) => name,
            PathSegment::Index(_) => return None,
        };
        let mut node = self.get(first)?;
        for segment in &segments[1..] {
            node = match (segment, &node.kind) {
                (PathSegment::Field(name), SchemaType::Map(inner)) => inner.get(name)?,
                (PathSegment::Index(_), SchemaType::Array(subtype)) => subtype,
                _ => return None,
            };
        }
        Some(node)
    }
}

/// `$removedFields` must be an array; its elements are kept as path
/// strings (non-strings are dropped).
fn decode_removed_fields(json: &Json) -> Option<Value> {
    let items = json.as_array()?;
    let paths = items
        .iter()
        .filter_map(Json::as_str)
        .map(|s| Value::Str(s.to_string()))
        .collect();
    Some(Value::Array(paths))
}

/// Coerces one JSON value to a schema node's type.
///
/// Returns `None` (and records a warning) when no unambiguous coercion
/// exists. JSON `null` always passes through as `Value::Null`.
fn coerce(
    node: &SchemaNode,
    json: &Json,
    path: &str,
    warnings: &mut Vec<FieldWarning>,
) -> Option<Value> {
    if json.is_null() {
        return Some(Value::Null);
    }

    let coerced = match &node.kind {
        SchemaType::Int => coerce_int(json),
        SchemaType::UInt => coerce_uint(json),
        SchemaType::Float => coerce_float(json),
        SchemaType::String => coerce_string(json),
        SchemaType::Bool => coerce_bool(json),
        SchemaType::Time => coerce_time(json),
        SchemaType::Binary => coerce_binary(json),
        SchemaType::Any => Some(Value::Any(json.clone())),
        SchemaType::Map(inner) => coerce_map(inner, json, path, warnings),
        SchemaType::Array(subtype) => coerce_array(subtype, json, path, warnings),
    };

    if coerced.is_none() {
        warnings.push(FieldWarning {
            field: path.to_string(),
            expected: node.kind.name(),
            actual: json_type_name(json),
        });
    }
    coerced
}

fn coerce_int(json: &Json) -> Option<Value> {
    match json {
        Json::Number(n) => {
            if let Some(v) = n.as_i64() {
                return Some(Value::Int(v));
            }
            // Truncate toward zero only when there is no fractional part;
            // out-of-range and fractional floats are dropped.
            let f = n.as_f64()?;
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Some(Value::Int(f as i64))
            } else {
                None
            }
        }
        Json::String(s) => s.parse::<i64>().ok().map(Value::Int),
        Json::Bool(b) => Some(Value::Int(i64::from(*b))),
        _ => None,
    }
}

fn coerce_uint(json: &Json) -> Option<Value> {
    match json {
        Json::Number(n) => {
            if let Some(v) = n.as_u64() {
                return Some(Value::UInt(v));
            }
            let f = n.as_f64()?;
            if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 {
                Some(Value::UInt(f as u64))
            } else {
                None
            }
        }
        Json::String(s) => s.parse::<u64>().ok().map(Value::UInt),
        Json::Bool(b) => Some(Value::UInt(u64::from(*b))),
        _ => None,
    }
}

fn coerce_float(json: &Json) -> Option<Value> {
    match json {
        Json::Number(n) => n.as_f64().map(Value::Float),
        Json::String(s) => s.parse::<f64>().ok().map(Value::Float),
        Json::Bool(b) => Some(Value::Float(if *b { 1.0 } else { 0.0 })),
        _ => None,
    }
}

fn coerce_string(json: &Json) -> Option<Value> {
    match json {
        Json::String(s) => Some(Value::Str(s.clone())),
        Json::Number(n) => Some(Value::Str(n.to_string())),
        _ => None,
    }
}

fn coerce_bool(json: &Json) -> Option<Value> {
    match json {
        Json::Bool(b) => Some(Value::Bool(*b)),
        Json::Number(n) => match n.as_f64()? {
            f if f == 0.0 => Some(Value::Bool(false)),
            f if f == 1.0 => Some(Value::Bool(true)),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_time(json: &Json) -> Option<Value> {
    match json {
        Json::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| Value::Time(t.with_timezone(&Utc))),
        Json::Number(n) => {
            let epoch = n.as_i64()?;
            let time = if epoch.abs() < EPOCH_MILLIS_THRESHOLD {
                Utc.timestamp_opt(epoch, 0).single()?
            } else {
                Utc.timestamp_millis_opt(epoch).single()?
            };
            Some(Value::Time(time))
        }
        _ => None,
    }
}

fn coerce_binary(json: &Json) -> Option<Value> {
    match json {
        Json::String(s) => base64::engine::general_purpose::STANDARD
            .decode(s)
            .ok()
            .map(Value::Binary),
        Json::Array(items) => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|item| item.as_u64().and_then(|v| u8::try_from(v).ok()))
                .collect();
            bytes.map(Value::Binary)
        }
        _ => None,
    }
}

/// Nested objects decode recursively in the inner schema's order; unknown
/// inner fields are dropped.
fn coerce_map(
    inner: &Schema,
    json: &Json,
    path: &str,
    warnings: &mut Vec<FieldWarning>,
) -> Option<Value> {
    let object = json.as_object()?;
    let mut record = Record::with_capacity(inner.len());
    for (name, node) in inner.fields() {
        let Some(child) = object.get(name) else {
            continue;
        };
        let child_path = format!("{path}.{name}");
        if let Some(value) = coerce(node, child, &child_path, warnings) {
            record.set(name, value);
        }
    }
    Some(Value::Map(record))
}

/// Array elements coerce individually; uncoercible elements are dropped.
fn coerce_array(
    subtype: &SchemaNode,
    json: &Json,
    path: &str,
    warnings: &mut Vec<FieldWarning>,
) -> Option<Value> {
    let items = json.as_array()?;
    let mut values = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let child_path = format!("{path}.{idx}");
        if let Some(value) = coerce(subtype, item, &child_path, warnings) {
            values.push(value);
        }
    }
    Some(Value::Array(values))
}

fn json_type_name(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::parse(&json!({
            "id": {"type": "int"},
            "name": {"type": "string"},
            "gender": {"type": "string"},
            "nested": {
                "type": "map",
                "fields": {"nested_id": {"type": "string"}}
            },
            "tags": {"type": "array", "subtype": "string"},
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_full_record_in_schema_order() {
        let schema = test_schema();
        let decoded = schema
            .decode(br#"{"name":"fred","id":101}"#)
            .unwrap();

        assert!(!decoded.partial);
        assert!(decoded.warnings.is_empty());
        let names: Vec<_> = decoded.record.field_names().collect();
        assert_eq!(names, vec!["id", "name"]);
        assert_eq!(decoded.record.get("id"), Some(&Value::Int(101)));
        assert_eq!(decoded.record.get("name"), Some(&Value::Str("fred".into())));
    }

    #[test]
    fn test_decode_unknown_field_dropped() {
        let schema = test_schema();
        let decoded = schema
            .decode(br#"{"id":1,"unknown":"x"}"#)
            .unwrap();
        assert_eq!(decoded.record.len(), 1);
        assert!(decoded.record.get("unknown").is_none());
    }

    #[test]
    fn test_decode_uncoercible_field_dropped_with_warning() {
        let schema = test_schema();
        let decoded = schema.decode(br#"{"id":"abc","name":"n"}"#).unwrap();

        assert!(decoded.record.get("id").is_none());
        assert_eq!(decoded.record.get("name"), Some(&Value::Str("n".into())));
        assert_eq!(decoded.warnings.len(), 1);
        assert_eq!(decoded.warnings[0].field, "id");
        assert_eq!(decoded.warnings[0].expected, "int");
    }

    #[test]
    fn test_decode_bad_json_is_fatal() {
        let schema = test_schema();
        let err = schema.decode(b"{truncated").unwrap_err();
        assert!(matches!(err, DispatchError::BadInput(_)));

        let err = schema.decode(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, DispatchError::BadInput(_)));
    }

    #[test]
    fn test_decode_partial_update() {
        let schema = test_schema();
        let decoded = schema
            .decode(
                br#"{"$removedFields":["id"],"nested.nested_id":"hello","tags.0":"new_tag1"}"#,
            )
            .unwrap();

        assert!(decoded.partial);
        let names: Vec<_> = decoded.record.field_names().collect();
        assert_eq!(names, vec![REMOVED_FIELDS, "nested", "tags"]);

        assert_eq!(
            decoded.record.get(REMOVED_FIELDS),
            Some(&Value::Array(vec![Value::Str("id".into())]))
        );
        let nested = decoded.record.get("nested").and_then(Value::as_map).unwrap();
        assert_eq!(nested.get("nested_id"), Some(&Value::Str("hello".into())));
        let tags = decoded.record.get("tags").and_then(Value::as_array).unwrap();
        assert_eq!(tags, &[Value::Str("new_tag1".into())]);
    }

    #[test]
    fn test_decode_partial_unknown_path_dropped() {
        let schema = test_schema();
        let decoded = schema
            .decode(br#"{"nested.other":"x","id.0":"y","id":7}"#)
            .unwrap();
        // "nested.other" is not in the nested schema; "id.0" indexes a
        // non-array. Both drop without warnings; plain "id" still decodes.
        assert_eq!(decoded.record.len(), 1);
        assert_eq!(decoded.record.get("id"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_coerce_string_to_int() {
        assert_eq!(coerce_int(&json!("42")), Some(Value::Int(42)));
        assert_eq!(coerce_int(&json!("-7")), Some(Value::Int(-7)));
        assert_eq!(coerce_int(&json!("abc")), None);
        // Overflow drops.
        assert_eq!(coerce_int(&json!("9223372036854775808")), None);
    }

    #[test]
    fn test_coerce_float_to_int_truncates_only_whole() {
        assert_eq!(coerce_int(&json!(42.0)), Some(Value::Int(42)));
        assert_eq!(coerce_int(&json!(42.5)), None);
    }

    #[test]
    fn test_coerce_number_to_string() {
        assert_eq!(coerce_string(&json!(42)), Some(Value::Str("42".into())));
        assert_eq!(coerce_string(&json!(0.5)), Some(Value::Str("0.5".into())));
    }

    #[test]
    fn test_coerce_bool_numeric() {
        assert_eq!(coerce_bool(&json!(0)), Some(Value::Bool(false)));
        assert_eq!(coerce_bool(&json!(1)), Some(Value::Bool(true)));
        assert_eq!(coerce_bool(&json!(2)), None);
        assert_eq!(coerce_int(&json!(true)), Some(Value::Int(1)));
    }

    #[test]
    fn test_coerce_uint_rejects_negative() {
        assert_eq!(coerce_uint(&json!(-1)), None);
        assert_eq!(coerce_uint(&json!(7)), Some(Value::UInt(7)));
        assert_eq!(coerce_uint(&json!("18446744073709551615")), Some(Value::UInt(u64::MAX)));
    }

    #[test]
    fn test_coerce_time_rfc3339_and_epoch() {
        let rfc = coerce_time(&json!("2024-05-01T12:00:00Z")).unwrap();
        let Value::Time(t) = rfc else { panic!("expected time") };
        assert_eq!(t.timestamp(), 1_714_564_800);

        // Below the threshold: seconds.
        let secs = coerce_time(&json!(1_714_564_800_i64)).unwrap();
        let Value::Time(t) = secs else { panic!("expected time") };
        assert_eq!(t.timestamp(), 1_714_564_800);

        // At or above the threshold: milliseconds.
        let millis = coerce_time(&json!(1_714_564_800_000_i64)).unwrap();
        let Value::Time(t) = millis else { panic!("expected time") };
        assert_eq!(t.timestamp(), 1_714_564_800);

        assert_eq!(coerce_time(&json!("yesterday")), None);
    }

    #[test]
    fn test_coerce_binary() {
        assert_eq!(
            coerce_binary(&json!("aGk=")),
            Some(Value::Binary(b"hi".to_vec()))
        );
        assert_eq!(
            coerce_binary(&json!([104, 105])),
            Some(Value::Binary(b"hi".to_vec()))
        );
        assert_eq!(coerce_binary(&json!([300])), None);
        assert_eq!(coerce_binary(&json!("!!not-base64!!")), None);
    }

    #[test]
    fn test_coerce_any_passthrough() {
        let schema = Schema::parse(&json!({"blob": {"type": "any"}})).unwrap();
        let decoded = schema
            .decode(br#"{"blob":{"deep":[1,"two",null]}}"#)
            .unwrap();
        assert_eq!(
            decoded.record.get("blob"),
            Some(&Value::Any(json!({"deep": [1, "two", null]})))
        );
    }

    #[test]
    fn test_null_passes_through() {
        let schema = test_schema();
        let decoded = schema.decode(br#"{"id":null}"#).unwrap();
        assert_eq!(decoded.record.get("id"), Some(&Value::Null));
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn test_array_elements_coerce_individually() {
        let schema = Schema::parse(&json!({
            "nums": {"type": "array", "subtype": "int"},
        }))
        .unwrap();
        let decoded = schema.decode(br#"{"nums":[1,"2","x",4]}"#).unwrap();

        let nums = decoded.record.get("nums").and_then(Value::as_array).unwrap();
        assert_eq!(nums, &[Value::Int(1), Value::Int(2), Value::Int(4)]);
        assert_eq!(decoded.warnings.len(), 1);
        assert_eq!(decoded.warnings[0].field, "nums.2");
    }

    #[test]
    fn test_validate_reorders_and_drops() {
        let schema = test_schema();
        let mut record = Record::new();
        record.set("name", Value::Str("fred".into()));
        record.set("extra", Value::Int(1));
        record.set("id", Value::Int(101));

        let normalized = schema.validate(&record);
        let names: Vec<_> = normalized.field_names().collect();
        assert_eq!(names, vec!["id", "name"]);
    }

    #[test]
    fn test_validate_keeps_removed_fields_marker() {
        let schema = test_schema();
        let mut record = Record::new();
        record.set("id", Value::Int(1));
        record.set(
            REMOVED_FIELDS,
            Value::Array(vec![Value::Str("name".into())]),
        );

        let normalized = schema.validate(&record);
        let names: Vec<_> = normalized.field_names().collect();
        assert_eq!(names, vec![REMOVED_FIELDS, "id"]);
    }

    #[test]
    fn test_nested_map_unknown_fields_dropped() {
        let schema = test_schema();
        let decoded = schema
            .decode(br#"{"nested":{"nested_id":"a","extra":1}}"#)
            .unwrap();
        let nested = decoded.record.get("nested").and_then(Value::as_map).unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested.get("nested_id"), Some(&Value::Str("a".into())));
    }
}
