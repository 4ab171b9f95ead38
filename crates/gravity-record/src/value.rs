//! The tagged value variant and the ordered record it composes into.
//!
//! [`Value`] covers the platform's leaf types (`int`, `uint`, `float`,
//! `string`, `bool`, `time`, `binary`, `any`) plus the two composites
//! (`map`, `array`). [`Record`] keeps fields in declaration order and
//! offers by-name access on top; ordering matters because full records are
//! emitted in schema order while partial updates keep input order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path::{FieldPath, PathSegment};

/// A single typed value inside a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent / explicitly null.
    Null,
    /// Signed 64-bit integer.
    Int(i64),
    /// Unsigned 64-bit integer.
    UInt(u64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Boolean.
    Bool(bool),
    /// Timestamp (UTC).
    Time(DateTime<Utc>),
    /// Opaque byte string.
    Binary(Vec<u8>),
    /// Schema-less passthrough; carries the original JSON value untouched.
    Any(serde_json::Value),
    /// Nested record.
    Map(Record),
    /// Ordered list of values.
    Array(Vec<Value>),
}

impl Value {
    /// Returns the platform type name of this value.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::Time(_) => "time",
            Value::Binary(_) => "binary",
            Value::Any(_) => "any",
            Value::Map(_) => "map",
            Value::Array(_) => "array",
        }
    }

    /// Returns the integer payload if this is an `Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload if this is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the boolean payload if this is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the nested record if this is a `Map`.
    #[must_use]
    pub fn as_map(&self) -> Option<&Record> {
        match self {
            Value::Map(r) => Some(r),
            _ => None,
        }
    }

    /// Returns the element list if this is an `Array`.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Renders the value for use inside a primary-key string.
    ///
    /// Leaf values render as their natural text form; composites and nulls
    /// render as empty (a missing PK component is detected separately).
    #[must_use]
    pub fn pk_text(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::UInt(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(v) => v.clone(),
            Value::Bool(v) => v.to_string(),
            Value::Time(v) => v.to_rfc3339(),
            Value::Binary(v) => v.iter().map(|b| format!("{b:02x}")).collect(),
            Value::Any(v) => v.to_string(),
            Value::Null | Value::Map(_) | Value::Array(_) => String::new(),
        }
    }
}

/// A named value inside a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Field name. Dotted names never appear here; paths are resolved into
    /// nested maps/arrays before a record is built.
    pub name: String,
    /// The field's value.
    pub value: Value,
}

impl Field {
    /// Creates a new field.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// An ordered sequence of named fields.
///
/// Field order is significant: a full record is emitted in schema
/// declaration order, a partial update in input insertion order. `set`
/// replaces in place (keeping the original position) or appends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    fields: Vec<Field>,
}

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty record with pre-allocated field capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the value of the named field, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Returns a mutable reference to the named field's value, if present.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find(|f| f.name == name)
            .map(|f| &mut f.value)
    }

    /// Sets a field, replacing an existing one in place or appending.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.value = value,
            None => self.fields.push(Field { name, value }),
        }
    }

    /// Removes the named field, returning its value if it was present.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|f| f.name == name)?;
        Some(self.fields.remove(idx).value)
    }

    /// Iterates fields in order.
    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// Returns field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Sets a value at a (possibly nested) path, building intermediate
    /// maps and arrays as needed.
    ///
    /// An existing node whose shape contradicts the path (e.g. a string
    /// where the path needs an array) is replaced. Array indices beyond the
    /// current length extend the array, padding gaps with `Null`.
    pub fn set_path(&mut self, path: &FieldPath, value: Value) {
        let segments = path.segments();
        if segments.is_empty() {
            return;
        }
        // The record level is addressed by name; a leading index segment is
        // treated as a literal field name.
        let name = segments[0].as_field_name();
        if segments.len() == 1 {
            self.set(name, value);
            return;
        }
        if self.get(&name).is_none() {
            self.set(name.clone(), empty_node_for(&segments[1]));
        }
        if let Some(slot) = self.get_mut(&name) {
            set_in_value(slot, &segments[1..], value);
        }
    }

    /// Resolves a value at a (possibly nested) path.
    #[must_use]
    pub fn get_path(&self, path: &FieldPath) -> Option<&Value> {
        let segments = path.segments();
        let first = segments.first()?;
        let mut current = self.get(&first.as_field_name())?;
        for segment in &segments[1..] {
            current = match (segment, current) {
                (PathSegment::Field(name), Value::Map(record)) => record.get(name)?,
                (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl FromIterator<Field> for Record {
    fn from_iter<T: IntoIterator<Item = Field>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Returns the empty composite matching the next path segment's shape.
fn empty_node_for(next: &PathSegment) -> Value {
    match next {
        PathSegment::Field(_) => Value::Map(Record::new()),
        PathSegment::Index(_) => Value::Array(Vec::new()),
    }
}

/// Writes `value` at `segments` below `slot`, reshaping mismatched nodes.
fn set_in_value(slot: &mut Value, segments: &[PathSegment], value: Value) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => {
            *slot = value;
            return;
        }
    };

    match head {
        PathSegment::Field(name) => {
            if !matches!(slot, Value::Map(_)) {
                *slot = Value::Map(Record::new());
            }
            let Value::Map(record) = slot else {
                return;
            };
            if rest.is_empty() {
                record.set(name.clone(), value);
                return;
            }
            if record.get(name).is_none() {
                record.set(name.clone(), empty_node_for(&rest[0]));
            }
            if let Some(child) = record.get_mut(name) {
                set_in_value(child, rest, value);
            }
        }
        PathSegment::Index(idx) => {
            if !matches!(slot, Value::Array(_)) {
                *slot = Value::Array(Vec::new());
            }
            let Value::Array(items) = slot else {
                return;
            };
            while items.len() <= *idx {
                items.push(Value::Null);
            }
            if rest.is_empty() {
                items[*idx] = value;
            } else {
                set_in_value(&mut items[*idx], rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_in_place() {
        let mut record = Record::new();
        record.set("a", Value::Int(1));
        record.set("b", Value::Int(2));
        record.set("a", Value::Int(10));

        let names: Vec<_> = record.field_names().collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(record.get("a"), Some(&Value::Int(10)));
    }

    #[test]
    fn test_remove() {
        let mut record = Record::new();
        record.set("a", Value::Int(1));
        record.set("b", Value::Str("x".into()));

        assert_eq!(record.remove("a"), Some(Value::Int(1)));
        assert_eq!(record.remove("a"), None);
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_set_path_nested_map() {
        let mut record = Record::new();
        record.set_path(&FieldPath::parse("a.b.c"), Value::Int(1));

        let a = record.get("a").and_then(Value::as_map).unwrap();
        let b = a.get("b").and_then(Value::as_map).unwrap();
        assert_eq!(b.get("c"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_set_path_array_index() {
        let mut record = Record::new();
        record.set_path(&FieldPath::parse("tags.0"), Value::Str("new_tag1".into()));

        let tags = record.get("tags").and_then(Value::as_array).unwrap();
        assert_eq!(tags, &[Value::Str("new_tag1".into())]);
    }

    #[test]
    fn test_set_path_array_gap_padded_with_null() {
        let mut record = Record::new();
        record.set_path(&FieldPath::parse("xs.2"), Value::Int(7));

        let xs = record.get("xs").and_then(Value::as_array).unwrap();
        assert_eq!(xs, &[Value::Null, Value::Null, Value::Int(7)]);
    }

    #[test]
    fn test_set_path_reshapes_conflicting_node() {
        let mut record = Record::new();
        record.set("a", Value::Str("scalar".into()));
        record.set_path(&FieldPath::parse("a.b"), Value::Int(1));

        let a = record.get("a").and_then(Value::as_map).unwrap();
        assert_eq!(a.get("b"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_set_path_merges_into_existing_map() {
        let mut record = Record::new();
        record.set_path(&FieldPath::parse("nested.x"), Value::Int(1));
        record.set_path(&FieldPath::parse("nested.y"), Value::Int(2));

        let nested = record.get("nested").and_then(Value::as_map).unwrap();
        assert_eq!(nested.len(), 2);
        assert_eq!(nested.get("x"), Some(&Value::Int(1)));
        assert_eq!(nested.get("y"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_get_path() {
        let mut record = Record::new();
        record.set_path(&FieldPath::parse("a.b.0"), Value::Str("v".into()));

        assert_eq!(
            record.get_path(&FieldPath::parse("a.b.0")),
            Some(&Value::Str("v".into()))
        );
        assert_eq!(record.get_path(&FieldPath::parse("a.b.1")), None);
        assert_eq!(record.get_path(&FieldPath::parse("a.missing")), None);
    }

    #[test]
    fn test_pk_text() {
        assert_eq!(Value::Int(101).pk_text(), "101");
        assert_eq!(Value::Str("fred".into()).pk_text(), "fred");
        assert_eq!(Value::Bool(true).pk_text(), "true");
        assert_eq!(Value::Binary(vec![0xab, 0x01]).pk_text(), "ab01");
        assert_eq!(Value::Null.pk_text(), "");
    }

    #[test]
    fn test_value_type_names() {
        assert_eq!(Value::Int(1).type_name(), "int");
        assert_eq!(Value::Map(Record::new()).type_name(), "map");
        assert_eq!(Value::Array(vec![]).type_name(), "array");
    }
}
