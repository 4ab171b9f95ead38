//! Product schema: a recursive type tree parsed from configuration.
//!
//! A schema is a mapping `fieldName → {type, fields?, subtype?, precision?}`.
//! Leaf types are `int | uint | float | string | bool | time | binary | any`;
//! composites are `map` (with `fields`) and `array` (with `subtype`).
//! Unknown option keys are ignored; an unknown type name rejects the schema.
//!
//! Decoding (see [`decode`]) is by structural coercion: values are coerced
//! where unambiguous, and irrecoverably mismatched fields are dropped with a
//! warning rather than failing the message.

mod decode;

pub use decode::{DecodedRecord, FieldWarning};

use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use crate::error::{DispatchError, Result};

/// The type of a schema node.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaType {
    /// Signed 64-bit integer.
    Int,
    /// Unsigned 64-bit integer.
    UInt,
    /// 64-bit float.
    Float,
    /// UTF-8 string.
    String,
    /// Boolean.
    Bool,
    /// Timestamp; accepts RFC 3339 strings or integer epochs.
    Time,
    /// Opaque bytes; accepts base64 strings or byte arrays.
    Binary,
    /// Schema-less passthrough.
    Any,
    /// Nested object with its own field schema.
    Map(Schema),
    /// Homogeneous list.
    Array(Box<SchemaNode>),
}

impl SchemaType {
    /// The configuration name of this type.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SchemaType::Int => "int",
            SchemaType::UInt => "uint",
            SchemaType::Float => "float",
            SchemaType::String => "string",
            SchemaType::Bool => "bool",
            SchemaType::Time => "time",
            SchemaType::Binary => "binary",
            SchemaType::Any => "any",
            SchemaType::Map(_) => "map",
            SchemaType::Array(_) => "array",
        }
    }
}

/// One node of the schema tree: a type plus optional format hints.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaNode {
    /// The node's type.
    pub kind: SchemaType,
    /// Optional precision/format hint (carried through, not enforced).
    pub precision: Option<String>,
}

impl SchemaNode {
    fn new(kind: SchemaType) -> Self {
        Self {
            kind,
            precision: None,
        }
    }
}

/// An ordered field schema.
///
/// Field order follows the configuration object's declaration order (the
/// config parser preserves JSON object order), and full records are emitted
/// in this order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<(String, SchemaNode)>,
    index: FxHashMap<String, usize>,
}

impl Schema {
    /// Parses a schema from its JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::BadSchema` if the config is not an object,
    /// a field definition is malformed, or a type name is unknown.
    pub fn parse(config: &Json) -> Result<Self> {
        let object = config
            .as_object()
            .ok_or_else(|| DispatchError::BadSchema("schema config must be an object".into()))?;

        let mut schema = Schema::default();
        for (name, definition) in object {
            let node = parse_node(name, definition)?;
            schema.push(name.clone(), node);
        }
        Ok(schema)
    }

    fn push(&mut self, name: String, node: SchemaNode) {
        self.index.insert(name.clone(), self.fields.len());
        self.fields.push((name, node));
    }

    /// Returns the node for a top-level field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SchemaNode> {
        self.index.get(name).map(|&i| &self.fields[i].1)
    }

    /// Returns `true` if the schema declares the field.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterates fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &SchemaNode)> {
        self.fields.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Number of declared fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if no fields are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Parses one field definition.
///
/// Accepts either an object `{type, …}` or a bare type-name string (the
/// shorthand used by `array` subtypes).
fn parse_node(field: &str, definition: &Json) -> Result<SchemaNode> {
    if let Some(type_name) = definition.as_str() {
        return leaf_type(field, type_name).map(SchemaNode::new);
    }

    let object = definition.as_object().ok_or_else(|| {
        DispatchError::BadSchema(format!("field '{field}': definition must be an object"))
    })?;

    let type_name = object
        .get("type")
        .and_then(Json::as_str)
        .ok_or_else(|| DispatchError::BadSchema(format!("field '{field}': missing type")))?;

    let kind = match type_name {
        "map" => {
            let fields = object.get("fields").ok_or_else(|| {
                DispatchError::BadSchema(format!("field '{field}': map requires 'fields'"))
            })?;
            SchemaType::Map(Schema::parse(fields)?)
        }
        "array" => {
            let subtype = object.get("subtype").ok_or_else(|| {
                DispatchError::BadSchema(format!("field '{field}': array requires 'subtype'"))
            })?;
            SchemaType::Array(Box::new(parse_node(field, subtype)?))
        }
        other => leaf_type(field, other)?,
    };

    let precision = object
        .get("precision")
        .and_then(Json::as_str)
        .map(str::to_string);

    Ok(SchemaNode { kind, precision })
}

fn leaf_type(field: &str, name: &str) -> Result<SchemaType> {
    match name {
        "int" => Ok(SchemaType::Int),
        "uint" => Ok(SchemaType::UInt),
        "float" => Ok(SchemaType::Float),
        "string" => Ok(SchemaType::String),
        "bool" => Ok(SchemaType::Bool),
        "time" => Ok(SchemaType::Time),
        "binary" => Ok(SchemaType::Binary),
        "any" => Ok(SchemaType::Any),
        other => Err(DispatchError::BadSchema(format!(
            "field '{field}': unknown type '{other}'"
        ))),
    }
}
