//! Dotted field paths for partial-update payloads.
//!
//! Keys like `"a.b.c"` address nested map fields; numeric segments like
//! `"tags.0"` address array elements. The reserved key `"$removedFields"`
//! is never a path; it stays a literal top-level field carrying the list
//! of deleted paths.

use serde::{Deserialize, Serialize};

/// Reserved top-level key marking deleted fields in a partial update.
pub const REMOVED_FIELDS: &str = "$removedFields";

/// One step of a field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSegment {
    /// A map field name.
    Field(String),
    /// An array index.
    Index(usize),
}

impl PathSegment {
    /// Returns the segment's textual form, for use as a record field name.
    #[must_use]
    pub fn as_field_name(&self) -> String {
        match self {
            PathSegment::Field(name) => name.clone(),
            PathSegment::Index(idx) => idx.to_string(),
        }
    }
}

/// A parsed dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl FieldPath {
    /// Parses a dotted key into path segments.
    ///
    /// Every all-digit segment becomes an array index; everything else is a
    /// field name. A key without dots yields a single field segment, so
    /// plain top-level keys round-trip unchanged. Empty segments (from
    /// leading, trailing, or doubled dots) are kept as empty field names;
    /// the decoder treats such input as a literal field.
    #[must_use]
    pub fn parse(key: &str) -> Self {
        let segments = key
            .split('.')
            .map(|segment| match segment.parse::<usize>() {
                Ok(idx) => PathSegment::Index(idx),
                Err(_) => PathSegment::Field(segment.to_string()),
            })
            .collect();
        Self {
            raw: key.to_string(),
            segments,
        }
    }

    /// The original dotted key.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The parsed segments.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Returns `true` if this path addresses below the top level.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.segments.len() > 1
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
