//! # Gravity Record
//!
//! Canonical record model and wire codec for the Gravity data-products
//! platform.
//!
//! A [`Record`] is an ordered sequence of named [`Value`]s: the decoded,
//! typed representation of one event's payload. Values are a tagged variant
//! over the platform's leaf types plus nested maps and arrays, so partial
//! updates expressed as dotted paths (`"a.b.c"`, `"tags.0"`) always resolve
//! to a well-formed tree.
//!
//! The wire representation is pluggable behind [`RecordCodec`]; [`JsonCodec`]
//! is the default implementation.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod event;
pub mod path;
pub mod value;

pub use codec::{JsonCodec, RecordCodec};
pub use error::{RecordError, Result};
pub use event::{EventMethod, ProductEvent};
pub use path::{FieldPath, PathSegment, REMOVED_FIELDS};
pub use value::{Field, Record, Value};
