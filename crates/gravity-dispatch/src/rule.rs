//! Per-event transformation rules.
//!
//! A rule is the immutable contract for one `(product, event)` pair: the
//! input schema, the output shape (primary key, enabled columns), and the
//! optional transform script. Rules are built once (scripts compile at
//! construction) and shared behind `Arc` by the rule index and every
//! in-flight message that resolved them.

use std::collections::HashSet;
use std::sync::Arc;

use gravity_record::EventMethod;

use crate::error::{DispatchError, Result};
use crate::schema::Schema;
use crate::transform::compile_script;

/// The transform handler attached to a rule.
#[derive(Debug, Clone)]
pub enum Handler {
    /// Identity: one output record equal to the decoded input.
    Identity,
    /// A user script; compiled once, executed per message by the worker's
    /// own script runtime.
    Script {
        /// Original script source (for diagnostics and re-serialization).
        source: String,
        /// Compiled form shared across workers.
        ast: Arc<rhai::AST>,
    },
}

impl Handler {
    /// Compiles a script handler.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ScriptError` if the script does not parse.
    pub fn script(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let ast = compile_script(&source)?;
        Ok(Handler::Script {
            source,
            ast: Arc::new(ast),
        })
    }
}

/// The transformation contract for one `(product, event)` pair.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Owning product (the output table name).
    pub product: String,
    /// Event name this rule applies to.
    pub event: String,
    /// The change kind carried into output events.
    pub method: EventMethod,
    /// Primary-key field names, in PK order.
    pub primary_key: Vec<String>,
    /// Input schema.
    pub schema: Schema,
    /// Output columns to keep; `None` keeps every field.
    pub enabled_columns: Option<HashSet<String>>,
    /// The transform handler.
    pub handler: Handler,
    /// Optional per-rule inbound subject override (carried from settings;
    /// product-level subscription drives the actual binding).
    pub subject: Option<String>,
}

impl Rule {
    /// Creates an identity rule and validates its invariants.
    ///
    /// # Errors
    ///
    /// See [`Rule::validate`].
    pub fn new(
        product: impl Into<String>,
        event: impl Into<String>,
        method: EventMethod,
        primary_key: Vec<String>,
        schema: Schema,
    ) -> Result<Self> {
        let rule = Self {
            product: product.into(),
            event: event.into(),
            method,
            primary_key,
            schema,
            enabled_columns: None,
            handler: Handler::Identity,
            subject: None,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Replaces the enabled-column set.
    ///
    /// # Errors
    ///
    /// See [`Rule::validate`].
    pub fn with_enabled_columns(mut self, columns: HashSet<String>) -> Result<Self> {
        self.enabled_columns = Some(columns);
        self.validate()?;
        Ok(self)
    }

    /// Replaces the handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handler = handler;
        self
    }

    /// Checks rule invariants: every primary-key field and every enabled
    /// column must be declared in the schema.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Config` on the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.event.is_empty() {
            return Err(DispatchError::Config(format!(
                "product '{}': rule has no event name",
                self.product
            )));
        }
        for pk in &self.primary_key {
            if !self.schema.contains(pk) {
                return Err(DispatchError::Config(format!(
                    "rule '{}/{}': primary key field '{pk}' is not in the schema",
                    self.product, self.event
                )));
            }
        }
        if let Some(columns) = &self.enabled_columns {
            for column in columns {
                if !self.schema.contains(column) {
                    return Err(DispatchError::Config(format!(
                        "rule '{}/{}': enabled column '{column}' is not in the schema",
                        self.product, self.event
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns `true` when the field survives projection: enabled columns
    /// (all fields when unrestricted), primary-key fields, and the
    /// removed-fields marker.
    #[must_use]
    pub fn column_enabled(&self, name: &str) -> bool {
        if name == gravity_record::REMOVED_FIELDS {
            return true;
        }
        if self.primary_key.iter().any(|pk| pk == name) {
            return true;
        }
        match &self.enabled_columns {
            Some(columns) => columns.contains(name),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::parse(&json!({
            "id": {"type": "int"},
            "name": {"type": "string"},
        }))
        .unwrap()
    }

    #[test]
    fn test_rule_validates_pk_in_schema() {
        let err = Rule::new(
            "p",
            "e",
            EventMethod::Create,
            vec!["missing".into()],
            schema(),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_rule_validates_enabled_columns() {
        let rule = Rule::new("p", "e", EventMethod::Create, vec!["id".into()], schema()).unwrap();
        let err = rule
            .with_enabled_columns(["ghost".to_string()].into_iter().collect())
            .unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn test_column_enabled_defaults_to_all() {
        let rule = Rule::new("p", "e", EventMethod::Create, vec!["id".into()], schema()).unwrap();
        assert!(rule.column_enabled("id"));
        assert!(rule.column_enabled("name"));
        assert!(rule.column_enabled(gravity_record::REMOVED_FIELDS));
    }

    #[test]
    fn test_column_enabled_respects_restriction() {
        let rule = Rule::new("p", "e", EventMethod::Create, vec!["id".into()], schema())
            .unwrap()
            .with_enabled_columns(["name".to_string()].into_iter().collect())
            .unwrap();
        // PK and the removed-fields marker always survive.
        assert!(rule.column_enabled("id"));
        assert!(rule.column_enabled("name"));
        assert!(rule.column_enabled(gravity_record::REMOVED_FIELDS));
        assert!(!rule.column_enabled("other"));
    }

    #[test]
    fn test_script_handler_compiles() {
        let handler = Handler::script("record").unwrap();
        assert!(matches!(handler, Handler::Script { .. }));

        let err = Handler::script("fn {").unwrap_err();
        assert!(matches!(err, DispatchError::ScriptError(_)));
    }

    #[test]
    fn test_empty_event_rejected() {
        let err = Rule::new("p", "", EventMethod::Create, vec![], schema()).unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }
}
