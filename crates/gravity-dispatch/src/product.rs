//! Product settings: the configuration-store representation of a data
//! product and its event rules.
//!
//! Settings arrive as JSON from the watched KV store and are compiled into
//! runtime [`Rule`]s (schemas parsed, scripts compiled, invariants
//! checked) before they reach the rule index.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use gravity_record::EventMethod;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::rule::{Handler, Rule};
use crate::schema::Schema;

/// Validates a product name as a bus-legal identifier: letters, digits,
/// `-`, `_`, and `.`.
///
/// # Errors
///
/// Returns `DispatchError::Config` for an empty or illegal name.
pub fn validate_product_name(name: &str) -> Result<()> {
    let legal = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if legal {
        Ok(())
    } else {
        Err(DispatchError::Config(format!(
            "invalid product name '{name}'"
        )))
    }
}

/// A product's full configuration as stored in the config store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductSetting {
    /// Product name (store key; bus-legal identifier).
    pub name: String,

    /// Free-form description.
    #[serde(default)]
    pub description: String,

    /// Disabled products are treated as absent by the dispatcher.
    #[serde(default)]
    pub enabled: bool,

    /// Product-level schema; rules without their own schema inherit it.
    #[serde(default)]
    pub schema: Option<serde_json::Value>,

    /// Per-event rules.
    #[serde(default)]
    pub rules: Vec<RuleSetting>,

    /// Name of the product's durable output stream.
    #[serde(default)]
    pub stream: String,

    /// Inbound subscription binding.
    #[serde(default)]
    pub subscription: SubscriptionSetting,

    /// Creation timestamp (maintained by the control plane).
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    /// Last-update timestamp (maintained by the control plane).
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The product's inbound subject binding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionSetting {
    /// Subject the product consumes raw events from.
    #[serde(default)]
    pub subject: String,

    /// Optional upstream stream to source the subject from.
    #[serde(default)]
    pub stream_source: Option<String>,
}

/// One event rule inside a product setting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSetting {
    /// Event name (unique within the product).
    pub event: String,

    /// Owning product; filled from the setting when omitted.
    #[serde(default)]
    pub product: String,

    /// Change kind.
    #[serde(default)]
    pub method: EventMethod,

    /// Primary-key field names.
    #[serde(default)]
    pub pk: Vec<String>,

    /// Rule-level schema; falls back to the product schema.
    #[serde(default)]
    pub schema: Option<serde_json::Value>,

    /// Output column restriction; absent keeps all fields.
    #[serde(default)]
    pub enabled_columns: Option<Vec<String>>,

    /// Transform handler.
    #[serde(default)]
    pub handler: Option<HandlerSetting>,

    /// Optional per-rule subscription override.
    #[serde(default)]
    pub subscription: Option<SubscriptionSetting>,
}

/// Handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerSetting {
    /// Handler kind.
    #[serde(rename = "type")]
    pub kind: HandlerType,

    /// Script source for `type = "script"`.
    #[serde(default)]
    pub script: Option<String>,
}

/// Handler kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerType {
    /// Pass-through.
    None,
    /// Inline transform script.
    Script,
}

impl ProductSetting {
    /// Parses a setting from its stored JSON form.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Config` for malformed JSON or an illegal
    /// product name.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let setting: ProductSetting = serde_json::from_slice(data)
            .map_err(|e| DispatchError::Config(format!("bad product setting: {e}")))?;
        validate_product_name(&setting.name)?;
        Ok(setting)
    }

    /// Compiles the setting's rules into runtime rules.
    ///
    /// # Errors
    ///
    /// Returns the first schema, script, or invariant error. A rule with
    /// neither its own schema nor a product schema is rejected.
    pub fn build_rules(&self) -> Result<Vec<Rule>> {
        validate_product_name(&self.name)?;

        let mut rules = Vec::with_capacity(self.rules.len());
        for setting in &self.rules {
            let schema_config = setting
                .schema
                .as_ref()
                .or(self.schema.as_ref())
                .ok_or_else(|| {
                    DispatchError::Config(format!(
                        "rule '{}/{}': no schema configured",
                        self.name, setting.event
                    ))
                })?;
            let schema = Schema::parse(schema_config)?;

            let handler = match &setting.handler {
                None
                | Some(HandlerSetting {
                    kind: HandlerType::None,
                    ..
                }) => Handler::Identity,
                Some(HandlerSetting {
                    kind: HandlerType::Script,
                    script,
                }) => {
                    let source = script.as_deref().ok_or_else(|| {
                        DispatchError::Config(format!(
                            "rule '{}/{}': script handler without script",
                            self.name, setting.event
                        ))
                    })?;
                    Handler::script(source)?
                }
            };

            let mut rule = Rule::new(
                self.name.clone(),
                setting.event.clone(),
                setting.method,
                setting.pk.clone(),
                schema,
            )?
            .with_handler(handler);

            if let Some(columns) = &setting.enabled_columns {
                rule = rule
                    .with_enabled_columns(columns.iter().cloned().collect::<HashSet<_>>())?;
            }
            rule.subject = setting
                .subscription
                .as_ref()
                .map(|s| s.subject.clone())
                .filter(|s| !s.is_empty());

            rules.push(rule);
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_setting() -> serde_json::Value {
        json!({
            "name": "TestDataProduct",
            "enabled": true,
            "schema": {
                "id": {"type": "int"},
                "name": {"type": "string"},
            },
            "rules": [
                {
                    "event": "dataCreated",
                    "method": "create",
                    "pk": ["id"],
                },
                {
                    "event": "dataDeleted",
                    "method": "delete",
                    "pk": ["id"],
                    "schema": {"id": {"type": "int"}},
                    "handler": {"type": "script", "script": "record"},
                },
            ],
            "stream": "GVT_default_DP_TestDataProduct",
            "subscription": {"subject": "ingress.test.>"},
        })
    }

    #[test]
    fn test_validate_product_name() {
        assert!(validate_product_name("Test-Data.Product_1").is_ok());
        assert!(validate_product_name("").is_err());
        assert!(validate_product_name("has space").is_err());
        assert!(validate_product_name("star*").is_err());
    }

    #[test]
    fn test_setting_round_trip() {
        let data = serde_json::to_vec(&sample_setting()).unwrap();
        let setting = ProductSetting::from_bytes(&data).unwrap();

        assert_eq!(setting.name, "TestDataProduct");
        assert!(setting.enabled);
        assert_eq!(setting.rules.len(), 2);
        assert_eq!(setting.subscription.subject, "ingress.test.>");
    }

    #[test]
    fn test_from_bytes_rejects_bad_name() {
        let data = serde_json::to_vec(&json!({"name": "no way"})).unwrap();
        assert!(ProductSetting::from_bytes(&data).is_err());
    }

    #[test]
    fn test_build_rules_inherits_product_schema() {
        let data = serde_json::to_vec(&sample_setting()).unwrap();
        let setting = ProductSetting::from_bytes(&data).unwrap();
        let rules = setting.build_rules().unwrap();

        assert_eq!(rules.len(), 2);
        // First rule inherits the product schema.
        assert!(rules[0].schema.contains("name"));
        // Second rule brings its own narrower schema.
        assert!(!rules[1].schema.contains("name"));
        assert!(matches!(rules[1].handler, Handler::Script { .. }));
    }

    #[test]
    fn test_build_rules_requires_some_schema() {
        let setting = ProductSetting {
            name: "p".into(),
            rules: vec![RuleSetting {
                event: "e".into(),
                ..RuleSetting::default()
            }],
            ..ProductSetting::default()
        };
        let err = setting.build_rules().unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn test_build_rules_rejects_script_without_source() {
        let setting = ProductSetting {
            name: "p".into(),
            schema: Some(json!({"id": {"type": "int"}})),
            rules: vec![RuleSetting {
                event: "e".into(),
                handler: Some(HandlerSetting {
                    kind: HandlerType::Script,
                    script: None,
                }),
                ..RuleSetting::default()
            }],
            ..ProductSetting::default()
        };
        let err = setting.build_rules().unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn test_handler_type_serde() {
        let handler: HandlerSetting =
            serde_json::from_value(json!({"type": "none"})).unwrap();
        assert_eq!(handler.kind, HandlerType::None);

        let handler: HandlerSetting =
            serde_json::from_value(json!({"type": "script", "script": "record"})).unwrap();
        assert_eq!(handler.kind, HandlerType::Script);
    }
}
