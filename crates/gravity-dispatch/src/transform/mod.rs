//! Script-driven record transformation.
//!
//! A [`Transformer`] executes a rule's handler against a decoded record:
//!
//! - `Identity` produces exactly one output equal to the input.
//! - `Script` evaluates a compiled rhai AST with the record and a small
//!   context (`event`, `product`, `pk`) in scope. The script returns a map
//!   (one record), an array of maps (fan-out), or unit (filter drop).
//!
//! Each transform worker owns its own `Transformer`; engines are never
//! shared across workers, so a slow script only stalls its own PK lane.
//! Scripts are sandboxed: no filesystem, network, or host state; the only
//! registered helpers are pure string/math/time functions.

mod abi;

pub use abi::{dynamic_to_value, map_to_record, record_to_map, value_to_dynamic};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gravity_record::Record;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};

use crate::error::{DispatchError, Result};
use crate::rule::{Handler, Rule};

/// Compiles a transform script.
///
/// # Errors
///
/// Returns `DispatchError::ScriptError` if the source does not parse.
pub fn compile_script(source: &str) -> Result<AST> {
    build_engine(Arc::new(Mutex::new(None)))
        .compile(source)
        .map_err(|e| DispatchError::ScriptError(e.to_string()))
}

/// Executes rule handlers with a per-worker script engine.
pub struct Transformer {
    engine: Engine,
    deadline: Arc<Mutex<Option<Instant>>>,
    timeout: Duration,
}

impl Transformer {
    /// Creates a transformer with the given per-invocation script budget.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let deadline = Arc::new(Mutex::new(None));
        let engine = build_engine(Arc::clone(&deadline));
        Self {
            engine,
            deadline,
            timeout,
        }
    }

    /// Applies a rule's handler to a decoded record, producing zero or more
    /// output records.
    ///
    /// # Errors
    ///
    /// Returns `ScriptTimeout` when the wall-clock budget is exceeded and
    /// `ScriptError` for evaluation failures or unusable return values.
    pub fn transform(&self, rule: &Rule, record: Record) -> Result<Vec<Record>> {
        match &rule.handler {
            Handler::Identity => Ok(vec![record]),
            Handler::Script { ast, .. } => self.run_script(rule, ast, record),
        }
    }

    fn run_script(&self, rule: &Rule, ast: &AST, record: Record) -> Result<Vec<Record>> {
        let mut scope = Scope::new();
        scope.push_dynamic("record", Dynamic::from_map(record_to_map(&record)));
        scope.push_dynamic("ctx", Dynamic::from_map(context_map(rule)));

        *self.deadline.lock() = Some(Instant::now() + self.timeout);
        let result = self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, ast);
        *self.deadline.lock() = None;

        let output = result.map_err(|err| match *err {
            EvalAltResult::ErrorTerminated(..) => DispatchError::ScriptTimeout(self.timeout),
            other => DispatchError::ScriptError(other.to_string()),
        })?;

        collect_outputs(output)
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builds the sandboxed engine: resource limits, wall-clock termination,
/// and the pure helper functions scripts may call.
fn build_engine(deadline: Arc<Mutex<Option<Instant>>>) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(64);
    engine.set_max_string_size(1_048_576);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(10_000);

    engine.on_progress(move |_ops| {
        let expired = deadline
            .lock()
            .is_some_and(|limit| Instant::now() >= limit);
        expired.then(|| Dynamic::from("wall-clock budget exceeded"))
    });

    engine.register_fn("timestamp", || Utc::now().timestamp_millis());
    engine.register_fn("now", Utc::now);
    engine.register_fn("to_rfc3339", |t: DateTime<Utc>| t.to_rfc3339());
    engine.register_fn("epoch_millis", |t: DateTime<Utc>| t.timestamp_millis());
    engine.register_fn("parse_rfc3339", |s: &str| -> Dynamic {
        match DateTime::parse_from_rfc3339(s) {
            Ok(t) => Dynamic::from(t.with_timezone(&Utc)),
            Err(_) => Dynamic::UNIT,
        }
    });

    engine
}

fn context_map(rule: &Rule) -> rhai::Map {
    let pk: rhai::Array = rule
        .primary_key
        .iter()
        .map(|field| Dynamic::from(field.clone()))
        .collect();

    let mut map = rhai::Map::new();
    map.insert("event".into(), Dynamic::from(rule.event.clone()));
    map.insert("product".into(), Dynamic::from(rule.product.clone()));
    map.insert("pk".into(), Dynamic::from_array(pk));
    map
}

/// Interprets a script's return value: unit drops, a map is one record, an
/// array of maps fans out.
fn collect_outputs(output: Dynamic) -> Result<Vec<Record>> {
    if output.is_unit() {
        return Ok(Vec::new());
    }
    if output.is_map() {
        let map = output
            .try_cast::<rhai::Map>()
            .ok_or_else(|| DispatchError::ScriptError("map cast failed".into()))?;
        return Ok(vec![map_to_record(map)]);
    }
    if output.is_array() {
        let items = output
            .try_cast::<rhai::Array>()
            .ok_or_else(|| DispatchError::ScriptError("array cast failed".into()))?;
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let map = item.try_cast::<rhai::Map>().ok_or_else(|| {
                DispatchError::ScriptError(
                    "fan-out array elements must be maps".into(),
                )
            })?;
            records.push(map_to_record(map));
        }
        return Ok(records);
    }
    Err(DispatchError::ScriptError(format!(
        "script must return a map, an array of maps, or unit, got {}",
        output.type_name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use gravity_record::{EventMethod, Value};
    use serde_json::json;

    fn script_rule(source: &str) -> Rule {
        let schema = Schema::parse(&json!({
            "id": {"type": "int"},
            "name": {"type": "string"},
        }))
        .unwrap();
        Rule::new(
            "TestDataProduct",
            "dataCreated",
            EventMethod::Create,
            vec!["id".into()],
            schema,
        )
        .unwrap()
        .with_handler(Handler::script(source).unwrap())
    }

    fn input_record() -> Record {
        let mut record = Record::new();
        record.set("id", Value::Int(7));
        record.set("name", Value::Str("fred".into()));
        record
    }

    #[test]
    fn test_identity_passes_record_through() {
        let rule = script_rule("record"); // handler replaced below
        let rule = rule.with_handler(Handler::Identity);
        let transformer = Transformer::new(Duration::from_millis(500));

        let outputs = transformer.transform(&rule, input_record()).unwrap();
        assert_eq!(outputs, vec![input_record()]);
    }

    #[test]
    fn test_script_returning_record() {
        let rule = script_rule("record");
        let transformer = Transformer::new(Duration::from_millis(500));

        let outputs = transformer.transform(&rule, input_record()).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].get("id"), Some(&Value::Int(7)));
        assert_eq!(outputs[0].get("name"), Some(&Value::Str("fred".into())));
    }

    #[test]
    fn test_script_modifies_fields() {
        let rule = script_rule(r#"record.name = "updated"; record.score = 3; record"#);
        let transformer = Transformer::new(Duration::from_millis(500));

        let outputs = transformer.transform(&rule, input_record()).unwrap();
        assert_eq!(outputs[0].get("name"), Some(&Value::Str("updated".into())));
        assert_eq!(outputs[0].get("score"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_script_filter_drop() {
        let rule = script_rule("if record.id > 5 { () } else { record }");
        let transformer = Transformer::new(Duration::from_millis(500));

        let outputs = transformer.transform(&rule, input_record()).unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_script_fan_out() {
        let rule = script_rule(
            r#"
            let left = record;
            let right = #{ id: record.id + 1, name: record.name };
            [left, right]
            "#,
        );
        let transformer = Transformer::new(Duration::from_millis(500));

        let outputs = transformer.transform(&rule, input_record()).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].get("id"), Some(&Value::Int(7)));
        assert_eq!(outputs[1].get("id"), Some(&Value::Int(8)));
    }

    #[test]
    fn test_script_sees_context() {
        let rule = script_rule("record.origin = ctx.product + \"/\" + ctx.event; record");
        let transformer = Transformer::new(Duration::from_millis(500));

        let outputs = transformer.transform(&rule, input_record()).unwrap();
        assert_eq!(
            outputs[0].get("origin"),
            Some(&Value::Str("TestDataProduct/dataCreated".into()))
        );
    }

    #[test]
    fn test_script_timeout() {
        let rule = script_rule("while true { }");
        let transformer = Transformer::new(Duration::from_millis(20));

        let err = transformer.transform(&rule, input_record()).unwrap_err();
        assert!(matches!(err, DispatchError::ScriptTimeout(_)));
    }

    #[test]
    fn test_runtime_usable_after_timeout() {
        let transformer = Transformer::new(Duration::from_millis(20));

        let looping = script_rule("while true { }");
        assert!(transformer.transform(&looping, input_record()).is_err());

        let fine = script_rule("record");
        let outputs = transformer.transform(&fine, input_record()).unwrap();
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn test_script_error() {
        let rule = script_rule("record.no_such_fn()");
        let transformer = Transformer::new(Duration::from_millis(500));

        let err = transformer.transform(&rule, input_record()).unwrap_err();
        assert!(matches!(err, DispatchError::ScriptError(_)));
    }

    #[test]
    fn test_script_bad_return_type() {
        let rule = script_rule("42");
        let transformer = Transformer::new(Duration::from_millis(500));

        let err = transformer.transform(&rule, input_record()).unwrap_err();
        assert!(matches!(err, DispatchError::ScriptError(_)));
    }

    #[test]
    fn test_fan_out_rejects_non_map_elements() {
        let rule = script_rule("[record, 1]");
        let transformer = Transformer::new(Duration::from_millis(500));

        let err = transformer.transform(&rule, input_record()).unwrap_err();
        assert!(matches!(err, DispatchError::ScriptError(_)));
    }

    #[test]
    fn test_time_helpers_available() {
        let rule = script_rule("record.ts = timestamp(); record");
        let transformer = Transformer::new(Duration::from_millis(500));

        let outputs = transformer.transform(&rule, input_record()).unwrap();
        assert!(matches!(outputs[0].get("ts"), Some(Value::Int(ms)) if *ms > 0));
    }
}
