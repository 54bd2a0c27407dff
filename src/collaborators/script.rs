//! Sandboxed script evaluation with Rhai.
//!
//! Scripts see two read-only constants, `activity` (the snapshot object)
//! and `vars` (process-level variables). The value of the last expression
//! is the result. Evaluation is cut off once the time budget is spent.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use tracing::debug;

use super::ScriptEvaluator;
use crate::error::{Error, Result};

/// Extra wall-clock allowance before the async side gives up on the
/// blocking task.
const JOIN_GRACE: Duration = Duration::from_millis(250);

pub struct RhaiScriptEvaluator;

impl RhaiScriptEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn create_engine(deadline: Instant) -> Engine {
        let mut engine = Engine::new();

        engine.register_fn("to_json", |v: Dynamic| -> String {
            serde_json::to_string(&dynamic_to_json(v)).unwrap_or_default()
        });
        engine.register_fn("from_json", |s: &str| -> Dynamic {
            serde_json::from_str::<Value>(s)
                .map(json_to_dynamic)
                .unwrap_or(Dynamic::UNIT)
        });

        engine.on_progress(move |_| {
            if Instant::now() >= deadline {
                Some(Dynamic::from("time budget exceeded"))
            } else {
                None
            }
        });

        engine
    }
}

impl Default for RhaiScriptEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn run_script(
    script: &str,
    activity: Value,
    vars: HashMap<String, String>,
    deadline: Instant,
) -> Result<Value> {
    let engine = RhaiScriptEvaluator::create_engine(deadline);
    let mut scope = Scope::new();
    scope.push_constant("activity", json_to_dynamic(activity));

    let mut vars_map = rhai::Map::new();
    for (key, value) in vars {
        vars_map.insert(key.into(), Dynamic::from(value));
    }
    scope.push_constant("vars", vars_map);

    match engine.eval_with_scope::<Dynamic>(&mut scope, script) {
        Ok(result) => Ok(dynamic_to_json(result)),
        Err(err) => match *err {
            EvalAltResult::ErrorTerminated(..) => {
                Err(Error::Timeout("Script exceeded its time budget".to_string()))
            }
            other => Err(Error::Step(format!("Script error: {}", other))),
        },
    }
}

#[async_trait]
impl ScriptEvaluator for RhaiScriptEvaluator {
    async fn evaluate(
        &self,
        script: &str,
        activity: Value,
        vars: HashMap<String, String>,
        budget: Duration,
    ) -> Result<Value> {
        debug!(budget_ms = budget.as_millis() as u64, "Evaluating script");

        let deadline = Instant::now() + budget;
        let script = script.to_string();
        let handle =
            tokio::task::spawn_blocking(move || run_script(&script, activity, vars, deadline));

        match tokio::time::timeout(budget + JOIN_GRACE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::Internal(format!("Script task failed: {}", join_err))),
            Err(_) => Err(Error::Timeout("Script exceeded its time budget".to_string())),
        }
    }
}

/// Convert rhai::Dynamic to serde_json::Value
pub(crate) fn dynamic_to_json(v: Dynamic) -> Value {
    if v.is_unit() {
        Value::Null
    } else if v.is_bool() {
        Value::Bool(v.as_bool().unwrap_or(false))
    } else if v.is_int() {
        serde_json::json!(v.as_int().unwrap_or(0))
    } else if v.is_float() {
        serde_json::json!(v.as_float().unwrap_or(0.0))
    } else if v.is_string() {
        Value::String(v.into_string().unwrap_or_default())
    } else if v.is_array() {
        match v.into_array() {
            Ok(arr) => Value::Array(arr.into_iter().map(dynamic_to_json).collect()),
            Err(_) => Value::Null,
        }
    } else if v.is_map() {
        match v.try_cast::<rhai::Map>() {
            Some(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                    .collect(),
            ),
            None => Value::Null,
        }
    } else {
        Value::String(v.to_string())
    }
}

/// Convert serde_json::Value to rhai::Dynamic
pub(crate) fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => Dynamic::from(arr.into_iter().map(json_to_dynamic).collect::<Vec<_>>()),
        Value::Object(obj) => {
            let mut map = rhai::Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}
