//! Service catalog of deterministic implementations.
//!
//! The router consults the catalog to decide whether a deterministic task
//! can go to a Worker; the worker adapter calls what it finds there.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::core::task::Values;
use crate::util::value_text;

/// A pure function registered under a capability name.
pub trait DeterministicImplementation: Send + Sync {
    /// Compute a value from bound inputs. A single-output task receives the
    /// value as that output; otherwise it must be an object keyed by output.
    fn invoke(&self, inputs: &Values) -> std::result::Result<Value, String>;
}

impl<F> DeterministicImplementation for F
where
    F: Fn(&Values) -> std::result::Result<Value, String> + Send + Sync,
{
    fn invoke(&self, inputs: &Values) -> std::result::Result<Value, String> {
        self(inputs)
    }
}

pub trait ServiceCatalog: Send + Sync {
    fn lookup(&self, capability: &str) -> Option<Arc<dyn DeterministicImplementation>>;
}

/// In-memory catalog.
#[derive(Clone, Default)]
pub struct StaticCatalog {
    entries: BTreeMap<String, Arc<dyn DeterministicImplementation>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with `identity`, `concat`, `uppercase`, `count`
    /// and `merge`.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register("identity", identity);
        catalog.register("concat", concat);
        catalog.register("uppercase", uppercase);
        catalog.register("count", count);
        catalog.register("merge", merge);
        catalog
    }

    pub fn register<I>(&mut self, capability: impl Into<String>, implementation: I)
    where
        I: DeterministicImplementation + 'static,
    {
        self.entries
            .insert(capability.into(), Arc::new(implementation));
    }

    pub fn capabilities(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

impl ServiceCatalog for StaticCatalog {
    fn lookup(&self, capability: &str) -> Option<Arc<dyn DeterministicImplementation>> {
        self.entries.get(capability).cloned()
    }
}

impl std::fmt::Debug for StaticCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCatalog")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

fn single(inputs: &Values) -> std::result::Result<&Value, String> {
    let mut values = inputs.values();
    match (values.next(), values.next()) {
        (Some(v), None) => Ok(v),
        _ => Err(format!("expected exactly one input, got {}", inputs.len())),
    }
}

fn identity(inputs: &Values) -> std::result::Result<Value, String> {
    match single(inputs) {
        Ok(v) => Ok(v.clone()),
        Err(_) => Ok(Value::Object(
            inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        )),
    }
}

/// Joins inputs in name order; an input named `separator` sets the glue.
fn concat(inputs: &Values) -> std::result::Result<Value, String> {
    let separator = inputs.get("separator").map(value_text).unwrap_or_default();
    let parts: Vec<String> = inputs
        .iter()
        .filter(|(k, _)| k.as_str() != "separator")
        .map(|(_, v)| value_text(v))
        .collect();
    Ok(Value::String(parts.join(&separator)))
}

fn uppercase(inputs: &Values) -> std::result::Result<Value, String> {
    match single(inputs)? {
        Value::String(s) => Ok(Value::String(s.to_uppercase())),
        other => Err(format!("uppercase expects a string, got {}", other)),
    }
}

fn count(inputs: &Values) -> std::result::Result<Value, String> {
    let n = match single(inputs)? {
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        Value::String(s) => s.chars().count(),
        Value::Null => 0,
        other => return Err(format!("count cannot measure {}", other)),
    };
    Ok(Value::from(n))
}

/// Shallow merge of object inputs; later names win.
fn merge(inputs: &Values) -> std::result::Result<Value, String> {
    let mut merged = serde_json::Map::new();
    for (name, value) in inputs {
        match value {
            Value::Object(map) => merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone()))),
            _ => return Err(format!("merge input '{}' is not an object", name)),
        }
    }
    Ok(Value::Object(merged))
}
