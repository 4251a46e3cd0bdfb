use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{PreflightError, PreflightResult};

/// Ordered mapping of environment keys to JSON scalars.
///
/// Only strings, numbers, booleans and `null` are accepted; insertion order
/// is kept for display and serialization but plays no part in lookups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "IndexMap<String, Value>", into = "IndexMap<String, Value>")]
pub struct Environment {
    values: IndexMap<String, Value>,
}

/// Name of the JSON kind of `value`, used in error messages
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn ensure_scalar(key: &str, value: &Value) -> PreflightResult<()> {
    match value {
        Value::Array(_) | Value::Object(_) => Err(PreflightError::InvalidValueKind {
            key: key.to_string(),
            kind: value_kind(value).to_string(),
        }),
        _ => Ok(()),
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object; nested values are rejected
    pub fn from_json(value: Value) -> PreflightResult<Self> {
        match value {
            Value::Object(map) => {
                let mut environment = Environment::new();
                for (key, value) in map {
                    environment.insert(key, value)?;
                }
                Ok(environment)
            }
            Value::Null => Ok(Environment::new()),
            other => Err(PreflightError::InvalidValueKind {
                key: String::new(),
                kind: value_kind(&other).to_string(),
            }),
        }
    }

    /// Parse the text of an environment editor. Blank text is an empty environment.
    pub fn from_json_str(text: &str) -> PreflightResult<Self> {
        if text.trim().is_empty() {
            return Ok(Environment::new());
        }
        let value: Value = serde_json::from_str(text).map_err(|e| PreflightError::Config {
            message: format!("Invalid environment JSON: {}", e),
        })?;
        Self::from_json(value)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> PreflightResult<()> {
        let key = key.into();
        ensure_scalar(&key, &value)?;
        self.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl TryFrom<IndexMap<String, Value>> for Environment {
    type Error = PreflightError;

    fn try_from(values: IndexMap<String, Value>) -> Result<Self, Self::Error> {
        for (key, value) in &values {
            ensure_scalar(key, value)?;
        }
        Ok(Self { values })
    }
}

impl From<Environment> for IndexMap<String, Value> {
    fn from(environment: Environment) -> Self {
        environment.values
    }
}

/// Immutable, cheaply clonable view of an [`Environment`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentSnapshot(Arc<Environment>);

impl EnvironmentSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_environment(&self) -> &Environment {
        &self.0
    }
}

impl From<Environment> for EnvironmentSnapshot {
    fn from(environment: Environment) -> Self {
        Self(Arc::new(environment))
    }
}

/// Copy-on-write layer over a committed baseline.
///
/// Writes land in the overlay and are visible to later reads through this
/// store only. The baseline is never touched; the orchestrator decides
/// whether [`EnvironmentStore::into_environment`] becomes the next baseline.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentStore {
    baseline: EnvironmentSnapshot,
    /// `None` marks a removed key
    overlay: IndexMap<String, Option<Value>>,
}

impl EnvironmentStore {
    pub fn new(baseline: impl Into<EnvironmentSnapshot>) -> Self {
        Self {
            baseline: baseline.into(),
            overlay: IndexMap::new(),
        }
    }

    /// Current value of `key`, overlay first
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        match self.overlay.get(key) {
            Some(entry) => entry.as_ref(),
            None => self.baseline.get(key),
        }
    }

    /// Ordered view of baseline plus overlay.
    ///
    /// Keys keep their baseline position when overwritten; new keys follow
    /// in the order they were first set.
    pub fn get(&self) -> Environment {
        let mut values = IndexMap::new();
        for (key, value) in self.baseline.as_environment().iter() {
            match self.overlay.get(key) {
                Some(Some(updated)) => {
                    values.insert(key.clone(), updated.clone());
                }
                Some(None) => {}
                None => {
                    values.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, entry) in &self.overlay {
            if let Some(value) = entry
                && !values.contains_key(key)
            {
                values.insert(key.clone(), value.clone());
            }
        }
        Environment { values }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> PreflightResult<()> {
        let key = key.into();
        ensure_scalar(&key, &value)?;
        self.overlay.insert(key, Some(value));
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        if self.baseline.get(key).is_some() {
            self.overlay.insert(key.to_string(), None);
        } else {
            self.overlay.shift_remove(key);
        }
    }

    /// Apply every entry of `partial`; nothing is applied if any value is invalid
    pub fn merge(&mut self, partial: &Environment) -> PreflightResult<()> {
        for (key, value) in partial.iter() {
            ensure_scalar(key, value)?;
        }
        for (key, value) in partial.iter() {
            self.overlay.insert(key.clone(), Some(value.clone()));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> EnvironmentSnapshot {
        self.get().into()
    }

    pub fn baseline(&self) -> &EnvironmentSnapshot {
        &self.baseline
    }

    /// Whether the run wrote anything that differs from the baseline
    pub fn is_dirty(&self) -> bool {
        self.overlay.iter().any(|(key, entry)| match entry {
            Some(value) => self.baseline.get(key) != Some(value),
            None => self.baseline.get(key).is_some(),
        })
    }

    pub fn into_environment(self) -> Environment {
        self.get()
    }
}
