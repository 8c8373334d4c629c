use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value bag threaded through one pipeline run.
///
/// Normalizers mutate it in place; validators and the handler read it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationContext {
  values: Map<String, Value>,
}

impl OperationContext {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build from a JSON object; anything else yields None.
  pub fn from_value(value: Value) -> Option<Self> {
    match value {
      Value::Object(values) => Some(Self { values }),
      Value::Null => Some(Self::default()),
      _ => None,
    }
  }

  /// Typed read; None when missing or of the wrong shape.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self
      .values
      .get(key)
      .and_then(|v| serde_json::from_value(v.clone()).ok())
  }

  pub fn get_value(&self, key: &str) -> Option<&Value> {
    self.values.get(key)
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.values.get(key).and_then(Value::as_str)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.values.contains_key(key)
  }

  pub fn set(&mut self, key: impl Into<String>, value: Value) {
    self.values.insert(key.into(), value);
  }

  pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), serde_json::Error> {
    let value = serde_json::to_value(value)?;
    self.values.insert(key.into(), value);
    Ok(())
  }

  /// Builder-style `set`
  pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
    self.set(key, value);
    self
  }

  pub fn remove(&mut self, key: &str) -> Option<Value> {
    self.values.remove(key)
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn into_value(self) -> Value {
    Value::Object(self.values)
  }
}
