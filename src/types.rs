use crate::error::{PipelineError, Result};
use crate::tools::ToolCall;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Input values keyed by field name.
pub type Inputs = Map<String, Value>;

/// Turn a JSON object literal into [`Inputs`].
///
/// ```
/// use serde_json::json;
/// use signature_pipeline::types::inputs;
///
/// let inputs = inputs(json!({"question": "2+2?"})).unwrap();
/// assert_eq!(inputs["question"], "2+2?");
/// assert!(signature_pipeline::types::inputs(json!([1])).is_err());
/// ```
pub fn inputs(value: Value) -> Result<Inputs> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(PipelineError::Other(format!(
            "inputs must be a JSON object, got {}",
            crate::output_parser::json_type_name(&other)
        ))),
    }
}

/// A few-shot demonstration: example inputs paired with example outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Demo {
    pub inputs: Inputs,
    pub outputs: Inputs,
}

impl Demo {
    pub fn new(inputs: Inputs, outputs: Inputs) -> Self {
        Self { inputs, outputs }
    }

    /// Build a demo from two JSON object literals.
    pub fn from_json(inputs: Value, outputs: Value) -> Result<Self> {
        Ok(Self {
            inputs: self::inputs(inputs)?,
            outputs: self::inputs(outputs)?,
        })
    }
}

/// One typed output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    ToolCalls(Vec<ToolCall>),
    Json(Value),
}

impl FieldValue {
    /// Plain JSON view of the value.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Integer(n) => Value::from(*n),
            FieldValue::Float(f) => Value::from(*f),
            FieldValue::Boolean(b) => Value::Bool(*b),
            FieldValue::ToolCalls(calls) => {
                Value::Array(calls.iter().map(ToolCall::to_json).collect())
            }
            FieldValue::Json(v) => v.clone(),
        }
    }
}

/// Parsed outputs of one invocation, in signature order.
///
/// Optional fields the model omitted are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Outputs {
    values: IndexMap<String, FieldValue>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Float view; integers widen.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.values.get(name)? {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name)? {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn get_json(&self, name: &str) -> Option<&Value> {
        match self.values.get(name)? {
            FieldValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn tool_calls(&self, name: &str) -> Option<&[ToolCall]> {
        match self.values.get(name)? {
            FieldValue::ToolCalls(calls) => Some(calls),
            _ => None,
        }
    }

    /// Deserialize a field into a concrete type.
    ///
    /// Typically used with a field declared via
    /// [`Field::typed`](crate::signature::Field::typed).
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| PipelineError::Other(format!("no output named '{name}'")))?;
        Ok(serde_json::from_value(value.to_json())?)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Plain JSON object view, in field order.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outputs_keep_insertion_order() {
        let mut out = Outputs::new();
        out.insert("b", FieldValue::Integer(1));
        out.insert("a", FieldValue::String("x".into()));
        let keys: Vec<_> = out.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(out.to_json().to_string(), r#"{"b":1,"a":"x"}"#);
    }

    #[test]
    fn test_typed_getters() {
        let mut out = Outputs::new();
        out.insert("n", FieldValue::Integer(3));
        out.insert("ok", FieldValue::Boolean(true));
        assert_eq!(out.get_i64("n"), Some(3));
        assert_eq!(out.get_f64("n"), Some(3.0));
        assert_eq!(out.get_bool("ok"), Some(true));
        assert_eq!(out.get_str("n"), None);
        assert!(out.get("missing").is_none());
    }

    #[derive(Deserialize, Debug, PartialEq)]
    struct Plan {
        steps: Vec<String>,
    }

    #[test]
    fn test_get_as_deserializes() {
        let mut out = Outputs::new();
        out.insert("plan", FieldValue::Json(json!({"steps": ["a", "b"]})));
        let plan: Plan = out.get_as("plan").unwrap();
        assert_eq!(plan.steps, vec!["a", "b"]);
        assert!(out.get_as::<Plan>("other").is_err());
    }

    #[test]
    fn test_demo_from_json_requires_objects() {
        assert!(Demo::from_json(json!({"q": 1}), json!({"a": 2})).is_ok());
        assert!(Demo::from_json(json!("q"), json!({})).is_err());
    }
}
