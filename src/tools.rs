//! Tool declarations and structured tool calls.
//!
//! Declarations travel from a `tool_declarations` input field into
//! [`LmRequest::tools`](crate::backend::LmRequest); calls come back only from
//! the structured `tool_calls` of the LM response, never from text.

use crate::backend::LmResponse;
use crate::error::{PipelineError, Result};
use crate::output_parser::truncate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// One parameter of a declared tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    /// JSON Schema type name (`"string"`, `"integer"`, ...).
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: String::new(),
            required: false,
        }
    }

    pub fn desc(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// OpenAI function-calling wire shape.
    ///
    /// ```
    /// use signature_pipeline::tools::{ToolParameter, ToolSpec};
    ///
    /// let spec = ToolSpec::new("search", "Search the web")
    ///     .param(ToolParameter::new("query", "string").required());
    /// let wire = spec.to_wire();
    /// assert_eq!(wire["type"], "function");
    /// assert_eq!(wire["function"]["parameters"]["required"][0], "query");
    /// ```
    pub fn to_wire(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            let mut prop = Map::new();
            prop.insert("type".into(), Value::String(p.param_type.clone()));
            if !p.description.is_empty() {
                prop.insert("description".into(), Value::String(p.description.clone()));
            }
            properties.insert(p.name.clone(), Value::Object(prop));
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            },
        })
    }
}

/// Read tool declarations out of an input value.
///
/// Absent, `null` and empty lists all mean "no tools" so requests without
/// tools stay identical to requests from signatures that never declare them.
pub fn declarations_from_input(field: &str, value: Option<&Value>) -> Result<Option<Vec<ToolSpec>>> {
    let value = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(v) => v,
    };
    let specs: Vec<ToolSpec> =
        serde_json::from_value(value.clone()).map_err(|e| PipelineError::InvalidInput {
            field: field.to_string(),
            reason: format!("not a list of tool declarations: {e}"),
        })?;
    if specs.is_empty() {
        Ok(None)
    } else {
        Ok(Some(specs))
    }
}

/// A structured tool call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ref id) = self.id {
            obj.insert("id".into(), Value::String(id.clone()));
        }
        obj.insert("name".into(), Value::String(self.name.clone()));
        obj.insert("args".into(), Value::Object(self.args.clone()));
        Value::Object(obj)
    }
}

/// Extract tool calls from the first choice of a response.
///
/// Each `arguments` string is decoded on its own with plain `serde_json`.
/// Malformed arguments fail immediately: they do not go through JSON repair
/// and are not retried.
pub fn extract_tool_calls(response: &LmResponse) -> Result<Vec<ToolCall>> {
    let Some(choice) = response.choices.first() else {
        return Ok(Vec::new());
    };
    let Some(ref wire_calls) = choice.message.tool_calls else {
        return Ok(Vec::new());
    };

    wire_calls
        .iter()
        .map(|call| {
            let name = call.function.name.clone();
            let args = if call.function.arguments.trim().is_empty() {
                Map::new()
            } else {
                match serde_json::from_str::<Value>(&call.function.arguments) {
                    Ok(Value::Object(map)) => map,
                    Ok(other) => {
                        return Err(PipelineError::InvalidToolCallArguments {
                            name,
                            reason: format!(
                                "expected a JSON object, got {}",
                                crate::output_parser::json_type_name(&other)
                            ),
                        })
                    }
                    Err(e) => {
                        return Err(PipelineError::InvalidToolCallArguments {
                            name,
                            reason: format!(
                                "{} (arguments: {})",
                                e,
                                truncate(&call.function.arguments, 120)
                            ),
                        })
                    }
                }
            };
            Ok(ToolCall {
                id: call.id.clone(),
                name,
                args,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Choice, ResponseMessage, WireFunction, WireToolCall};

    fn response_with_calls(calls: Vec<(&str, &str)>) -> LmResponse {
        LmResponse {
            choices: vec![Choice {
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: None,
                    tool_calls: Some(
                        calls
                            .into_iter()
                            .enumerate()
                            .map(|(i, (name, args))| WireToolCall {
                                id: Some(format!("call_{i}")),
                                function: WireFunction {
                                    name: name.into(),
                                    arguments: args.into(),
                                },
                            })
                            .collect(),
                    ),
                },
                finish_reason: Some("tool_calls".into()),
            }],
            usage: None,
        }
    }

    #[test]
    fn test_absent_null_and_empty_mean_no_tools() {
        assert_eq!(declarations_from_input("tools", None).unwrap(), None);
        assert_eq!(declarations_from_input("tools", Some(&Value::Null)).unwrap(), None);
        assert_eq!(declarations_from_input("tools", Some(&json!([]))).unwrap(), None);
    }

    #[test]
    fn test_declarations_parse() {
        let value = json!([{
            "name": "search",
            "description": "Search",
            "parameters": [{"name": "q", "type": "string", "required": true}]
        }]);
        let specs = declarations_from_input("tools", Some(&value)).unwrap().unwrap();
        assert_eq!(specs[0].parameters[0].param_type, "string");
        assert!(specs[0].parameters[0].required);
    }

    #[test]
    fn test_bad_declarations_are_invalid_input() {
        let err = declarations_from_input("tools", Some(&json!("search"))).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput { ref field, .. } if field == "tools"));
    }

    #[test]
    fn test_wire_shape_omits_empty_description() {
        let wire = ToolSpec::new("t", "d")
            .param(ToolParameter::new("x", "integer"))
            .to_wire();
        assert_eq!(
            wire["function"]["parameters"]["properties"]["x"],
            json!({"type": "integer"})
        );
        assert_eq!(wire["function"]["parameters"]["required"], json!([]));
    }

    #[test]
    fn test_extracts_calls_in_order() {
        let resp = response_with_calls(vec![
            ("search", r#"{"q": "rust"}"#),
            ("noop", ""),
        ]);
        let calls = extract_tool_calls(&resp).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].args["q"], "rust");
        assert_eq!(calls[0].id.as_deref(), Some("call_0"));
        assert!(calls[1].args.is_empty());
    }

    #[test]
    fn test_malformed_arguments_are_not_repaired() {
        // A trailing comma would be repaired for text output; not here.
        let resp = response_with_calls(vec![("search", r#"{"q": "rust",}"#)]);
        let err = extract_tool_calls(&resp).unwrap_err();
        match err {
            PipelineError::InvalidToolCallArguments { name, .. } => assert_eq!(name, "search"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_tool_calls() {
        let resp = LmResponse::text("hello");
        assert!(extract_tool_calls(&resp).unwrap().is_empty());
    }
}
