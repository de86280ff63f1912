//! Signature and field declarations.
//!
//! A [`Signature`] is the static contract of one LM call: ordered input
//! fields, ordered output fields, free-text instructions and optional
//! per-field JSON schemas. It carries no behavior beyond checking its own
//! well-formedness; adapters read it to render requests and parse replies.
//!
//! # Example
//!
//! ```
//! use signature_pipeline::signature::{Field, Signature};
//!
//! let sig = Signature::builder("qa")
//!     .instructions("Answer the question concisely.")
//!     .input(Field::string("question").desc("The user's question"))
//!     .output(Field::string("answer"))
//!     .output(Field::float("confidence").optional())
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(sig.output_fields().len(), 2);
//! assert_eq!(sig.field("question").unwrap().marker(), "Question");
//! ```

use crate::error::{PipelineError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// The type of a signature field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    /// Arbitrary JSON, optionally constrained by a [`FieldSchema`].
    Json,
    /// Input carrying tool declarations; rendered into `LmRequest::tools`.
    ToolDeclarations,
    /// Output filled from the structured tool calls of the LM response.
    ToolCalls,
    /// Input carrying prior conversation turns.
    History,
}

impl FieldKind {
    /// Short type label used in prompts.
    pub fn label(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Boolean => "boolean",
            FieldKind::Json => "json",
            FieldKind::ToolDeclarations => "tool_declarations",
            FieldKind::ToolCalls => "tool_calls",
            FieldKind::History => "history",
        }
    }

    /// Whether values of this kind are rendered as prompt text / parsed
    /// from response text (as opposed to riding on structured channels).
    pub fn is_textual(self) -> bool {
        !matches!(
            self,
            FieldKind::ToolDeclarations | FieldKind::ToolCalls | FieldKind::History
        )
    }
}

/// A JSON Schema attached to a `json` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSchema(Value);

impl FieldSchema {
    /// Wrap a raw JSON Schema document.
    pub fn new(schema: Value) -> Self {
        Self(schema)
    }

    /// Derive the schema from a Rust type.
    ///
    /// Pair with [`Outputs::get_as`](crate::types::Outputs::get_as) to cast a
    /// validated value back into `T`.
    pub fn from_type<T: JsonSchema>() -> Self {
        let root = schemars::schema_for!(T);
        Self(serde_json::to_value(root).unwrap_or_else(|_| json!({})))
    }

    /// The raw schema document.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    fn check(&self) -> std::result::Result<(), String> {
        jsonschema::JSONSchema::compile(&self.0)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// One named, typed field of a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<FieldSchema>,
}

fn default_required() -> bool {
    true
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            required: true,
            schema: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Json)
    }

    /// A `json` field whose schema is derived from `T`.
    pub fn typed<T: JsonSchema>(name: impl Into<String>) -> Self {
        Self::json(name).with_schema(FieldSchema::from_type::<T>())
    }

    pub fn history(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::History).optional()
    }

    pub fn tools(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::ToolDeclarations).optional()
    }

    pub fn tool_calls(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::ToolCalls)
    }

    /// Set the description shown to the model.
    pub fn desc(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the field as optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Attach a JSON Schema (only valid on `json` fields).
    pub fn with_schema(mut self, schema: FieldSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Stable textual marker for text adapters: `final_answer` → `Final Answer`.
    pub fn marker(&self) -> String {
        self.name
            .split('_')
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// JSON Schema fragment describing this field's value.
    pub fn value_schema(&self) -> Value {
        match (self.kind, &self.schema) {
            (FieldKind::Json, Some(schema)) => schema.as_value().clone(),
            (FieldKind::Json, None) => json!({}),
            (FieldKind::String, _) => json!({"type": "string"}),
            (FieldKind::Integer, _) => json!({"type": "integer"}),
            (FieldKind::Float, _) => json!({"type": "number"}),
            (FieldKind::Boolean, _) => json!({"type": "boolean"}),
            (FieldKind::ToolDeclarations | FieldKind::ToolCalls | FieldKind::History, _) => {
                json!({"type": "array"})
            }
        }
    }
}

/// A typed declaration of one LM call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signature {
    name: String,
    instructions: String,
    input_fields: Vec<Field>,
    output_fields: Vec<Field>,
}

impl Signature {
    /// Start building a signature.
    pub fn builder(name: impl Into<String>) -> SignatureBuilder {
        SignatureBuilder {
            name: name.into(),
            instructions: String::new(),
            input_fields: Vec::new(),
            output_fields: Vec::new(),
        }
    }

    /// Load and validate a signature from JSON.
    ///
    /// ```
    /// use signature_pipeline::signature::Signature;
    ///
    /// let sig = Signature::from_json(r#"{
    ///     "name": "qa",
    ///     "instructions": "Answer.",
    ///     "inputs": [{"name": "question", "kind": "string"}],
    ///     "outputs": [{"name": "answer", "kind": "string"}]
    /// }"#).unwrap();
    /// assert_eq!(sig.name(), "qa");
    /// ```
    pub fn from_json(text: &str) -> Result<Self> {
        let def: SignatureDef = serde_json::from_str(text)?;
        def.into_signature()
    }

    /// Load and validate a signature from YAML.
    #[cfg(feature = "yaml")]
    pub fn from_yaml(text: &str) -> Result<Self> {
        let def: SignatureDef = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::InvalidSignature(e.to_string()))?;
        def.into_signature()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    /// Input fields in declaration order.
    pub fn input_fields(&self) -> &[Field] {
        &self.input_fields
    }

    /// Output fields in declaration order.
    pub fn output_fields(&self) -> &[Field] {
        &self.output_fields
    }

    /// Look up any field (input or output) by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.input_fields
            .iter()
            .chain(self.output_fields.iter())
            .find(|f| f.name == name)
    }

    /// Input fields rendered as prompt text (no history, no tool declarations).
    pub fn text_inputs(&self) -> impl Iterator<Item = &Field> {
        self.input_fields.iter().filter(|f| f.kind.is_textual())
    }

    /// Output fields parsed from response text (no tool calls).
    pub fn text_outputs(&self) -> impl Iterator<Item = &Field> {
        self.output_fields.iter().filter(|f| f.kind.is_textual())
    }

    pub fn history_field(&self) -> Option<&Field> {
        self.input_fields
            .iter()
            .find(|f| f.kind == FieldKind::History)
    }

    pub fn tool_declarations_field(&self) -> Option<&Field> {
        self.input_fields
            .iter()
            .find(|f| f.kind == FieldKind::ToolDeclarations)
    }

    pub fn tool_calls_field(&self) -> Option<&Field> {
        self.output_fields
            .iter()
            .find(|f| f.kind == FieldKind::ToolCalls)
    }

    /// JSON Schema of the object a JSON-speaking model must return: every
    /// text output field as a property, all of them required.
    pub fn output_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in self.text_outputs() {
            properties.insert(field.name.clone(), field.value_schema());
            required.push(Value::String(field.name.clone()));
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.output_fields.is_empty() {
            return Err(invalid("at least one output field is required"));
        }

        let mut seen = HashSet::new();
        for field in self.input_fields.iter().chain(self.output_fields.iter()) {
            if field.name.trim().is_empty() {
                return Err(invalid("field names must be non-empty"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(format!("duplicate field name '{}'", field.name)));
            }
            if let Some(ref schema) = field.schema {
                if field.kind != FieldKind::Json {
                    return Err(invalid(format!(
                        "field '{}' has a schema but is of kind {}",
                        field.name,
                        field.kind.label()
                    )));
                }
                schema.check().map_err(|e| {
                    invalid(format!("field '{}' has an invalid schema: {}", field.name, e))
                })?;
            }
        }

        for field in &self.input_fields {
            if field.kind == FieldKind::ToolCalls {
                return Err(invalid(format!(
                    "tool_calls field '{}' must be an output",
                    field.name
                )));
            }
        }
        for field in &self.output_fields {
            if matches!(field.kind, FieldKind::History | FieldKind::ToolDeclarations) {
                return Err(invalid(format!(
                    "{} field '{}' must be an input",
                    field.kind.label(),
                    field.name
                )));
            }
        }

        let count = |fields: &[Field], kind| fields.iter().filter(|f| f.kind == kind).count();
        if count(&self.input_fields, FieldKind::History) > 1 {
            return Err(invalid("at most one history field is allowed"));
        }
        if count(&self.input_fields, FieldKind::ToolDeclarations) > 1 {
            return Err(invalid("at most one tool_declarations field is allowed"));
        }
        if count(&self.output_fields, FieldKind::ToolCalls) > 1 {
            return Err(invalid("at most one tool_calls field is allowed"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> PipelineError {
    PipelineError::InvalidSignature(msg.into())
}

/// Builder for [`Signature`].
#[derive(Debug, Clone)]
pub struct SignatureBuilder {
    name: String,
    instructions: String,
    input_fields: Vec<Field>,
    output_fields: Vec<Field>,
}

impl SignatureBuilder {
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Append an input field.
    pub fn input(mut self, field: Field) -> Self {
        self.input_fields.push(field);
        self
    }

    /// Append an output field.
    pub fn output(mut self, field: Field) -> Self {
        self.output_fields.push(field);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<Signature> {
        let signature = Signature {
            name: self.name,
            instructions: self.instructions,
            input_fields: self.input_fields,
            output_fields: self.output_fields,
        };
        signature.validate()?;
        Ok(signature)
    }
}

/// On-disk signature shape.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SignatureDef {
    name: String,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    inputs: Vec<Field>,
    outputs: Vec<Field>,
}

impl SignatureDef {
    fn into_signature(self) -> Result<Signature> {
        let builder = Signature::builder(self.name).instructions(self.instructions);
        let builder = self.inputs.into_iter().fold(builder, |b, f| b.input(f));
        self.outputs
            .into_iter()
            .fold(builder, |b, f| b.output(f))
            .build()
    }
}
