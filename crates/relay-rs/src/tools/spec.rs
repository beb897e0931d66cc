//! Structured tool descriptions.
//!
//! `ToolSpec` turns purpose, usage guidance and examples into the description
//! string the model sees, and guarantees that every parameter schema carries
//! the required `summary_prompt` field. That field is never read by the
//! handler itself; the dispatcher keeps it in case the output later has to be
//! compressed.

use crate::ToolDef;

/// Name of the advisory field every tool schema requires.
pub const SUMMARY_PROMPT_FIELD: &str = "summary_prompt";

const SUMMARY_PROMPT_DESCRIPTION: &str =
    "Instruction for summarizing this call's output if it turns out to be too large.";

/// A structured tool specification.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    /// One-sentence imperative purpose: "Read a UTF-8 file".
    pub purpose: String,
    pub when_to_use: String,
    /// Steers the model away from similar tools.
    pub when_not_to_use: String,
    /// JSON Schema of the arguments, including `summary_prompt`.
    pub parameters: serde_json::Value,
    pub examples: Vec<UsageExample>,
    pub output_format: String,
}

/// An example call and what it returns.
#[derive(Debug, Clone)]
pub struct UsageExample {
    pub input: String,
    pub output: String,
}

impl ToolSpec {
    pub fn builder(name: impl Into<String>) -> ToolSpecBuilder {
        ToolSpecBuilder {
            name: name.into(),
            purpose: None,
            when_to_use: None,
            when_not_to_use: None,
            parameters: None,
            examples: Vec::new(),
            output_format: None,
        }
    }

    /// The description string sent to the model.
    pub fn to_description(&self) -> String {
        let mut desc = format!("{}.", self.purpose.trim_end_matches('.'));
        if !self.when_to_use.is_empty() {
            desc.push_str(&format!("\nWhen to use: {}", self.when_to_use));
        }
        if !self.when_not_to_use.is_empty() {
            desc.push_str(&format!("\nWhen NOT to use: {}", self.when_not_to_use));
        }
        if !self.examples.is_empty() {
            desc.push_str("\nExamples:");
            for ex in &self.examples {
                desc.push_str(&format!("\n  - Input: {} → {}", ex.input, ex.output));
            }
        }
        if !self.output_format.is_empty() {
            desc.push_str(&format!("\nOutput format: {}", self.output_format));
        }
        desc
    }

    pub fn to_tool_def(&self) -> ToolDef {
        ToolDef::new(
            self.name.clone(),
            self.to_description(),
            self.parameters.clone(),
        )
    }
}

pub struct ToolSpecBuilder {
    name: String,
    purpose: Option<String>,
    when_to_use: Option<String>,
    when_not_to_use: Option<String>,
    parameters: Option<serde_json::Value>,
    examples: Vec<UsageExample>,
    output_format: Option<String>,
}

impl ToolSpecBuilder {
    pub fn purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    pub fn when_to_use(mut self, when: impl Into<String>) -> Self {
        self.when_to_use = Some(when.into());
        self
    }

    pub fn when_not_to_use(mut self, when_not: impl Into<String>) -> Self {
        self.when_not_to_use = Some(when_not.into());
        self
    }

    pub fn parameters(mut self, params: serde_json::Value) -> Self {
        self.parameters = Some(params);
        self
    }

    /// Derive the parameter schema from a `schemars::JsonSchema` type.
    pub fn parameters_for<T: schemars::JsonSchema>(self) -> Self {
        self.parameters(crate::json_schema_for::<T>())
    }

    pub fn example(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.examples.push(UsageExample {
            input: input.into(),
            output: output.into(),
        });
        self
    }

    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    pub fn to_tool_def(self) -> ToolDef {
        self.build().to_tool_def()
    }

    /// Missing text fields fall back to the tool name or nothing; missing
    /// parameters become an empty object schema. `summary_prompt` is always
    /// added as a required string.
    pub fn build(self) -> ToolSpec {
        let parameters = self
            .parameters
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
        ToolSpec {
            purpose: self.purpose.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            when_to_use: self.when_to_use.unwrap_or_default(),
            when_not_to_use: self.when_not_to_use.unwrap_or_default(),
            parameters: require_summary_prompt(parameters),
            examples: self.examples,
            output_format: self.output_format.unwrap_or_else(|| "Plain text".into()),
        }
    }
}

/// Add `summary_prompt` to a schema's properties and required list.
pub fn require_summary_prompt(mut schema: serde_json::Value) -> serde_json::Value {
    let Some(obj) = schema.as_object_mut() else {
        return schema;
    };
    obj.entry("type").or_insert_with(|| "object".into());

    let properties = obj
        .entry("properties")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(props) = properties.as_object_mut() {
        props.entry(SUMMARY_PROMPT_FIELD).or_insert_with(|| {
            serde_json::json!({
                "type": "string",
                "description": SUMMARY_PROMPT_DESCRIPTION,
            })
        });
    }

    let required = obj.entry("required").or_insert_with(|| serde_json::json!([]));
    if let Some(list) = required.as_array_mut()
        && !list.iter().any(|v| v == SUMMARY_PROMPT_FIELD)
    {
        list.push(SUMMARY_PROMPT_FIELD.into());
    }
    schema
}

/// The `summary_prompt` of a raw argument string, or empty.
pub fn summary_prompt_of(arguments: &str) -> String {
    serde_json::from_str::<serde_json::Value>(arguments)
        .ok()
        .and_then(|v| {
            v.get(SUMMARY_PROMPT_FIELD)
                .and_then(|p| p.as_str())
                .map(str::to_string)
        })
        .unwrap_or_default()
}
