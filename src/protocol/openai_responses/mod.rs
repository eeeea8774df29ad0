pub mod encoder;
pub mod response_decoder;
pub mod stream;
pub mod validate;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::CustomToolCallStrategy;

// ---------------------------------------------------------------------------
// Request wire types
// ---------------------------------------------------------------------------

/// Responses API request body.
#[derive(Debug, Clone, Serialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub instructions: String,
    pub input: Vec<ResponsesInputItem>,
    pub tools: Vec<ResponsesTool>,
    pub tool_choice: ResponsesToolChoice,
    pub parallel_tool_calls: bool,
    pub reasoning: ResponsesReasoning,
    pub store: bool,
    pub stream: bool,
    pub include: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,
}

/// One entry of the `input` array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesInputItem {
    Message {
        role: &'static str,
        content: Vec<ResponsesInputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesInputContent {
    InputText { text: String },
    OutputText { text: String },
    InputImage { image_url: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesTool {
    Function {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        strict: bool,
        parameters: Value,
    },
    WebSearch {},
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponsesToolChoice {
    Mode(&'static str),
    Function {
        #[serde(rename = "type")]
        type_: &'static str,
        name: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponsesReasoning {
    pub effort: String,
    pub summary: &'static str,
}

// ---------------------------------------------------------------------------
// Response and stream wire types
// ---------------------------------------------------------------------------

/// A response object, as returned whole or wrapped in stream envelopes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Vec<ResponsesItem>,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

/// An output item. Fields not used by a given `type` stay `None`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    /// `custom_tool_call` payload: free-form text.
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub content: Vec<ResponsesContentPart>,
    #[serde(default)]
    pub summary: Vec<ResponsesContentPart>,
}

impl ResponsesItem {
    /// Identifier shared by the item's lifecycle events.
    #[must_use]
    pub fn stream_key(&self) -> Option<&str> {
        self.id.as_deref().or(self.call_id.as_deref())
    }

    /// Client-facing call id.
    #[must_use]
    pub fn client_call_id(&self) -> Option<&str> {
        self.call_id.as_deref().or(self.id.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub refusal: Option<String>,
}

/// Streaming events this gateway reacts to; everything else is `Other`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ResponsesStreamEvent {
    #[serde(rename = "response.created")]
    Created {
        #[serde(default)]
        response: ResponsesEnvelope,
    },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.refusal.delta")]
    RefusalDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: ResponsesItem },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: ResponsesItem },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.reasoning_text.delta")]
    ReasoningTextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.completed")]
    Completed {
        #[serde(default)]
        response: ResponsesEnvelope,
    },
    #[serde(rename = "response.incomplete")]
    Incomplete {
        #[serde(default)]
        response: ResponsesEnvelope,
    },
    #[serde(rename = "response.failed")]
    Failed {
        #[serde(default)]
        response: ResponsesEnvelope,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(other)]
    Other,
}

/// Message of a Responses error object.
#[must_use]
pub fn error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        other => {
            let message = other.get("message").and_then(Value::as_str);
            let code = other.get("code").and_then(Value::as_str);
            match (code, message) {
                (Some(code), Some(message)) => format!("{code}: {message}"),
                (None, Some(message)) => message.to_string(),
                _ => other.to_string(),
            }
        }
    }
}

/// Structured input for a `custom_tool_call`.
///
/// A payload that already is a JSON object passes through. A plain string is
/// wrapped as `{"input": ...}` or rejected, per `strategy`.
///
/// # Errors
///
/// Returns the rejection message under [`CustomToolCallStrategy::Error`].
pub fn custom_tool_input(
    name: &str,
    input: &str,
    strategy: CustomToolCallStrategy,
) -> Result<Value, String> {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(input) {
        return Ok(value);
    }
    match strategy {
        CustomToolCallStrategy::WrapObject => {
            let mut map = Map::new();
            map.insert("input".to_string(), Value::String(input.to_string()));
            Ok(Value::Object(map))
        }
        CustomToolCallStrategy::Error => Err(format!(
            "custom tool call '{name}' returned a plain string input; the client requires an object"
        )),
    }
}
