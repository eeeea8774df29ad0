use std::borrow::Cow;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire protocol spoken by an upstream supplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetProtocol {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai-chat")]
    OpenAiChat,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    #[serde(rename = "gemini")]
    Gemini,
}

impl TargetProtocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TargetProtocol::Anthropic => "anthropic",
            TargetProtocol::OpenAiChat => "openai-chat",
            TargetProtocol::OpenAiResponses => "openai-responses",
            TargetProtocol::Gemini => "gemini",
        }
    }

    /// Parse a configured protocol name. `openai` and `codex` are accepted
    /// as aliases for the Chat and Responses protocols.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "anthropic" => Some(TargetProtocol::Anthropic),
            "openai-chat" | "openai" => Some(TargetProtocol::OpenAiChat),
            "openai-responses" | "codex" => Some(TargetProtocol::OpenAiResponses),
            "gemini" => Some(TargetProtocol::Gemini),
            _ => None,
        }
    }
}

/// Canonical message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One typed unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: Value,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ContentBlock::Text { .. } => "text",
            ContentBlock::Image { .. } => "image",
            ContentBlock::ToolUse { .. } => "tool_use",
            ContentBlock::ToolResult { .. } => "tool_result",
            ContentBlock::Thinking { .. } => "thinking",
            ContentBlock::Unsupported => "unsupported",
        }
    }
}

/// Tool result payload: a plain string or nested blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    /// Text parts of the result, in order.
    #[must_use]
    pub fn texts(&self) -> Vec<&str> {
        match self {
            ToolResultContent::Text(text) => vec![text.as_str()],
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Concatenated text with `separator` between parts.
    #[must_use]
    pub fn joined_text(&self, separator: &str) -> String {
        self.texts().join(separator)
    }
}

/// Message content: either a bare string or a block list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl CanonicalMessage {
    #[must_use]
    pub fn with_blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Content as a block slice; a bare string becomes one text block.
    #[must_use]
    pub fn blocks(&self) -> Cow<'_, [ContentBlock]> {
        match &self.content {
            MessageContent::Text(text) => Cow::Owned(vec![ContentBlock::text(text.clone())]),
            MessageContent::Blocks(blocks) => Cow::Borrowed(blocks.as_slice()),
        }
    }
}

/// System prompt: a string or a list of text blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl SystemPrompt {
    /// Text blocks joined by a blank line.
    #[must_use]
    pub fn joined_text(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

/// A tool the client offers to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
    /// Set for server-side builtin tools (e.g. `web_search_20250305`).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Tool choice as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// The inbound request in the client protocol.
///
/// Never mutated once parsed; encoders read it and build their own wire values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    pub messages: Vec<CanonicalMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RequestMetadata>,
}

impl CanonicalRequest {
    /// Concatenated system text, if any non-empty text is present.
    #[must_use]
    pub fn system_text(&self) -> Option<String> {
        let text = self.system.as_ref()?.joined_text();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

impl StopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::ToolUse => "tool_use",
        }
    }
}

/// Token usage in client-protocol terms. `input_tokens` never includes cached tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

impl Usage {
    /// Overlay the counters `other` actually reports.
    pub fn merge(&mut self, other: &Usage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_read_input_tokens.is_some() {
            self.cache_read_input_tokens = other.cache_read_input_tokens;
        }
        if other.cache_creation_input_tokens.is_some() {
            self.cache_creation_input_tokens = other.cache_creation_input_tokens;
        }
        if other.reasoning_tokens.is_some() {
            self.reasoning_tokens = other.reasoning_tokens;
        }
    }
}

/// Complete (non-streaming) response in the client protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: Role,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

impl CanonicalResponse {
    #[must_use]
    pub fn new(id: String, model: String) -> Self {
        Self {
            id,
            kind: "message".to_string(),
            role: Role::Assistant,
            model,
            content: Vec::new(),
            stop_reason: StopReason::EndTurn,
            stop_sequence: None,
            usage: Usage::default(),
        }
    }

    /// Whether any tool use block is present.
    #[must_use]
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolUse { .. }))
    }
}

/// Kind of block announced by a `ContentBlockStart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStart {
    Text,
    ToolUse { id: String, name: String },
}

/// Payload of a `ContentBlockDelta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDelta {
    Text(String),
    PartialJson(String),
}

/// A single event of the client stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalStreamEvent {
    MessageStart {
        id: String,
        model: String,
        usage: Usage,
    },
    ContentBlockStart {
        index: usize,
        block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: StopReason,
        usage: Option<Usage>,
    },
    MessageStop,
    Error {
        message: String,
    },
}

impl CanonicalStreamEvent {
    /// The SSE `event:` name of this event.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            CanonicalStreamEvent::MessageStart { .. } => "message_start",
            CanonicalStreamEvent::ContentBlockStart { .. } => "content_block_start",
            CanonicalStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            CanonicalStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            CanonicalStreamEvent::MessageDelta { .. } => "message_delta",
            CanonicalStreamEvent::MessageStop => "message_stop",
            CanonicalStreamEvent::Error { .. } => "error",
        }
    }
}

/// Name and argument digest recorded for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments_digest: String,
}

/// Per-request table from tool-use id to the tool it invoked.
///
/// Upstreams that reference results only by id (Gemini needs the name on
/// `functionResponse`) look the name up here.
#[derive(Debug, Clone, Default)]
pub struct ToolCallMapping {
    entries: FxHashMap<String, ToolCallRecord>,
}

impl ToolCallMapping {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call whose arguments are a structured value.
    pub fn record(&mut self, id: &str, tool_name: &str, arguments: &Value) {
        self.record_digest(id, tool_name, arguments.to_string());
    }

    /// Record a call whose arguments are already serialized.
    pub fn record_digest(&mut self, id: &str, tool_name: &str, arguments_digest: String) {
        self.entries.insert(
            id.to_string(),
            ToolCallRecord {
                tool_name: tool_name.to_string(),
                arguments_digest,
            },
        );
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ToolCallRecord> {
        self.entries.get(id)
    }

    #[must_use]
    pub fn tool_name(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(|record| record.tool_name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
