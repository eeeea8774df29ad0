use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::{CanonicalRequest, ContentBlock, Role, ToolChoice};
use crate::protocol::mapping::{image_ref, role_to_openai};
use crate::protocol::openai_chat::{
    OpenAiChatRequest, OpenAiContent, OpenAiContentPart, OpenAiImageUrl, OpenAiMessage,
    OpenAiStreamOptions, OpenAiTool, OpenAiToolCall, OpenAiToolCallFunction, OpenAiToolChoice,
    OpenAiToolChoiceFunction, OpenAiToolChoiceFunctionCall, OpenAiToolFunction,
};
use crate::protocol::schema::apply_tool_schema_policy;
use crate::transform::request::RenderContext;
use crate::transform::trace::{DefaultSource, TransformTrace};
use crate::transform::validate::{CallItem, CallItemFields, CallItemKind};

const CALL_FIELDS: CallItemFields = CallItemFields {
    call_id: "id",
    name: "function/name",
    arguments: "function/arguments",
    output: "content",
};

const OUTPUT_FIELDS: CallItemFields = CallItemFields {
    call_id: "tool_call_id",
    name: "name",
    arguments: "arguments",
    output: "content",
};

/// Encode a canonical request into the Chat Completions wire format.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if the wire body cannot be serialized.
pub fn encode_request(
    request: &CanonicalRequest,
    ctx: &RenderContext<'_>,
    trace: &mut TransformTrace,
) -> Result<Value, GatewayError> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = request.system_text() {
        messages.push(OpenAiMessage {
            role: "system",
            content: Some(OpenAiContent::Text(system)),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for (msg_index, message) in request.messages.iter().enumerate() {
        match message.role {
            Role::User => encode_user_message(msg_index, &message.blocks(), &mut messages, trace),
            Role::Assistant => {
                encode_assistant_message(msg_index, &message.blocks(), &mut messages, trace);
            }
        }
    }

    let tools = encode_tools(request, ctx, trace);
    let tool_choice = tools.as_ref().map(|_| match &request.tool_choice {
        Some(choice) => encode_tool_choice(choice),
        None => {
            trace.audit.add_defaulted(
                "/tool_choice",
                DefaultSource::ProtocolDefault,
                "tools present without tool_choice",
            );
            OpenAiToolChoice::Mode("auto")
        }
    });

    let stream_options = if request.stream {
        trace.audit.add_defaulted(
            "/stream_options/include_usage",
            DefaultSource::ProtocolDefault,
            "usage is only reported on streams that ask for it",
        );
        Some(OpenAiStreamOptions {
            include_usage: true,
        })
    } else {
        None
    };

    let wire = OpenAiChatRequest {
        model: request.model.clone(),
        messages,
        tools,
        tool_choice,
        stream: request.stream,
        stream_options,
        max_tokens: request.sampling.max_tokens,
        temperature: request.sampling.temperature,
        top_p: request.sampling.top_p,
        stop: request.sampling.stop_sequences.clone(),
    };
    if request.sampling.top_k.is_some() {
        trace.audit.add_unmapped_source_path("/top_k");
    }
    if request.thinking.is_some() {
        trace.audit.add_unmapped_source_path("/thinking");
    }
    serde_json::to_value(wire).map_err(|err| GatewayError::Internal(err.to_string()))
}

#[derive(Default)]
struct PendingUser {
    parts: Vec<OpenAiContentPart>,
    has_image: bool,
}

impl PendingUser {
    fn push_text(&mut self, text: &str) {
        if let Some(OpenAiContentPart::Text { text: last }) = self.parts.last_mut() {
            last.push_str(text);
        } else {
            self.parts.push(OpenAiContentPart::Text {
                text: text.to_string(),
            });
        }
    }

    fn flush(&mut self, out: &mut Vec<OpenAiMessage>) {
        if self.parts.is_empty() {
            return;
        }
        let parts = std::mem::take(&mut self.parts);
        let content = if self.has_image {
            OpenAiContent::Parts(parts)
        } else {
            OpenAiContent::Text(
                parts
                    .into_iter()
                    .filter_map(|part| match part {
                        OpenAiContentPart::Text { text } => Some(text),
                        OpenAiContentPart::ImageUrl { .. } => None,
                    })
                    .collect(),
            )
        };
        self.has_image = false;
        out.push(OpenAiMessage {
            role: role_to_openai(Role::User),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        });
    }
}

fn encode_user_message(
    msg_index: usize,
    blocks: &[ContentBlock],
    out: &mut Vec<OpenAiMessage>,
    trace: &mut TransformTrace,
) {
    let mut pending = PendingUser::default();
    for (block_index, block) in blocks.iter().enumerate() {
        match block {
            ContentBlock::Text { text } => pending.push_text(text),
            ContentBlock::Image { source } => match image_ref(source) {
                Some(image) => {
                    pending.has_image = true;
                    pending.parts.push(OpenAiContentPart::ImageUrl {
                        image_url: OpenAiImageUrl {
                            url: image.to_url(),
                        },
                    });
                }
                None => unmapped(msg_index, block_index, block, trace),
            },
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                pending.flush(out);
                let text = content
                    .as_ref()
                    .map(|content| content.joined_text("\n"))
                    .unwrap_or_default();
                out.push(OpenAiMessage {
                    role: "tool",
                    content: Some(OpenAiContent::Text(text)),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
            ContentBlock::ToolUse { .. }
            | ContentBlock::Thinking { .. }
            | ContentBlock::Unsupported => unmapped(msg_index, block_index, block, trace),
        }
    }
    pending.flush(out);
}

fn encode_assistant_message(
    msg_index: usize,
    blocks: &[ContentBlock],
    out: &mut Vec<OpenAiMessage>,
    trace: &mut TransformTrace,
) {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for (block_index, block) in blocks.iter().enumerate() {
        match block {
            ContentBlock::Text { text: part } => text.push_str(part),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(OpenAiToolCall {
                id: id.clone(),
                type_: "function",
                function: OpenAiToolCallFunction {
                    name: name.clone(),
                    arguments: compact_arguments(input),
                },
            }),
            ContentBlock::Thinking { .. }
            | ContentBlock::Image { .. }
            | ContentBlock::ToolResult { .. }
            | ContentBlock::Unsupported => unmapped(msg_index, block_index, block, trace),
        }
    }
    if text.is_empty() && tool_calls.is_empty() {
        return;
    }
    out.push(OpenAiMessage {
        role: role_to_openai(Role::Assistant),
        content: (!text.is_empty()).then_some(OpenAiContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    });
}

/// Compact JSON string for tool arguments; a missing input becomes `{}`.
pub(crate) fn compact_arguments(input: &Value) -> String {
    match input {
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn unmapped(
    msg_index: usize,
    block_index: usize,
    block: &ContentBlock,
    trace: &mut TransformTrace,
) {
    let path = format!("/messages/{msg_index}/content/{block_index}");
    trace.audit.add_unmapped_source_path(&path);
    trace.warn(format!("Dropped unsupported {} block at {path}", block.kind()));
    tracing::debug!(path = %path, kind = block.kind(), "content block has no target mapping");
}

fn encode_tools(
    request: &CanonicalRequest,
    ctx: &RenderContext<'_>,
    trace: &mut TransformTrace,
) -> Option<Vec<OpenAiTool>> {
    let mut tools = Vec::with_capacity(request.tools.len());
    for (index, tool) in request.tools.iter().enumerate() {
        if tool.kind.as_deref().is_some_and(|kind| kind != "custom") {
            trace.audit.add_unmapped_source_path(&format!("/tools/{index}"));
            trace.warn(format!("Dropped builtin tool '{}'", tool.name));
            continue;
        }
        let (parameters, removed) =
            apply_tool_schema_policy(&tool.input_schema, &ctx.config.tool_schema);
        for key in removed {
            trace
                .audit
                .add_unmapped_source_path(&format!("/tools/{index}/input_schema/{key}"));
        }
        tools.push(OpenAiTool {
            type_: "function",
            function: OpenAiToolFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters,
            },
        });
    }
    (!tools.is_empty()).then_some(tools)
}

fn encode_tool_choice(choice: &ToolChoice) -> OpenAiToolChoice {
    match choice {
        ToolChoice::Auto => OpenAiToolChoice::Mode("auto"),
        ToolChoice::Any => OpenAiToolChoice::Mode("required"),
        ToolChoice::None => OpenAiToolChoice::Mode("none"),
        ToolChoice::Tool { name } => OpenAiToolChoice::Function(OpenAiToolChoiceFunctionCall {
            type_: "function",
            function: OpenAiToolChoiceFunction { name: name.clone() },
        }),
    }
}

/// Tool calls and tool outputs of a rendered Chat body, in order.
#[must_use]
pub fn call_items(body: &Value) -> Vec<CallItem> {
    let mut items = Vec::new();
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return items;
    };
    for (msg_index, message) in messages.iter().enumerate() {
        match message.get("role").and_then(Value::as_str) {
            Some("assistant") => {
                let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
                    continue;
                };
                for (call_index, call) in calls.iter().enumerate() {
                    items.push(CallItem {
                        kind: CallItemKind::Call,
                        path: format!("/messages/{msg_index}/tool_calls/{call_index}"),
                        call_id: str_at(call, "/id"),
                        name: str_at(call, "/function/name"),
                        arguments: str_at(call, "/function/arguments"),
                        has_output: false,
                        fields: CALL_FIELDS,
                    });
                }
            }
            Some("tool") => items.push(CallItem {
                kind: CallItemKind::Output,
                path: format!("/messages/{msg_index}"),
                call_id: str_at(message, "/tool_call_id"),
                name: None,
                arguments: None,
                has_output: message.get("content").is_some_and(|content| !content.is_null()),
                fields: OUTPUT_FIELDS,
            }),
            _ => {}
        }
    }
    items
}

pub(crate) fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
}
