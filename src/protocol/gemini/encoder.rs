use serde_json::{Map, Value};

use super::{
    GeminiContent, GeminiFunctionCall, GeminiFunctionCallingConfig, GeminiFunctionDeclaration,
    GeminiFunctionResponse, GeminiGenerationConfig, GeminiInlineData, GeminiPart, GeminiRequest,
    GeminiToolConfig, GeminiToolDeclaration,
};
use crate::error::GatewayError;
use crate::protocol::canonical::{
    CanonicalRequest, ContentBlock, Role, ToolChoice, ToolResultContent,
};
use crate::protocol::mapping::{image_ref, role_to_gemini, ImageRef};
use crate::protocol::openai_chat::encoder::{str_at, unmapped};
use crate::protocol::schema::sanitize_schema;
use crate::transform::request::RenderContext;
use crate::transform::trace::TransformTrace;
use crate::transform::validate::{CallItem, CallItemFields, CallItemKind};
use crate::util::join_endpoint;

const CALL_FIELDS: CallItemFields = CallItemFields {
    call_id: "functionCall/id",
    name: "functionCall/name",
    arguments: "functionCall/args",
    output: "functionCall",
};

const RESPONSE_FIELDS: CallItemFields = CallItemFields {
    call_id: "functionResponse/id",
    name: "functionResponse/name",
    arguments: "functionResponse/args",
    output: "functionResponse/response",
};

/// Upstream URL for `model`.
///
/// A base already pointing at `/models` or `/v1beta` is extended rather than
/// duplicated. Streaming uses `streamGenerateContent?alt=sse`.
///
/// # Errors
///
/// Returns [`GatewayError::Config`] when `base_url` is not an absolute URL.
pub fn endpoint_url(base_url: &str, model: &str, stream: bool) -> Result<url::Url, GatewayError> {
    if stream {
        model_action_url(base_url, model, "streamGenerateContent", Some("alt=sse"))
    } else {
        model_action_url(base_url, model, "generateContent", None)
    }
}

/// `models/{model}:countTokens` under `base_url`.
///
/// # Errors
///
/// Returns [`GatewayError::Config`] when `base_url` is not an absolute URL.
pub fn count_tokens_url(base_url: &str, model: &str) -> Result<url::Url, GatewayError> {
    model_action_url(base_url, model, "countTokens", None)
}

fn model_action_url(
    base_url: &str,
    model: &str,
    action: &str,
    query: Option<&str>,
) -> Result<url::Url, GatewayError> {
    let parsed = url::Url::parse(base_url)
        .map_err(|err| GatewayError::Config(format!("invalid base URL '{base_url}': {err}")))?;
    let base_path = parsed.path().trim_end_matches('/');
    let endpoint = if base_path.ends_with("/models") || base_path.contains("/models/") {
        format!("{model}:{action}")
    } else if base_path.contains("/v1beta") || base_path.is_empty() {
        format!("models/{model}:{action}")
    } else {
        format!("v1beta/models/{model}:{action}")
    };
    join_endpoint(base_url, "v1beta", &endpoint, query)
}

/// Encode a canonical request as a Gemini `generateContent` body.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if the wire body cannot be serialized.
pub fn encode_request(
    request: &CanonicalRequest,
    ctx: &RenderContext<'_>,
    trace: &mut TransformTrace,
) -> Result<Value, GatewayError> {
    let mut contents = Vec::with_capacity(request.messages.len());
    for (msg_index, message) in request.messages.iter().enumerate() {
        let parts = encode_parts(msg_index, message.role, &message.blocks(), ctx, trace);
        if parts.is_empty() {
            continue;
        }
        contents.push(GeminiContent {
            role: role_to_gemini(message.role),
            parts,
        });
    }

    let system_instruction = request.system_text().map(|text| GeminiContent {
        role: "user",
        parts: vec![GeminiPart::Text(text)],
    });

    let declarations = encode_tools(request, trace);
    let tool_config = match (&request.tool_choice, declarations.is_empty()) {
        (_, true) | (None | Some(ToolChoice::Auto), false) => None,
        (Some(ToolChoice::Any), false) => Some(calling_config("ANY", None)),
        (Some(ToolChoice::None), false) => Some(calling_config("NONE", None)),
        (Some(ToolChoice::Tool { name }), false) => {
            Some(calling_config("ANY", Some(vec![name.clone()])))
        }
    };

    let generation_config = GeminiGenerationConfig {
        max_output_tokens: request.sampling.max_tokens,
        temperature: request.sampling.temperature,
        top_p: request.sampling.top_p,
        top_k: request.sampling.top_k,
        stop_sequences: request.sampling.stop_sequences.clone(),
    };
    if request.thinking.is_some() {
        trace.audit.add_unmapped_source_path("/thinking");
    }

    let wire = GeminiRequest {
        contents,
        system_instruction,
        tools: (!declarations.is_empty()).then(|| {
            vec![GeminiToolDeclaration {
                function_declarations: declarations,
            }]
        }),
        tool_config,
        generation_config: (!generation_config.is_empty()).then_some(generation_config),
    };
    serde_json::to_value(wire).map_err(|err| GatewayError::Internal(err.to_string()))
}

fn calling_config(mode: &'static str, allowed: Option<Vec<String>>) -> GeminiToolConfig {
    GeminiToolConfig {
        function_calling_config: GeminiFunctionCallingConfig {
            mode,
            allowed_function_names: allowed,
        },
    }
}

fn encode_parts(
    msg_index: usize,
    role: Role,
    blocks: &[ContentBlock],
    ctx: &RenderContext<'_>,
    trace: &mut TransformTrace,
) -> Vec<GeminiPart> {
    let mut parts: Vec<GeminiPart> = Vec::with_capacity(blocks.len());
    for (block_index, block) in blocks.iter().enumerate() {
        match block {
            ContentBlock::Text { text } => match parts.last_mut() {
                Some(GeminiPart::Text(last)) => last.push_str(text),
                _ => parts.push(GeminiPart::Text(text.clone())),
            },
            ContentBlock::Image { source } if role == Role::User => match image_ref(source) {
                Some(ImageRef::Inline { media_type, data }) => {
                    parts.push(GeminiPart::InlineData(GeminiInlineData {
                        mime_type: media_type.to_string(),
                        data: data.to_string(),
                    }));
                }
                _ => unmapped(msg_index, block_index, block, trace),
            },
            ContentBlock::ToolUse { id, name, input } => {
                let args = if input.is_object() {
                    input.clone()
                } else {
                    Value::Object(Map::new())
                };
                parts.push(GeminiPart::FunctionCall(GeminiFunctionCall {
                    id: id.clone(),
                    name: name.clone(),
                    args,
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let name = match ctx.mapping.tool_name(tool_use_id) {
                    Some(name) => name.to_string(),
                    None => {
                        trace.warn(format!(
                            "No tool call recorded for result '{tool_use_id}'; using the id as name"
                        ));
                        tool_use_id.clone()
                    }
                };
                parts.push(GeminiPart::FunctionResponse(GeminiFunctionResponse {
                    id: tool_use_id.clone(),
                    name,
                    response: function_response(content.as_ref(), *is_error),
                }));
            }
            ContentBlock::Image { .. }
            | ContentBlock::Thinking { .. }
            | ContentBlock::Unsupported => {
                unmapped(msg_index, block_index, block, trace);
            }
        }
    }
    parts
}

/// `functionResponse.response` for a tool result.
fn function_response(content: Option<&ToolResultContent>, is_error: bool) -> Value {
    let mut map = Map::new();
    let texts = content.map(ToolResultContent::texts).unwrap_or_default();
    let errored = is_error || texts.iter().any(|text| text.starts_with("Error:"));
    if errored {
        map.insert("error".to_string(), Value::String(texts.join("\n")));
        map.insert("is_error".to_string(), Value::Bool(true));
        return Value::Object(map);
    }
    let result = match content {
        None => String::new(),
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Blocks(_)) => texts.join("\n"),
    };
    map.insert("result".to_string(), Value::String(result));
    Value::Object(map)
}

fn encode_tools(
    request: &CanonicalRequest,
    trace: &mut TransformTrace,
) -> Vec<GeminiFunctionDeclaration> {
    let mut declarations = Vec::with_capacity(request.tools.len());
    for (index, tool) in request.tools.iter().enumerate() {
        if tool.kind.as_deref().is_some_and(|kind| kind != "custom") {
            trace.audit.add_unmapped_source_path(&format!("/tools/{index}"));
            trace.warn(format!("Dropped builtin tool '{}'", tool.name));
            continue;
        }
        let outcome = sanitize_schema(&tool.input_schema);
        if !outcome.is_lossless() {
            tracing::debug!(
                tool = %tool.name,
                removed = outcome.removed_paths.len(),
                "narrowed tool schema for gemini"
            );
        }
        for path in &outcome.removed_paths {
            trace.audit.add_unmapped_source_path(&format!(
                "/tools/{index}/input_schema/{}",
                path.replace('.', "/")
            ));
        }
        for warning in outcome.warnings {
            trace.warn(format!("Tool '{}': {warning}", tool.name));
        }
        if !outcome.removed_paths.is_empty() {
            let removed: Vec<Value> = outcome
                .removed_paths
                .iter()
                .cloned()
                .map(Value::String)
                .collect();
            trace.set_metadata(&format!("removedSchemaFields.{}", tool.name), removed);
        }
        declarations.push(GeminiFunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: outcome.schema,
        });
    }
    declarations
}

/// Function calls and responses of a rendered Gemini body, in order.
#[must_use]
pub fn call_items(body: &Value) -> Vec<CallItem> {
    let mut items = Vec::new();
    let Some(contents) = body.get("contents").and_then(Value::as_array) else {
        return items;
    };
    for (content_index, content) in contents.iter().enumerate() {
        let Some(parts) = content.get("parts").and_then(Value::as_array) else {
            continue;
        };
        for (part_index, part) in parts.iter().enumerate() {
            let path = format!("/contents/{content_index}/parts/{part_index}");
            if let Some(call) = part.get("functionCall") {
                items.push(CallItem {
                    kind: CallItemKind::Call,
                    path,
                    call_id: str_at(call, "/id"),
                    name: str_at(call, "/name"),
                    arguments: call
                        .get("args")
                        .filter(|args| !args.is_null())
                        .map(Value::to_string),
                    has_output: false,
                    fields: CALL_FIELDS,
                });
            } else if let Some(response) = part.get("functionResponse") {
                items.push(CallItem {
                    kind: CallItemKind::Output,
                    path,
                    call_id: str_at(response, "/id"),
                    name: str_at(response, "/name"),
                    arguments: None,
                    has_output: response.get("response").is_some_and(|value| !value.is_null()),
                    fields: RESPONSE_FIELDS,
                });
            }
        }
    }
    items
}
