use serde_json::Value;

use super::{
    ResponsesInputContent, ResponsesInputItem, ResponsesReasoning, ResponsesRequest,
    ResponsesTool, ResponsesToolChoice,
};
use crate::error::GatewayError;
use crate::protocol::canonical::{
    CanonicalRequest, ContentBlock, Role, ThinkingConfig, ToolChoice, ToolResultContent,
};
use crate::protocol::mapping::image_ref;
use crate::protocol::openai_chat::encoder::{compact_arguments, str_at, unmapped};
use crate::protocol::schema::apply_tool_schema_policy;
use crate::transform::request::RenderContext;
use crate::transform::trace::{DefaultSource, TransformTrace};
use crate::transform::validate::{CallItem, CallItemFields, CallItemKind};

const REASONING_INCLUDE: &str = "reasoning.encrypted_content";
const WEB_SEARCH_TOOL: &str = "web_search_20250305";

const FIELDS: CallItemFields = CallItemFields {
    call_id: "call_id",
    name: "name",
    arguments: "arguments",
    output: "output",
};

/// Encode a canonical request as a Responses API body.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if the wire body cannot be serialized.
pub fn encode_request(
    request: &CanonicalRequest,
    ctx: &RenderContext<'_>,
    trace: &mut TransformTrace,
) -> Result<Value, GatewayError> {
    let config = &ctx.config.responses;
    let system = request.system_text();

    let mut input = Vec::with_capacity(request.messages.len() + 1);
    let instructions = match (config.instructions_template.as_deref(), system) {
        (Some(template), system) if !template.trim().is_empty() => {
            trace.audit.add_defaulted(
                "/instructions",
                DefaultSource::Template,
                "configured instructions template",
            );
            if let Some(system) = system {
                input.push(ResponsesInputItem::Message {
                    role: "developer",
                    content: vec![ResponsesInputContent::InputText { text: system }],
                });
                trace.audit.add_defaulted(
                    "/input/0",
                    DefaultSource::Inferred,
                    "system text moved to a developer message",
                );
            }
            template.to_string()
        }
        (_, Some(system)) => system,
        (_, None) => {
            trace.audit.add_defaulted(
                "/instructions",
                DefaultSource::ProtocolDefault,
                "no system text",
            );
            String::new()
        }
    };

    for (msg_index, message) in request.messages.iter().enumerate() {
        encode_message(msg_index, message.role, &message.blocks(), ctx, &mut input, trace);
    }

    let tools = encode_tools(request, ctx, trace);
    if tools.is_empty() {
        trace
            .audit
            .add_defaulted("/tools", DefaultSource::ProtocolDefault, "no tools declared");
    }
    let tool_choice = match &request.tool_choice {
        None | Some(ToolChoice::Auto) => {
            if request.tool_choice.is_none() {
                trace.audit.add_defaulted(
                    "/tool_choice",
                    DefaultSource::ProtocolDefault,
                    "tool_choice is required",
                );
            }
            ResponsesToolChoice::Mode("auto")
        }
        Some(ToolChoice::Any) => ResponsesToolChoice::Mode("required"),
        Some(ToolChoice::None) => ResponsesToolChoice::Mode("none"),
        Some(ToolChoice::Tool { name }) => ResponsesToolChoice::Function {
            type_: "function",
            name: ctx.tool_names.shorten(name, ctx.config.tool_name_limit),
        },
    };
    trace.audit.add_defaulted(
        "/parallel_tool_calls",
        DefaultSource::ProtocolDefault,
        "tool calls are replayed one at a time",
    );
    trace
        .audit
        .add_defaulted("/store", DefaultSource::ProtocolDefault, "stateless upstream");

    let include = if config.include_reasoning_content {
        trace
            .audit
            .add_defaulted("/include", DefaultSource::Config, "encrypted reasoning requested");
        vec![REASONING_INCLUDE]
    } else {
        Vec::new()
    };

    let effort = reasoning_effort(request.thinking.as_ref(), config.reasoning_effort.as_deref());
    trace
        .audit
        .add_defaulted("/reasoning", DefaultSource::Inferred, format!("effort {effort}"));

    let prompt_cache_key = request
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.user_id.as_deref())
        .and_then(session_cache_key);
    if prompt_cache_key.is_some() {
        trace.audit.add_defaulted(
            "/prompt_cache_key",
            DefaultSource::Inferred,
            "session from metadata.user_id",
        );
    }

    for (field, present) in [
        ("/max_tokens", request.sampling.max_tokens.is_some()),
        ("/temperature", request.sampling.temperature.is_some()),
        ("/top_p", request.sampling.top_p.is_some()),
        ("/top_k", request.sampling.top_k.is_some()),
        ("/stop_sequences", request.sampling.stop_sequences.is_some()),
    ] {
        if present {
            trace.audit.add_unmapped_source_path(field);
        }
    }

    let wire = ResponsesRequest {
        model: request.model.clone(),
        instructions,
        input,
        tools,
        tool_choice,
        parallel_tool_calls: false,
        reasoning: ResponsesReasoning {
            effort: effort.to_string(),
            summary: "auto",
        },
        store: false,
        stream: request.stream,
        include,
        prompt_cache_key,
    };
    serde_json::to_value(wire).map_err(|err| GatewayError::Internal(err.to_string()))
}

fn encode_message(
    msg_index: usize,
    role: Role,
    blocks: &[ContentBlock],
    ctx: &RenderContext<'_>,
    out: &mut Vec<ResponsesInputItem>,
    trace: &mut TransformTrace,
) {
    let (role_name, assistant) = match role {
        Role::User => ("user", false),
        Role::Assistant => ("assistant", true),
    };
    let mut content: Vec<ResponsesInputContent> = Vec::new();

    let flush = |content: &mut Vec<ResponsesInputContent>, out: &mut Vec<ResponsesInputItem>| {
        if !content.is_empty() {
            out.push(ResponsesInputItem::Message {
                role: role_name,
                content: std::mem::take(content),
            });
        }
    };

    for (block_index, block) in blocks.iter().enumerate() {
        match block {
            ContentBlock::Text { text } => push_text(&mut content, text, assistant),
            ContentBlock::Image { source } if !assistant => match image_ref(source) {
                Some(image) => content.push(ResponsesInputContent::InputImage {
                    image_url: image.to_url(),
                }),
                None => unmapped(msg_index, block_index, block, trace),
            },
            ContentBlock::ToolUse { id, name, input } => {
                flush(&mut content, out);
                out.push(ResponsesInputItem::FunctionCall {
                    call_id: id.clone(),
                    name: ctx.tool_names.shorten(name, ctx.config.tool_name_limit),
                    arguments: compact_arguments(input),
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content: result,
                ..
            } => {
                flush(&mut content, out);
                out.push(ResponsesInputItem::FunctionCallOutput {
                    call_id: tool_use_id.clone(),
                    output: tool_output(result.as_ref()),
                });
            }
            ContentBlock::Image { .. }
            | ContentBlock::Thinking { .. }
            | ContentBlock::Unsupported => {
                unmapped(msg_index, block_index, block, trace);
            }
        }
    }
    flush(&mut content, out);
}

/// Adjacent text parts merge into one.
fn push_text(content: &mut Vec<ResponsesInputContent>, text: &str, assistant: bool) {
    match content.last_mut() {
        Some(ResponsesInputContent::InputText { text: last }) if !assistant => last.push_str(text),
        Some(ResponsesInputContent::OutputText { text: last }) if assistant => last.push_str(text),
        _ => content.push(if assistant {
            ResponsesInputContent::OutputText {
                text: text.to_string(),
            }
        } else {
            ResponsesInputContent::InputText {
                text: text.to_string(),
            }
        }),
    }
}

/// String output for a tool result: text as-is, text blocks joined,
/// anything richer serialized as JSON.
fn tool_output(content: Option<&ToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(blocks @ ToolResultContent::Blocks(items)) => {
            if items
                .iter()
                .all(|block| matches!(block, ContentBlock::Text { .. }))
            {
                blocks.joined_text("\n")
            } else {
                serde_json::to_string(items).unwrap_or_default()
            }
        }
    }
}

fn encode_tools(
    request: &CanonicalRequest,
    ctx: &RenderContext<'_>,
    trace: &mut TransformTrace,
) -> Vec<ResponsesTool> {
    let mut tools = Vec::with_capacity(request.tools.len());
    for (index, tool) in request.tools.iter().enumerate() {
        let path = format!("/tools/{index}");
        if tool.kind.as_deref() == Some(WEB_SEARCH_TOOL) || tool.name == WEB_SEARCH_TOOL {
            trace.audit.add_defaulted(
                &format!("{path}/type"),
                DefaultSource::Inferred,
                "builtin web search maps to the upstream web_search tool",
            );
            tools.push(ResponsesTool::WebSearch {});
            continue;
        }
        if tool.kind.as_deref().is_some_and(|kind| kind != "custom") {
            trace.audit.add_unmapped_source_path(&path);
            trace.warn(format!("Dropped builtin tool '{}'", tool.name));
            continue;
        }
        if tool.name.is_empty() {
            trace.audit.add_unmapped_source_path(&path);
            trace.set_metadata("skippedToolWithMissingName", true);
            continue;
        }
        let (parameters, removed) =
            apply_tool_schema_policy(&tool.input_schema, &ctx.config.tool_schema);
        for key in removed {
            trace
                .audit
                .add_unmapped_source_path(&format!("{path}/input_schema/{key}"));
        }
        tools.push(ResponsesTool::Function {
            name: ctx.tool_names.shorten(&tool.name, ctx.config.tool_name_limit),
            description: tool.description.clone(),
            strict: ctx.config.tool_schema.strict,
            parameters,
        });
    }
    tools
}

/// Effort from the client's thinking budget, else the configured value, else `medium`.
fn reasoning_effort<'a>(thinking: Option<&ThinkingConfig>, configured: Option<&'a str>) -> &'a str {
    let fallback = configured.unwrap_or("medium");
    match thinking {
        Some(thinking) if thinking.kind == "enabled" => match thinking.budget_tokens {
            Some(budget) if budget >= 20_000 => "high",
            Some(budget) if budget >= 5_000 => "medium",
            Some(_) => "low",
            None => fallback,
        },
        _ => fallback,
    }
}

/// `prompt_cache_key` from a client user id: the part after `_session_`,
/// else the first 32 characters.
fn session_cache_key(user_id: &str) -> Option<String> {
    if user_id.is_empty() {
        return None;
    }
    match user_id.split_once("_session_") {
        Some((_, session)) => Some(session.to_string()),
        None => Some(user_id.chars().take(32).collect()),
    }
}

/// Function calls and outputs of a rendered Responses body, in order.
#[must_use]
pub fn call_items(body: &Value) -> Vec<CallItem> {
    let Some(input) = body.get("input").and_then(Value::as_array) else {
        return Vec::new();
    };
    input
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let path = format!("/input/{index}");
            match item.get("type").and_then(Value::as_str)? {
                "function_call" | "custom_tool_call" => Some(CallItem {
                    kind: CallItemKind::Call,
                    path,
                    call_id: str_at(item, "/call_id"),
                    name: str_at(item, "/name"),
                    arguments: str_at(item, "/arguments").or_else(|| str_at(item, "/input")),
                    has_output: false,
                    fields: FIELDS,
                }),
                "function_call_output" | "custom_tool_call_output" => Some(CallItem {
                    kind: CallItemKind::Output,
                    path,
                    call_id: str_at(item, "/call_id"),
                    name: None,
                    arguments: None,
                    has_output: item.get("output").is_some_and(|output| !output.is_null()),
                    fields: FIELDS,
                }),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformConfig;
    use crate::protocol::canonical::ToolCallMapping;
    use crate::protocol::tool_name::ShortNameMap;
    use serde_json::json;

    fn render_with(request: Value, config: &TransformConfig) -> (Value, TransformTrace) {
        let request: CanonicalRequest = serde_json::from_value(request).unwrap();
        let mapping = ToolCallMapping::new();
        let names = ShortNameMap::build(
            request.tools.iter().map(|tool| tool.name.as_str()),
            config.tool_name_limit,
        );
        let ctx = RenderContext {
            config,
            mapping: &mapping,
            tool_names: &names,
        };
        let mut trace = TransformTrace::new("codex", "Codex");
        let body = encode_request(&request, &ctx, &mut trace).unwrap();
        (body, trace)
    }

    fn render(request: Value) -> (Value, TransformTrace) {
        render_with(request, &TransformConfig::default())
    }

    #[test]
    fn test_plain_user_message_and_defaults() {
        let (body, trace) = render(json!({
            "model": "gpt-5-codex",
            "messages": [{"role": "user", "content": "Hello, how are you?"}]
        }));
        assert_eq!(
            body["input"],
            json!([{"type": "message", "role": "user", "content": [
                {"type": "input_text", "text": "Hello, how are you?"}
            ]}])
        );
        assert_eq!(body["tools"], json!([]));
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["parallel_tool_calls"], false);
        assert_eq!(body["store"], false);
        assert_eq!(body["include"], json!(["reasoning.encrypted_content"]));
        assert_eq!(body["reasoning"], json!({"effort": "medium", "summary": "auto"}));
        assert!(trace
            .audit
            .defaulted
            .iter()
            .any(|entry| entry.path == "/tool_choice"));
    }

    #[test]
    fn test_template_moves_system_to_developer_message() {
        let mut config = TransformConfig::default();
        config.responses.instructions_template = Some("You are Codex.".into());
        let (body, _) = render_with(
            json!({
                "model": "gpt-5-codex",
                "system": "project rules",
                "messages": [{"role": "user", "content": "hi"}]
            }),
            &config,
        );
        assert_eq!(body["instructions"], "You are Codex.");
        assert_eq!(body["input"][0]["role"], "developer");
        assert_eq!(body["input"][0]["content"][0]["text"], "project rules");
        assert_eq!(body["input"][1]["role"], "user");
    }

    #[test]
    fn test_tool_names_are_shortened() {
        let long = format!("mcp__server__{}", "x".repeat(70));
        let (body, _) = render(json!({
            "model": "gpt-5-codex",
            "tools": [{"name": long, "input_schema": {"type": "object"}}],
            "messages": [
                {"role": "assistant", "content": [{"type": "tool_use", "id": "t1", "name": long, "input": {}}]},
                {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": [{"type": "text", "text": "ok"}]}]}
            ]
        }));
        let short = body["tools"][0]["name"].as_str().unwrap();
        assert!(short.chars().count() <= 64);
        assert_eq!(body["input"][0]["name"], short);
        assert_eq!(body["input"][1]["output"], "ok");
        assert_eq!(body["tools"][0]["strict"], false);
    }

    #[test]
    fn test_reasoning_effort_and_cache_key() {
        let (body, _) = render(json!({
            "model": "gpt-5-codex",
            "thinking": {"type": "enabled", "budget_tokens": 24000},
            "metadata": {"user_id": "user_abc_account__session_1234-5678"},
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(body["reasoning"]["effort"], "high");
        assert_eq!(body["prompt_cache_key"], "1234-5678");
    }

    #[test]
    fn test_web_search_builtin_maps_to_upstream_tool() {
        let (body, trace) = render(json!({
            "model": "gpt-5-codex",
            "tools": [
                {"type": "web_search_20250305", "name": "web_search"},
                {"type": "bash_20250124", "name": "bash"}
            ],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(body["tools"], json!([{"type": "web_search"}]));
        assert!(trace.audit.unmapped_source_paths.contains(&"/tools/1".to_string()));
    }

    #[test]
    fn test_call_items_extracts_pairs() {
        let items = call_items(&json!({"input": [
            {"type": "message", "role": "user", "content": []},
            {"type": "function_call", "call_id": "a", "name": "f", "arguments": "{}"},
            {"type": "function_call_output", "call_id": "a", "output": "done"}
        ]}));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path, "/input/1");
        assert_eq!(items[1].kind, CallItemKind::Output);
        assert!(items[1].has_output);
    }
}
