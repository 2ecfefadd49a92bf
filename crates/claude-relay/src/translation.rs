//! Anthropic <-> OpenAI translation.
//!
//! This module implements the core format conversions:
//! - Anthropic `/v1/messages` request -> OpenAI `chat/completions` request
//! - OpenAI `chat/completions` response -> Anthropic `/v1/messages` response
//!
//! Both directions are pure: no I/O, no shared state.

use crate::error::TranslationError;
use crate::openai::{
    ChatCompletion, ChatCompletionRequest, ChatFunction, ChatMessage, ChatRole, ChatTool,
};
use crate::types::{ContentBlock, MessagesRequest, MessagesResponse, Role, Usage};

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Upstream model used for any name missing from [`MODEL_MAP`].
pub const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";

/// Anthropic model id -> upstream model id.
pub const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-3-5-haiku-20241022", "anthropic/claude-3.5-haiku"),
    ("claude-3-5-sonnet-20241022", "anthropic/claude-3.5-sonnet"),
    ("claude-3-5-sonnet-20240620", "anthropic/claude-3.5-sonnet"),
    ("claude-3-7-sonnet-20250219", "anthropic/claude-3.7-sonnet"),
    ("claude-3-opus-20240229", "anthropic/claude-3-opus"),
    ("claude-3-haiku-20240307", "anthropic/claude-3-haiku"),
    ("claude-sonnet-4-20250514", "anthropic/claude-sonnet-4"),
    ("claude-opus-4-20250514", "anthropic/claude-opus-4"),
];

pub const STOP_END_TURN: &str = "end_turn";
pub const STOP_TOOL_USE: &str = "tool_use";

/// Resolve the upstream model name. Unknown names fall back to [`DEFAULT_MODEL`].
pub fn map_model(model: &str) -> &'static str {
    MODEL_MAP
        .iter()
        .find(|(from, _)| *from == model)
        .map(|(_, to)| *to)
        .unwrap_or(DEFAULT_MODEL)
}

/// Map an OpenAI finish reason to an Anthropic stop reason.
///
/// Only `stop` is rewritten; anything else is forwarded as-is.
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "stop" => STOP_END_TURN.to_string(),
        other => other.to_string(),
    }
}

/// Convert an Anthropic Messages request into an OpenAI `chat/completions` request.
pub fn convert_request(req: &MessagesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = &req.system {
        let text = system.to_plaintext();
        if !text.is_empty() {
            messages.push(ChatMessage {
                role: ChatRole::System,
                content: text,
            });
        }
    }

    messages.extend(req.messages.iter().map(|m| ChatMessage {
        role: match m.role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        },
        content: m.content.flatten(),
    }));

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| ChatTool {
                kind: "function".to_string(),
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    });

    ChatCompletionRequest {
        model: map_model(&req.model).to_string(),
        messages,
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: req.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        stream: req.is_streaming(),
        top_p: req.top_p,
        stop: req.stop_sequences.clone(),
        tools,
        tool_choice: req.tool_choice.clone(),
    }
}

/// Convert an OpenAI chat completion into an Anthropic Messages response.
pub fn convert_response(resp: ChatCompletion) -> Result<MessagesResponse, TranslationError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(TranslationError::MissingChoice)?;

    let tool_calls = choice
        .message
        .tool_calls
        .filter(|calls| !calls.is_empty());

    let (content, stop_reason) = match tool_calls {
        Some(calls) => {
            let blocks = calls
                .into_iter()
                .map(|call| {
                    let input = serde_json::from_str(&call.function.arguments).map_err(
                        |source| TranslationError::MalformedToolArguments {
                            id: call.id.clone(),
                            source,
                        },
                    )?;
                    Ok(ContentBlock::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input,
                    })
                })
                .collect::<Result<Vec<_>, TranslationError>>()?;
            (blocks, Some(STOP_TOOL_USE.to_string()))
        }
        None => (
            vec![ContentBlock::Text {
                text: choice.message.content.unwrap_or_default(),
            }],
            choice.finish_reason.as_deref().map(map_finish_reason),
        ),
    };

    Ok(MessagesResponse {
        id: resp
            .id
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        kind: "message".to_string(),
        role: Role::Assistant,
        content,
        model: resp.model.unwrap_or_default(),
        stop_reason,
        usage: resp.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
    })
}
