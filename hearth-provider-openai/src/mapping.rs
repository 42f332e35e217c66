//! Mapping between canonical messages and the chat-completions wire format.
//!
//! Tool-call ids are the fragile part of this translation: some
//! compatible servers omit them entirely. [`IdSequence`] fabricates
//! `tu_<n>` ids in emission order, and because results are matched back
//! positionally against the last emitted list, pairing survives a server
//! that loses ids on the wire.

use std::sync::atomic::{AtomicU64, Ordering};

use hearth_types::{
    ContentPart, Message, ProviderError, ProviderRequest, ProviderResponse, Role, StopReason,
    TokenUsage,
};

/// Fabricates `tu_<n>` ids, scoped to one driver instance.
///
/// The runtime constructs a fresh driver per job, so the sequence is
/// effectively scoped to one tool-loop invocation.
#[derive(Default)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    /// Next fabricated id.
    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("tu_{n}")
    }
}

// ─── Request mapping ──────────────────────────────────────────────────────────

/// Build the chat-completions request body.
pub fn to_api_request(request: &ProviderRequest, default_model: &str) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::new();

    if let Some(system) = &request.system {
        messages.push(serde_json::json!({"role": "system", "content": system}));
    }

    for msg in &request.messages {
        map_message(msg, &mut messages);
    }

    let mut body = serde_json::json!({
        "model": request.model.as_deref().unwrap_or(default_model),
        "messages": messages,
    });

    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = serde_json::Value::from(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = serde_json::Value::from(temperature);
    }
    if !request.tools.is_empty() {
        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

/// Map one canonical message onto one or more wire messages.
///
/// Tool results cannot ride inside a user message on this protocol; each
/// becomes its own `role: "tool"` message referencing the call id.
fn map_message(msg: &Message, out: &mut Vec<serde_json::Value>) {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    let mut text = String::new();
    let mut tool_calls: Vec<serde_json::Value> = Vec::new();
    let mut tool_results: Vec<(String, String)> = Vec::new();

    for part in &msg.content {
        match part {
            ContentPart::Text { text: t } => text.push_str(t),
            ContentPart::ToolUse { id, name, input } => {
                tool_calls.push(serde_json::json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": input.to_string(),
                    }
                }));
            }
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let body = if *is_error {
                    format!("Error: {content}")
                } else {
                    content.clone()
                };
                tool_results.push((tool_use_id.clone(), body));
            }
            ContentPart::Image { .. } => {
                // Vision content goes to the vision provider, not through
                // the chat-completions text path.
            }
        }
    }

    for (tool_call_id, content) in tool_results {
        out.push(serde_json::json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "content": content,
        }));
    }

    if !text.is_empty() || !tool_calls.is_empty() {
        let mut message = serde_json::json!({"role": role, "content": text});
        if !tool_calls.is_empty() {
            message["tool_calls"] = serde_json::Value::Array(tool_calls);
        }
        out.push(message);
    }
}

// ─── Response mapping ─────────────────────────────────────────────────────────

/// Parse a chat-completions response into a [`ProviderResponse`].
///
/// # Errors
///
/// Returns [`ProviderError::InvalidResponse`] if required fields are
/// missing or malformed.
pub fn from_api_response(
    body: &serde_json::Value,
    ids: &IdSequence,
) -> Result<ProviderResponse, ProviderError> {
    let choice = body["choices"]
        .get(0)
        .ok_or_else(|| ProviderError::InvalidResponse("missing 'choices' in response".into()))?;
    let message_obj = &choice["message"];

    let mut content: Vec<ContentPart> = Vec::new();

    if let Some(text) = message_obj["content"].as_str() {
        if !text.is_empty() {
            content.push(ContentPart::Text { text: text.into() });
        }
    }

    let mut saw_tool_calls = false;
    if let Some(tool_calls) = message_obj["tool_calls"].as_array() {
        for tc in tool_calls {
            saw_tool_calls = true;
            let function = &tc["function"];
            let name = function["name"].as_str().unwrap_or_default().to_string();

            // Some compatible servers return arguments as a JSON string,
            // others inline the object.
            let input = match &function["arguments"] {
                serde_json::Value::String(s) => serde_json::from_str(s)
                    .unwrap_or_else(|_| serde_json::Value::String(s.clone())),
                other => other.clone(),
            };

            // Keep the server's id when present; fabricate positionally
            // when the wire lost it.
            let id = match tc["id"].as_str() {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => ids.next_id(),
            };

            content.push(ContentPart::ToolUse { id, name, input });
        }
    }

    let stop_reason = match choice["finish_reason"].as_str() {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ if saw_tool_calls => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    };

    let usage = TokenUsage {
        input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    };

    let model = body["model"].as_str().unwrap_or_default().to_string();

    Ok(ProviderResponse {
        message: Message {
            role: Role::Assistant,
            content,
        },
        stop_reason,
        usage,
        model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_types::ToolSchema;
    use serde_json::json;

    fn request_with(messages: Vec<Message>) -> ProviderRequest {
        ProviderRequest {
            model: None,
            messages,
            tools: vec![],
            max_tokens: None,
            temperature: None,
            system: None,
        }
    }

    #[test]
    fn system_prompt_becomes_first_message() {
        let mut request = request_with(vec![Message::user("hi")]);
        request.system = Some("be brief".into());
        let body = to_api_request(&request, "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[test]
    fn tool_definitions_are_wrapped_as_functions() {
        let mut request = request_with(vec![Message::user("hi")]);
        request.tools = vec![ToolSchema {
            name: "read-memory".into(),
            description: "Read the scratchpad".into(),
            input_schema: json!({"type": "object"}),
        }];
        let body = to_api_request(&request, "gpt-4o-mini");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "read-memory");
    }

    #[test]
    fn assistant_tool_use_maps_to_tool_calls() {
        let request = request_with(vec![Message {
            role: Role::Assistant,
            content: vec![ContentPart::ToolUse {
                id: "tu_0".into(),
                name: "call-service".into(),
                input: json!({"domain": "light"}),
            }],
        }]);
        let body = to_api_request(&request, "m");
        let tc = &body["messages"][0]["tool_calls"][0];
        assert_eq!(tc["id"], "tu_0");
        assert_eq!(tc["function"]["name"], "call-service");
        // Arguments travel as a JSON string on this protocol.
        assert!(tc["function"]["arguments"].is_string());
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let request = request_with(vec![Message {
            role: Role::User,
            content: vec![
                ContentPart::ToolResult {
                    tool_use_id: "tu_0".into(),
                    content: "ok".into(),
                    is_error: false,
                },
                ContentPart::ToolResult {
                    tool_use_id: "tu_1".into(),
                    content: "boom".into(),
                    is_error: true,
                },
            ],
        }]);
        let body = to_api_request(&request, "m");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "tool");
        assert_eq!(messages[0]["tool_call_id"], "tu_0");
        assert_eq!(messages[1]["content"], "Error: boom");
    }

    #[test]
    fn response_with_server_ids_keeps_them() {
        let ids = IdSequence::default();
        let body = json!({
            "model": "gpt-4o-mini",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "function": {"name": "echo", "arguments": "{\"x\":1}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        });
        let response = from_api_response(&body, &ids).unwrap();
        let uses = response.message.tool_uses();
        assert_eq!(uses[0].0, "call_abc");
        assert_eq!(uses[0].2, json!({"x": 1}));
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.usage.input_tokens, 7);
    }

    #[test]
    fn response_without_ids_fabricates_positionally() {
        let ids = IdSequence::default();
        let body = json!({
            "model": "local",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": "",
                    "tool_calls": [
                        {"function": {"name": "a", "arguments": "{}"}},
                        {"function": {"name": "b", "arguments": "{}"}}
                    ]
                }
            }],
            "usage": {}
        });
        let response = from_api_response(&body, &ids).unwrap();
        let uses = response.message.tool_uses();
        assert_eq!(uses[0].0, "tu_0");
        assert_eq!(uses[1].0, "tu_1");
    }

    #[test]
    fn fabricated_ids_stay_unique_across_turns() {
        let ids = IdSequence::default();
        let turn = json!({
            "model": "local",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"name": "a", "arguments": "{}"}}]
                }
            }],
            "usage": {}
        });
        let first = from_api_response(&turn, &ids).unwrap();
        let second = from_api_response(&turn, &ids).unwrap();
        assert_eq!(first.message.tool_uses()[0].0, "tu_0");
        assert_eq!(second.message.tool_uses()[0].0, "tu_1");
    }

    #[test]
    fn missing_finish_reason_with_tool_calls_is_tool_use() {
        let ids = IdSequence::default();
        let body = json!({
            "model": "local",
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"name": "a", "arguments": "{}"}}]
                }
            }],
            "usage": {}
        });
        let response = from_api_response(&body, &ids).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn plain_text_response() {
        let ids = IdSequence::default();
        let body = json!({
            "model": "gpt-4o-mini",
            "choices": [{
                "finish_reason": "stop",
                "message": {"content": "Hello there"}
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2}
        });
        let response = from_api_response(&body, &ids).unwrap();
        assert_eq!(response.message.text(), "Hello there");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn missing_choices_is_invalid() {
        let ids = IdSequence::default();
        let body = json!({"model": "m", "choices": []});
        assert!(from_api_response(&body, &ids).is_err());
    }

    #[test]
    fn unparseable_arguments_fall_back_to_string() {
        let ids = IdSequence::default();
        let body = json!({
            "model": "local",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"name": "a", "arguments": "not json"}}]
                }
            }],
            "usage": {}
        });
        let response = from_api_response(&body, &ids).unwrap();
        assert_eq!(response.message.tool_uses()[0].2, json!("not json"));
    }
}
