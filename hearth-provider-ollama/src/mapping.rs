//! Mapping between canonical messages and Ollama's `/api/chat` format.

use std::sync::atomic::{AtomicU64, Ordering};

use hearth_types::{
    ContentPart, Message, ProviderError, ProviderRequest, ProviderResponse, Role, StopReason,
    TokenUsage,
};

/// Ollama never returns tool-call ids, so every call gets a fabricated
/// `tu_<n>` in emission order. The counter lives on the driver instance;
/// drivers are built fresh per job, keeping the sequence scoped to one
/// tool-loop invocation and results matchable by position.
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

/// Build the `/api/chat` request body.
pub fn to_api_request(request: &ProviderRequest, default_model: &str) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::new();

    if let Some(system) = &request.system {
        messages.push(serde_json::json!({"role": "system", "content": system}));
    }
    messages.extend(map_messages(&request.messages));

    let mut body = serde_json::json!({
        "model": request.model.as_deref().unwrap_or(default_model),
        "messages": messages,
        "stream": false,
    });

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

    let mut options = serde_json::Map::new();
    if let Some(temperature) = request.temperature {
        options.insert("temperature".into(), serde_json::Value::from(temperature));
    }
    if let Some(max_tokens) = request.max_tokens {
        options.insert("num_predict".into(), serde_json::Value::from(max_tokens));
    }
    if !options.is_empty() {
        body["options"] = serde_json::Value::Object(options);
    }

    body
}

/// Map canonical messages to Ollama's message array.
fn map_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    for msg in messages {
        let role_str = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };

        let mut text = String::new();
        let mut tool_calls: Vec<serde_json::Value> = Vec::new();
        let mut tool_results: Vec<String> = Vec::new();

        for part in &msg.content {
            match part {
                ContentPart::Text { text: t } => text.push_str(t),
                ContentPart::ToolUse { name, input, .. } => {
                    // Ollama's history shape has no id field; pairing is
                    // positional on the way back.
                    tool_calls.push(serde_json::json!({
                        "function": {"name": name, "arguments": input}
                    }));
                }
                ContentPart::ToolResult {
                    content, is_error, ..
                } => {
                    let body = if *is_error {
                        format!("Error: {content}")
                    } else {
                        content.clone()
                    };
                    tool_results.push(body);
                }
                ContentPart::Image { .. } => {}
            }
        }

        for content in tool_results {
            out.push(serde_json::json!({"role": "tool", "content": content}));
        }

        if !text.is_empty() || !tool_calls.is_empty() {
            let mut message = serde_json::json!({"role": role_str, "content": text});
            if !tool_calls.is_empty() {
                message["tool_calls"] = serde_json::Value::Array(tool_calls);
            }
            out.push(message);
        }
    }
    out
}

// ─── Response mapping ─────────────────────────────────────────────────────────

/// Parse an `/api/chat` response into a [`ProviderResponse`].
///
/// # Errors
///
/// Returns [`ProviderError::InvalidResponse`] if required fields are
/// missing or malformed.
pub fn from_api_response(
    body: &serde_json::Value,
    ids: &IdSequence,
) -> Result<ProviderResponse, ProviderError> {
    let model = body["model"]
        .as_str()
        .ok_or_else(|| ProviderError::InvalidResponse("missing 'model' in response".into()))?
        .to_string();

    let message_obj = &body["message"];

    let mut content: Vec<ContentPart> = Vec::new();

    let text = message_obj["content"].as_str().unwrap_or_default();
    if !text.is_empty() {
        content.push(ContentPart::Text { text: text.into() });
    }

    let mut saw_tool_calls = false;
    if let Some(tool_calls) = message_obj["tool_calls"].as_array() {
        for tc in tool_calls {
            saw_tool_calls = true;
            let function = &tc["function"];
            content.push(ContentPart::ToolUse {
                id: ids.next_id(),
                name: function["name"].as_str().unwrap_or_default().to_string(),
                input: function["arguments"].clone(),
            });
        }
    }

    let stop_reason = match body["done_reason"].as_str() {
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") => StopReason::ToolUse,
        _ if saw_tool_calls => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    };

    let usage = TokenUsage {
        input_tokens: body["prompt_eval_count"].as_u64().unwrap_or(0),
        output_tokens: body["eval_count"].as_u64().unwrap_or(0),
    };

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
