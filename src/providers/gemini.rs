use bytes::Bytes;
use reqwest::RequestBuilder;
use serde_json::{json, Map, Value};

use super::{Provider, StreamState};
use crate::config::{KeyPool, ProviderConfig};
use crate::proxy::error::RelayError;
use crate::proxy::streaming;

/// Gemini (generativelanguage.googleapis.com). Unlike the OpenAI family it
/// has its own wire dialect: per-model URLs, `?key=` auth, `contents` with
/// `user`/`model` roles, and usage under `usageMetadata`.
pub struct GeminiProvider {
    cfg: ProviderConfig,
    keys: KeyPool,
}

impl GeminiProvider {
    pub fn new(cfg: ProviderConfig) -> Self {
        let keys = KeyPool::from_entry(&cfg.api_key);
        Self { cfg, keys }
    }
}

impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn endpoint(&self) -> &str {
        &self.cfg.api_base
    }

    fn api_key(&self) -> Option<String> {
        self.keys.next()
    }

    fn allows_model(&self, model: &str) -> bool {
        self.cfg.allows(model)
    }

    fn request_url(&self, model: &str, stream: bool) -> String {
        let base = self.cfg.api_base.trim_end_matches('/');
        if stream {
            format!("{base}/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/models/{model}:generateContent")
        }
    }

    fn apply_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_key() {
            Some(key) => builder.query(&[("key", key)]),
            None => builder,
        }
    }

    fn transform_request(&self, body: Value) -> Result<Value, RelayError> {
        anthropic_to_gemini(&body)
    }

    fn transform_response(&self, body: Value) -> Result<Value, RelayError> {
        gemini_to_anthropic(&body)
    }

    fn transform_stream(&self, chunk: &[u8], state: &mut StreamState) -> Result<Bytes, RelayError> {
        Ok(translate_gemini_chunk(chunk, state))
    }

    fn finish_stream(&self, state: &mut StreamState) -> Result<Bytes, RelayError> {
        let mut out = String::new();
        if !state.buffer.is_empty() {
            let rest = std::mem::take(&mut state.buffer);
            process_gemini_line(rest.trim_end_matches(['\n', '\r']), state, &mut out);
        }
        streaming::emit_terminal(state, &mut out);
        Ok(Bytes::from(out))
    }
}

fn anthropic_to_gemini(anthropic: &Value) -> Result<Value, RelayError> {
    let mut request = Map::new();

    if let Some(system) = anthropic.get("system") {
        let text = match system {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        if !text.is_empty() {
            request.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": text}]}),
            );
        }
    }

    // tool_result 只带 tool_use_id；functionResponse 需要函数名，先建映射
    let mut tool_names: std::collections::HashMap<String, String> = Default::default();
    if let Some(messages) = anthropic.get("messages").and_then(|m| m.as_array()) {
        for msg in messages {
            if let Some(blocks) = msg.get("content").and_then(|c| c.as_array()) {
                for block in blocks {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                        if let (Some(id), Some(name)) = (
                            block.get("id").and_then(|v| v.as_str()),
                            block.get("name").and_then(|v| v.as_str()),
                        ) {
                            tool_names.insert(id.to_string(), name.to_string());
                        }
                    }
                }
            }
        }
    }

    let mut contents = Vec::new();
    if let Some(messages) = anthropic.get("messages").and_then(|m| m.as_array()) {
        for msg in messages {
            let role = match msg.get("role").and_then(|r| r.as_str()) {
                Some("assistant") => "model",
                _ => "user",
            };
            let parts = convert_parts(msg.get("content"), &tool_names);
            if !parts.is_empty() {
                contents.push(json!({"role": role, "parts": parts}));
            }
        }
    }
    request.insert("contents".to_string(), json!(contents));

    let mut generation = Map::new();
    if let Some(v) = anthropic.get("max_tokens") {
        generation.insert("maxOutputTokens".to_string(), v.clone());
    }
    if let Some(v) = anthropic.get("temperature") {
        generation.insert("temperature".to_string(), v.clone());
    }
    if let Some(v) = anthropic.get("top_p") {
        generation.insert("topP".to_string(), v.clone());
    }
    if let Some(v) = anthropic.get("stop_sequences") {
        generation.insert("stopSequences".to_string(), v.clone());
    }
    if !generation.is_empty() {
        request.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if let Some(tools) = anthropic.get("tools").and_then(|t| t.as_array()) {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.get("name").unwrap_or(&json!("")),
                    "description": tool.get("description").unwrap_or(&json!("")),
                    "parameters": tool.get("input_schema").unwrap_or(&json!({})),
                })
            })
            .collect();
        if !declarations.is_empty() {
            request.insert(
                "tools".to_string(),
                json!([{"functionDeclarations": declarations}]),
            );
        }
    }

    if let Some(tc) = anthropic.get("tool_choice") {
        request.insert("toolConfig".to_string(), convert_tool_choice(tc));
    }

    Ok(Value::Object(request))
}

fn convert_parts(
    content: Option<&Value>,
    tool_names: &std::collections::HashMap<String, String>,
) -> Vec<Value> {
    match content {
        Some(Value::String(s)) => vec![json!({"text": s})],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => Some(json!({"text": block.get("text").unwrap_or(&json!(""))})),
                Some("tool_use") => Some(json!({
                    "functionCall": {
                        "name": block.get("name").unwrap_or(&json!("")),
                        "args": block.get("input").unwrap_or(&json!({})),
                    }
                })),
                Some("tool_result") => {
                    let id = block
                        .get("tool_use_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    let name = tool_names.get(id).cloned().unwrap_or_else(|| id.to_string());
                    Some(json!({
                        "functionResponse": {
                            "name": name,
                            "response": {"content": result_text(block.get("content"))},
                        }
                    }))
                }
                Some("image") => block.get("source").map(|source| {
                    json!({
                        "inlineData": {
                            "mimeType": source.get("media_type").unwrap_or(&json!("image/png")),
                            "data": source.get("data").unwrap_or(&json!("")),
                        }
                    })
                }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn result_text(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn convert_tool_choice(tc: &Value) -> Value {
    let mode = |m: &str| json!({"functionCallingConfig": {"mode": m}});
    match tc {
        Value::String(s) => match s.as_str() {
            "any" => mode("ANY"),
            "none" => mode("NONE"),
            _ => mode("AUTO"),
        },
        Value::Object(obj) => match obj.get("type").and_then(|t| t.as_str()) {
            Some("tool") => json!({
                "functionCallingConfig": {
                    "mode": "ANY",
                    "allowedFunctionNames": [obj.get("name").unwrap_or(&json!(""))],
                }
            }),
            Some("any") => mode("ANY"),
            Some("none") => mode("NONE"),
            _ => mode("AUTO"),
        },
        _ => mode("AUTO"),
    }
}

fn gemini_to_anthropic(gemini: &Value) -> Result<Value, RelayError> {
    let empty = json!({});
    let candidate = gemini
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .unwrap_or(&empty);

    let mut content = Vec::new();
    let mut text_acc = String::new();
    let mut has_tool_use = false;

    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                text_acc.push_str(text);
            } else if let Some(call) = part.get("functionCall") {
                if !text_acc.is_empty() {
                    content.push(json!({"type": "text", "text": text_acc}));
                    text_acc = String::new();
                }
                has_tool_use = true;
                content.push(json!({
                    "type": "tool_use",
                    "id": format!("call_{}", uuid::Uuid::new_v4().simple()),
                    "name": call.get("name").unwrap_or(&json!("")),
                    "input": call.get("args").unwrap_or(&json!({})),
                }));
            }
        }
    }
    if !text_acc.is_empty() {
        content.push(json!({"type": "text", "text": text_acc}));
    }

    let finish_reason = candidate
        .get("finishReason")
        .and_then(|r| r.as_str())
        .unwrap_or("STOP");
    let stop_reason = if has_tool_use {
        "tool_use"
    } else {
        map_gemini_finish_reason(finish_reason)
    };

    let empty_usage = json!({});
    let usage = gemini.get("usageMetadata").unwrap_or(&empty_usage);
    let input_tokens = usage
        .get("promptTokenCount")
        .and_then(|t| t.as_u64())
        .unwrap_or(0);
    let output_tokens = usage
        .get("candidatesTokenCount")
        .and_then(|t| t.as_u64())
        .unwrap_or(0);

    Ok(json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": gemini.get("modelVersion").cloned().unwrap_or(json!("gemini")),
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
    }))
}

fn map_gemini_finish_reason(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "max_tokens",
        // STOP、SAFETY、RECITATION 等都折叠为 end_turn
        _ => "end_turn",
    }
}

/// Gemini streams `data: {candidates...}` SSE records without a `[DONE]`
/// sentinel; the connection simply closes after the last record.
fn translate_gemini_chunk(chunk: &[u8], state: &mut StreamState) -> Bytes {
    state.buffer.push_str(&String::from_utf8_lossy(chunk));

    let mut out = String::new();
    while let Some(pos) = state.buffer.find('\n') {
        let line: String = state.buffer.drain(..=pos).collect();
        process_gemini_line(line.trim_end_matches(['\n', '\r']), state, &mut out);
    }
    Bytes::from(out)
}

fn process_gemini_line(line: &str, state: &mut StreamState, out: &mut String) {
    let Some(payload) = line.strip_prefix("data:") else {
        return;
    };
    let payload = payload.trim();

    let parsed: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed Gemini SSE event");
            return;
        }
    };

    streaming::ensure_message_start(
        state,
        None,
        parsed.get("modelVersion").and_then(|v| v.as_str()),
        parsed
            .get("usageMetadata")
            .and_then(|u| u.get("promptTokenCount"))
            .and_then(|t| t.as_u64()),
        out,
    );

    if let Some(usage) = parsed.get("usageMetadata") {
        if let Some(tokens) = usage.get("candidatesTokenCount").and_then(|t| t.as_u64()) {
            state.output_tokens = tokens;
        }
        if let Some(tokens) = usage.get("promptTokenCount").and_then(|t| t.as_u64()) {
            state.input_tokens = tokens;
        }
    }

    let Some(candidate) = parsed
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return;
    };

    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        // functionCall 一次到齐，开新块后立刻送完整参数
        let mut tool_seq = state.content_blocks.len() as u64;
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if !text.is_empty() {
                    streaming::emit_text_delta(state, text, out);
                }
            } else if let Some(call) = part.get("functionCall") {
                let index = streaming::tool_block(
                    state,
                    tool_seq,
                    None,
                    call.get("name").and_then(|n| n.as_str()),
                    out,
                );
                tool_seq += 1;
                state.stop_reason = Some("tool_use".to_string());
                let args = call.get("args").cloned().unwrap_or(json!({}));
                let args_str = serde_json::to_string(&args).unwrap_or_default();
                streaming::emit_tool_arguments(state, index, &args_str, out);
            }
        }
    }

    if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
        if state.stop_reason.is_none() {
            state.stop_reason = Some(map_gemini_finish_reason(reason).to_string());
        }
        streaming::close_open_blocks(state, out);
    }
}
