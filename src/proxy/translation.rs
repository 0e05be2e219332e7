use serde_json::{json, Value};

use super::error::RelayError;

/// Convert an Anthropic Messages request into an OpenAI Chat Completions
/// request.
pub fn anthropic_to_openai(anthropic: &Value) -> Result<Value, RelayError> {
    let mut messages = Vec::new();

    // System prompt（字符串或块数组）→ 开头的 system 消息
    if let Some(system) = anthropic.get("system") {
        let system_text = match system {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        if !system_text.is_empty() {
            messages.push(json!({"role": "system", "content": system_text}));
        }
    }

    if let Some(msgs) = anthropic.get("messages").and_then(|m| m.as_array()) {
        for msg in msgs {
            let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
            match role {
                "assistant" => convert_assistant_message(msg, &mut messages),
                _ => convert_user_message(msg, &mut messages),
            }
        }
    }

    let mut openai_req = json!({
        "model": anthropic.get("model").cloned().unwrap_or(json!("")),
        "messages": messages,
    });

    for key in ["max_tokens", "temperature", "top_p", "stream"] {
        if let Some(v) = anthropic.get(key) {
            openai_req[key] = v.clone();
        }
    }
    if let Some(stop) = anthropic.get("stop_sequences") {
        openai_req["stop"] = stop.clone();
    }

    if let Some(tools) = anthropic.get("tools").and_then(|t| t.as_array()) {
        let openai_tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").unwrap_or(&json!("")),
                        "description": tool.get("description").unwrap_or(&json!("")),
                        "parameters": tool.get("input_schema").unwrap_or(&json!({})),
                    }
                })
            })
            .collect();
        if !openai_tools.is_empty() {
            openai_req["tools"] = json!(openai_tools);
        }
    }

    if let Some(tc) = anthropic.get("tool_choice") {
        openai_req["tool_choice"] = convert_tool_choice(tc);
    }

    Ok(openai_req)
}

/// Assistant turn: text blocks fold into `content`, tool_use blocks become
/// `tool_calls` entries.
fn convert_assistant_message(msg: &Value, out: &mut Vec<Value>) {
    let mut assistant_msg = json!({"role": "assistant"});

    match msg.get("content") {
        Some(Value::Array(blocks)) => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();

            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        tool_calls.push(json!({
                            "id": block.get("id").unwrap_or(&json!("")),
                            "type": "function",
                            "function": {
                                "name": block.get("name").unwrap_or(&json!("")),
                                "arguments": serde_json::to_string(
                                    block.get("input").unwrap_or(&json!({}))
                                ).unwrap_or_default(),
                            }
                        }));
                    }
                    _ => {}
                }
            }

            if !text_parts.is_empty() {
                assistant_msg["content"] = json!(text_parts.join("\n"));
            }
            if !tool_calls.is_empty() {
                assistant_msg["tool_calls"] = json!(tool_calls);
            }
        }
        Some(content) => {
            assistant_msg["content"] = content.clone();
        }
        None => {}
    }

    out.push(assistant_msg);
}

/// User turn. Anthropic 把 tool_result 放在 user 消息里；OpenAI 要求独立的
/// role:"tool" 消息，所以先拆出来再接上剩余的用户内容。
fn convert_user_message(msg: &Value, out: &mut Vec<Value>) {
    let content = msg.get("content");

    let Some(Value::Array(blocks)) = content else {
        out.push(json!({
            "role": "user",
            "content": content.cloned().unwrap_or(json!("")),
        }));
        return;
    };

    let mut user_parts = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("tool_result") => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": block.get("tool_use_id").unwrap_or(&json!("")),
                    "content": content_to_string(block.get("content")),
                }));
            }
            Some("text") => {
                user_parts.push(json!({
                    "type": "text",
                    "text": block.get("text").unwrap_or(&json!("")),
                }));
            }
            Some("image") => {
                if let Some(source) = block.get("source") {
                    user_parts.push(json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!(
                                "data:{};base64,{}",
                                source.get("media_type").and_then(|m| m.as_str()).unwrap_or("image/png"),
                                source.get("data").and_then(|d| d.as_str()).unwrap_or("")
                            )
                        }
                    }));
                }
            }
            _ => {}
        }
    }

    if user_parts.is_empty() {
        return;
    }
    // 单个纯文本部分直接降级为字符串
    if user_parts.len() == 1 {
        if let Some(text) = user_parts[0].get("text") {
            out.push(json!({"role": "user", "content": text.clone()}));
            return;
        }
    }
    out.push(json!({"role": "user", "content": user_parts}));
}

fn content_to_string(content: Option<&Value>) -> String {
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
    match tc {
        Value::String(s) => match s.as_str() {
            "any" => json!("required"),
            "none" => json!("none"),
            _ => json!("auto"),
        },
        Value::Object(obj) => match obj.get("type").and_then(|t| t.as_str()) {
            Some("tool") => {
                let name = obj.get("name").cloned().unwrap_or(json!(""));
                json!({"type": "function", "function": {"name": name}})
            }
            Some("any") => json!("required"),
            Some("none") => json!("none"),
            _ => json!("auto"),
        },
        _ => json!("auto"),
    }
}

/// Convert a buffered OpenAI Chat Completions response into an Anthropic
/// message: one text block (if any), then one tool_use block per tool call.
pub fn openai_to_anthropic(openai: &Value) -> Result<Value, RelayError> {
    let empty_obj = json!({});
    let choice = openai
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .unwrap_or(&empty_obj);

    let message = choice.get("message").unwrap_or(&empty_obj);

    let mut content = Vec::new();

    if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }

    if let Some(tool_calls) = message.get("tool_calls").and_then(|tc| tc.as_array()) {
        for tc in tool_calls {
            let empty_func = json!({});
            let func = tc.get("function").unwrap_or(&empty_func);
            let args_str = func
                .get("arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("{}");
            let input: Value = serde_json::from_str(args_str).unwrap_or(json!({}));

            content.push(json!({
                "type": "tool_use",
                "id": tc.get("id").unwrap_or(&json!("")),
                "name": func.get("name").unwrap_or(&json!("")),
                "input": input,
            }));
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .unwrap_or("stop");

    let empty_usage = json!({});
    let usage = openai.get("usage").unwrap_or(&empty_usage);
    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(|t| t.as_u64())
        .unwrap_or(0);
    let output_tokens = usage
        .get("completion_tokens")
        .and_then(|t| t.as_u64())
        .unwrap_or(0);

    let mut anthropic_usage = json!({
        "input_tokens": input_tokens,
        "output_tokens": output_tokens,
    });
    if let Some(cached) = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|t| t.as_u64())
    {
        anthropic_usage["cache_read_input_tokens"] = json!(cached);
    }

    Ok(json!({
        "id": openai.get("id").cloned().unwrap_or(json!("msg_relay")),
        "type": "message",
        "role": "assistant",
        "model": openai.get("model").cloned().unwrap_or(json!("unknown")),
        "content": content,
        "stop_reason": map_finish_reason(finish_reason),
        "stop_sequence": null,
        "usage": anthropic_usage,
    }))
}

/// OpenAI finish_reason -> Anthropic stop_reason.
pub fn map_finish_reason(finish_reason: &str) -> &'static str {
    match finish_reason {
        "tool_calls" => "tool_use",
        "length" => "max_tokens",
        // stop 和 content_filter 都折叠为 end_turn
        _ => "end_turn",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- anthropic_to_openai ---

    #[test]
    fn test_basic_user_message() {
        let req = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hello"}],
            "max_tokens": 100
        });
        let result = anthropic_to_openai(&req).unwrap();
        assert_eq!(result["model"], "gpt-4o");
        assert_eq!(result["messages"][0]["role"], "user");
        assert_eq!(result["messages"][0]["content"], "hello");
        assert_eq!(result["max_tokens"], 100);
    }

    #[test]
    fn test_system_prompt_string() {
        let req = json!({
            "system": "You are helpful.",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let result = anthropic_to_openai(&req).unwrap();
        assert_eq!(result["messages"][0]["role"], "system");
        assert_eq!(result["messages"][0]["content"], "You are helpful.");
        assert_eq!(result["messages"][1]["role"], "user");
    }

    #[test]
    fn test_system_prompt_blocks() {
        let req = json!({
            "system": [
                {"type": "text", "text": "Part 1"},
                {"type": "text", "text": "Part 2"}
            ],
            "messages": []
        });
        let result = anthropic_to_openai(&req).unwrap();
        assert_eq!(result["messages"][0]["content"], "Part 1\nPart 2");
    }

    #[test]
    fn test_parameters_passthrough() {
        let req = json!({
            "messages": [],
            "max_tokens": 500,
            "temperature": 0.7,
            "top_p": 0.9,
            "stop_sequences": ["END"],
            "stream": true
        });
        let result = anthropic_to_openai(&req).unwrap();
        assert_eq!(result["max_tokens"], 500);
        assert_eq!(result["temperature"], 0.7);
        assert_eq!(result["top_p"], 0.9);
        assert_eq!(result["stop"][0], "END");
        assert_eq!(result["stream"], true);
    }

    #[test]
    fn test_assistant_with_tool_use() {
        let req = json!({
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "Let me search."},
                    {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "rust"}}
                ]
            }]
        });
        let result = anthropic_to_openai(&req).unwrap();
        let msg = &result["messages"][0];
        assert_eq!(msg["role"], "assistant");
        assert_eq!(msg["content"], "Let me search.");
        assert_eq!(msg["tool_calls"][0]["id"], "toolu_1");
        assert_eq!(msg["tool_calls"][0]["type"], "function");
        assert_eq!(msg["tool_calls"][0]["function"]["name"], "search");
        assert_eq!(
            msg["tool_calls"][0]["function"]["arguments"],
            "{\"q\":\"rust\"}"
        );
    }

    #[test]
    fn test_tool_result_becomes_tool_message() {
        let req = json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "42"},
                    {"type": "text", "text": "what next?"}
                ]
            }]
        });
        let result = anthropic_to_openai(&req).unwrap();
        let msgs = result["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "tool");
        assert_eq!(msgs[0]["tool_call_id"], "toolu_1");
        assert_eq!(msgs[0]["content"], "42");
        assert_eq!(msgs[1]["role"], "user");
        assert_eq!(msgs[1]["content"], "what next?");
    }

    #[test]
    fn test_tool_result_with_block_content() {
        let req = json!({
            "messages": [{
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "toolu_2",
                    "content": [{"type": "text", "text": "line 1"}, {"type": "text", "text": "line 2"}]
                }]
            }]
        });
        let result = anthropic_to_openai(&req).unwrap();
        assert_eq!(result["messages"][0]["content"], "line 1\nline 2");
    }

    #[test]
    fn test_tools_conversion() {
        let req = json!({
            "messages": [],
            "tools": [{
                "name": "get_weather",
                "description": "Get weather info",
                "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
            }]
        });
        let result = anthropic_to_openai(&req).unwrap();
        let tool = &result["tools"][0];
        assert_eq!(tool["type"], "function");
        assert_eq!(tool["function"]["name"], "get_weather");
        assert!(tool["function"]["parameters"]["properties"]["city"].is_object());
    }

    #[test]
    fn test_tool_choice_mappings() {
        let choose = |tc: Value| {
            let req = json!({"messages": [], "tool_choice": tc});
            anthropic_to_openai(&req).unwrap()["tool_choice"].clone()
        };
        assert_eq!(choose(json!({"type": "auto"})), json!("auto"));
        assert_eq!(choose(json!({"type": "any"})), json!("required"));
        assert_eq!(choose(json!("any")), json!("required"));
        assert_eq!(
            choose(json!({"type": "tool", "name": "my_tool"})),
            json!({"type": "function", "function": {"name": "my_tool"}})
        );
    }

    #[test]
    fn test_image_block() {
        let req = json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image", "source": {"media_type": "image/jpeg", "data": "abc123"}}
                ]
            }]
        });
        let result = anthropic_to_openai(&req).unwrap();
        let parts = result["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/jpeg;base64,abc123"
        );
    }

    // --- openai_to_anthropic ---

    #[test]
    fn test_openai_text_response() {
        let resp = json!({
            "id": "chatcmpl-123",
            "model": "gpt-4o",
            "choices": [{
                "message": {"role": "assistant", "content": "Hello!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        let result = openai_to_anthropic(&resp).unwrap();
        assert_eq!(result["id"], "chatcmpl-123");
        assert_eq!(result["type"], "message");
        assert_eq!(result["role"], "assistant");
        assert_eq!(result["model"], "gpt-4o");
        assert_eq!(result["content"][0]["type"], "text");
        assert_eq!(result["content"][0]["text"], "Hello!");
        assert_eq!(result["stop_reason"], "end_turn");
        assert_eq!(result["usage"]["input_tokens"], 10);
        assert_eq!(result["usage"]["output_tokens"], 5);
    }

    #[test]
    fn test_openai_tool_call_response() {
        let resp = json!({
            "id": "chatcmpl-456",
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Checking.",
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Tokyo\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 15}
        });
        let result = openai_to_anthropic(&resp).unwrap();
        assert_eq!(result["stop_reason"], "tool_use");
        // text 块在前，tool_use 按顺序在后
        assert_eq!(result["content"][0]["type"], "text");
        assert_eq!(result["content"][1]["type"], "tool_use");
        assert_eq!(result["content"][1]["id"], "call_abc");
        assert_eq!(result["content"][1]["name"], "get_weather");
        assert_eq!(result["content"][1]["input"]["city"], "Tokyo");
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("tool_calls"), "tool_use");
        assert_eq!(map_finish_reason("content_filter"), "end_turn");
    }

    #[test]
    fn test_cached_tokens_mapped() {
        let resp = json!({
            "choices": [{"message": {"content": "x"}, "finish_reason": "stop"}],
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 5,
                "prompt_tokens_details": {"cached_tokens": 80}
            }
        });
        let result = openai_to_anthropic(&resp).unwrap();
        assert_eq!(result["usage"]["cache_read_input_tokens"], 80);
    }

    #[test]
    fn test_empty_openai_response() {
        let resp = json!({"choices": [], "usage": {}});
        let result = openai_to_anthropic(&resp).unwrap();
        assert_eq!(result["type"], "message");
        assert!(result["content"].as_array().unwrap().is_empty());
        assert_eq!(result["stop_reason"], "end_turn");
    }

    #[test]
    fn test_invalid_tool_arguments_become_empty_input() {
        let resp = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "c1",
                        "function": {"name": "f", "arguments": "{not json"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {}
        });
        let result = openai_to_anthropic(&resp).unwrap();
        assert_eq!(result["content"][0]["input"], json!({}));
    }
}
