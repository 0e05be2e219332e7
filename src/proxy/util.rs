use serde_json::{json, Value};

/// SSE 格式化：一个事件一条 `event:`/`data:` 记录
pub fn format_sse(event: &str, data: &Value) -> String {
    format!(
        "event: {event}\ndata: {}\n\n",
        serde_json::to_string(data).unwrap_or_default()
    )
}

/// Anthropic 格式的错误 JSON
pub fn anthropic_error_body(status: u16, message: &str) -> Value {
    let error_type = match status {
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        413 => "request_too_large",
        429 => "rate_limit_error",
        500 => "api_error",
        502 | 503 | 529 => "api_error",
        _ => "invalid_request_error",
    };
    json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message,
        }
    })
}

/// API key 预览（显示首尾各 4 字符）
pub fn format_key_preview(key: &str) -> String {
    if key.is_empty() {
        "(empty)".to_string()
    } else if key.len() > 8 {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    } else {
        "***".to_string()
    }
}

/// Truncate an upstream error body before echoing it to the client.
pub fn sanitize_upstream_body(body: &str) -> String {
    const MAX: usize = 2048;
    let trimmed = body.trim();
    if trimmed.len() <= MAX {
        return trimmed.to_string();
    }
    let mut cut = MAX;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &trimmed[..cut])
}
