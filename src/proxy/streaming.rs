//! Upstream SSE -> Anthropic SSE translation.
//!
//! OpenAI-shaped upstreams stream `data: {"choices":[{"delta":{...}}]}`
//! records; the client expects Anthropic's event sequence (message_start,
//! content_block_start/delta/stop, message_delta, message_stop). The
//! translator reconstructs that sequence chunk by chunk, re-indexing blocks
//! densely from 0 in the order they open.

use bytes::Bytes;
use serde_json::{json, Value};

use super::translation::map_finish_reason;
use super::util::format_sse;
use crate::providers::{BlockKind, ContentBlockState, StreamState};

/// Translate one upstream chunk in the OpenAI chat-completions dialect.
/// Chunks need not align with SSE event boundaries; partial lines stay in
/// `state.buffer` until their terminator arrives.
pub fn translate_chunk(chunk: &[u8], state: &mut StreamState) -> Bytes {
    state.buffer.push_str(&String::from_utf8_lossy(chunk));

    let mut out = String::new();
    while let Some(pos) = state.buffer.find('\n') {
        let line: String = state.buffer.drain(..=pos).collect();
        process_line(line.trim_end_matches(['\n', '\r']), state, &mut out);
    }
    Bytes::from(out)
}

/// Emit the tail after the upstream closes. Idempotent: a stream that already
/// saw `[DONE]` produces nothing here.
pub fn finish(state: &mut StreamState) -> Bytes {
    let mut out = String::new();
    // 上游没有以换行收尾时，缓冲区里可能还剩一条完整事件
    if !state.buffer.is_empty() {
        let rest = std::mem::take(&mut state.buffer);
        process_line(rest.trim_end_matches(['\n', '\r']), state, &mut out);
    }
    emit_terminal(state, &mut out);
    Bytes::from(out)
}

fn process_line(line: &str, state: &mut StreamState, out: &mut String) {
    let Some(payload) = line.strip_prefix("data:") else {
        return;
    };
    let payload = payload.trim();

    if payload == "[DONE]" {
        emit_terminal(state, out);
        return;
    }

    let parsed: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            // 坏事件丢弃，流继续
            tracing::warn!(error = %e, "dropping malformed upstream SSE event");
            return;
        }
    };

    ensure_message_start(
        state,
        parsed.get("id").and_then(|v| v.as_str()),
        parsed.get("model").and_then(|v| v.as_str()),
        parsed
            .get("usage")
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|t| t.as_u64()),
        out,
    );

    if let Some(usage) = parsed.get("usage") {
        if let Some(tokens) = usage.get("completion_tokens").and_then(|t| t.as_u64()) {
            state.output_tokens = tokens;
        }
        if let Some(tokens) = usage.get("prompt_tokens").and_then(|t| t.as_u64()) {
            state.input_tokens = tokens;
        }
    }

    let Some(choice) = parsed
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return;
    };

    if let Some(delta) = choice.get("delta") {
        if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
            if !content.is_empty() {
                emit_text_delta(state, content, out);
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|tc| tc.as_array()) {
            for (i, tc) in tool_calls.iter().enumerate() {
                let upstream_index = tc
                    .get("index")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(i as u64);
                let empty = json!({});
                let func = tc.get("function").unwrap_or(&empty);

                let index = tool_block(
                    state,
                    upstream_index,
                    tc.get("id").and_then(|v| v.as_str()),
                    func.get("name").and_then(|v| v.as_str()),
                    out,
                );

                if let Some(args) = func.get("arguments").and_then(|a| a.as_str()) {
                    if !args.is_empty() {
                        emit_tool_arguments(state, index, args, out);
                    }
                }
            }
        }
    }

    if let Some(finish_reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        state.stop_reason = Some(map_finish_reason(finish_reason).to_string());
        close_open_blocks(state, out);
    }
}

/// Emit `message_start` once, capturing id/model from the first upstream
/// event for reuse in every later event.
pub(crate) fn ensure_message_start(
    state: &mut StreamState,
    id: Option<&str>,
    model: Option<&str>,
    input_tokens: Option<u64>,
    out: &mut String,
) {
    if state.message_start_sent {
        return;
    }
    state.message_id = match id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("msg_{}", uuid::Uuid::new_v4().simple()),
    };
    state.model = model.unwrap_or("unknown").to_string();
    if let Some(tokens) = input_tokens {
        state.input_tokens = tokens;
    }
    state.message_start_sent = true;

    out.push_str(&format_sse(
        "message_start",
        &json!({
            "type": "message_start",
            "message": {
                "id": state.message_id,
                "type": "message",
                "role": "assistant",
                "model": state.model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": state.input_tokens, "output_tokens": 0}
            }
        }),
    ));
}

/// Route text to the open text block, opening one at a fresh index if none
/// exists.
pub(crate) fn emit_text_delta(state: &mut StreamState, text: &str, out: &mut String) {
    let index = match state.open_text_index() {
        Some(i) => i,
        None => {
            let index = state.next_index();
            state.content_blocks.insert(
                index,
                ContentBlockState {
                    kind: BlockKind::Text,
                    start_sent: true,
                    stop_sent: false,
                    tool_call_id: String::new(),
                    upstream_tool_index: None,
                    tool_name: String::new(),
                    arguments: String::new(),
                },
            );
            state.current_index = Some(index);
            out.push_str(&format_sse(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "text", "text": ""}
                }),
            ));
            index
        }
    };

    out.push_str(&format_sse(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "text_delta", "text": text}
        }),
    ));
}

/// Resolve (or open) the block tracking an upstream tool-call index.
pub(crate) fn tool_block(
    state: &mut StreamState,
    upstream_index: u64,
    id: Option<&str>,
    name: Option<&str>,
    out: &mut String,
) -> usize {
    if let Some(index) = state.tool_block_index(upstream_index) {
        return index;
    }

    let index = state.next_index();
    let tool_call_id = match id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("call_{}", uuid::Uuid::new_v4().simple()),
    };
    let tool_name = name.unwrap_or("").to_string();

    state.content_blocks.insert(
        index,
        ContentBlockState {
            kind: BlockKind::ToolUse,
            start_sent: true,
            stop_sent: false,
            tool_call_id: tool_call_id.clone(),
            upstream_tool_index: Some(upstream_index),
            tool_name: tool_name.clone(),
            arguments: String::new(),
        },
    );
    state.current_index = Some(index);

    out.push_str(&format_sse(
        "content_block_start",
        &json!({
            "type": "content_block_start",
            "index": index,
            "content_block": {
                "type": "tool_use",
                "id": tool_call_id,
                "name": tool_name,
                "input": {}
            }
        }),
    ));
    index
}

/// Accumulate a tool's argument fragment and emit the matching delta.
pub(crate) fn emit_tool_arguments(
    state: &mut StreamState,
    index: usize,
    args: &str,
    out: &mut String,
) {
    if let Some(block) = state.content_blocks.get_mut(&index) {
        block.arguments.push_str(args);
    }
    out.push_str(&format_sse(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "input_json_delta", "partial_json": args}
        }),
    ));
}

/// Stop every still-open block in ascending index order.
pub(crate) fn close_open_blocks(state: &mut StreamState, out: &mut String) {
    for (index, block) in state.content_blocks.iter_mut() {
        if block.stop_sent {
            continue;
        }
        block.stop_sent = true;
        out.push_str(&format_sse(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": index}),
        ));
    }
}

/// Final `message_delta` (stop reason + usage totals) and `message_stop`.
/// A stream that never produced a terminal event still gets a well-formed
/// tail with `stop_reason: "end_turn"`.
pub(crate) fn emit_terminal(state: &mut StreamState, out: &mut String) {
    if state.message_stop_sent {
        return;
    }
    ensure_message_start(state, None, None, None, out);
    close_open_blocks(state, out);

    let stop_reason = state.stop_reason.as_deref().unwrap_or("end_turn");
    out.push_str(&format_sse(
        "message_delta",
        &json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": {"output_tokens": state.output_tokens}
        }),
    ));
    out.push_str(&format_sse("message_stop", &json!({"type": "message_stop"})));
    state.message_stop_sent = true;
}
