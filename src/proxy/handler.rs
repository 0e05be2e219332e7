use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::context::RequestContext;
use crate::plugins::{RequestMetadata, ResponseMetadata};
use crate::providers::{Provider, StreamState};
use crate::proxy::error::RelayError;
use crate::proxy::util::{anthropic_error_body, sanitize_upstream_body};
use crate::proxy::ProxyState;
use crate::router;

/// POST /v1/messages: authenticate, route, transform, forward, translate
/// back.
pub async fn handle_messages(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match process(state, headers, body).await {
        Ok(response) => response,
        Err(RelayError::ClientCancelled) => {
            tracing::debug!("client disconnected mid-request");
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(e @ (RelayError::Upstream { .. } | RelayError::Http(_))) => {
            tracing::error!(error = %e, "upstream request failed");
            e.into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "request rejected");
            e.into_response()
        }
    }
}

async fn process(
    state: Arc<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let start = Instant::now();

    if let Some(expected) = &state.config.api_key {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if provided != Some(expected.as_str()) {
            return Err(RelayError::Auth(
                "invalid or missing bearer token".to_string(),
            ));
        }
    }

    if body.len() > state.config.max_body_bytes {
        return Ok((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(anthropic_error_body(
                413,
                "request body exceeds the configured maximum",
            )),
        )
            .into_response());
    }

    let mut body_value: Value = serde_json::from_slice(&body)
        .map_err(|e| RelayError::RequestTranslation(format!("invalid JSON: {e}")))?;

    let selection = state.router.select(&state.registry, &body_value)?;
    let adapter = state.registry.get(&selection.provider).ok_or_else(|| {
        RelayError::Routing(format!(
            "provider '{}' is not configured",
            selection.provider
        ))
    })?;

    let mut wants_stream = body_value
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if wants_stream && !adapter.supports_streaming() {
        body_value["stream"] = json!(false);
        wants_stream = false;
    }

    // 把选中的具体模型写回请求体
    body_value["model"] = json!(selection.model);

    let ctx = RequestContext::new(
        &selection.provider,
        &selection.model,
        selection.route,
        wants_stream,
    );
    tracing::debug!(
        request_id = %ctx.request_id,
        provider = %ctx.provider,
        model = %ctx.model,
        route = %ctx.route,
        "request routed"
    );

    state.plugins.notify_request(
        &ctx,
        &RequestMetadata {
            provider: ctx.provider.clone(),
            model: ctx.model.clone(),
            input_tokens: router::estimate_input_tokens(&body_value),
            streaming: wants_stream,
            raw: body_value.clone(),
        },
    );

    let body_value = state.plugins.apply_request_transformers(&ctx, body_value)?;
    let upstream_body = adapter.transform_request(body_value)?;

    let url = adapter.request_url(&ctx.model, wants_stream);
    let builder = state
        .http_client
        .post(&url)
        .header("content-type", "application/json");
    let builder = adapter.apply_auth(builder);
    let upstream_response = builder.json(&upstream_body).send().await?;

    let status = upstream_response.status();
    if !status.is_success() {
        let text = upstream_response.text().await.unwrap_or_default();
        return Err(RelayError::Upstream {
            status: status.as_u16(),
            body: sanitize_upstream_body(&text),
        });
    }

    if adapter.is_streaming(upstream_response.headers()) {
        Ok(stream_response(state, adapter, ctx, upstream_response, start))
    } else {
        buffered_response(state, adapter, ctx, upstream_response, start).await
    }
}

async fn buffered_response(
    state: Arc<ProxyState>,
    adapter: Arc<dyn Provider>,
    ctx: RequestContext,
    upstream_response: reqwest::Response,
    start: Instant,
) -> Result<Response, RelayError> {
    let upstream_json: Value = upstream_response.json().await?;
    let anthropic = adapter.transform_response(upstream_json)?;
    let anthropic = state.plugins.apply_response_transformers(&ctx, anthropic);

    let usage = anthropic.get("usage").cloned().unwrap_or(json!({}));
    state.plugins.notify_response(
        &ctx,
        &ResponseMetadata {
            provider: ctx.provider.clone(),
            model: ctx.model.clone(),
            status: 200,
            duration_ms: start.elapsed().as_millis() as u64,
            output_tokens: usage
                .get("output_tokens")
                .and_then(|t| t.as_u64())
                .unwrap_or(0),
            cached_tokens: usage
                .get("cache_read_input_tokens")
                .and_then(|t| t.as_u64())
                .unwrap_or(0),
        },
    );

    Ok((StatusCode::OK, Json(anthropic)).into_response())
}

/// Logs an interrupted stream at debug severity; client disconnects are
/// expected terminations, not errors.
struct StreamGuard {
    request_id: String,
    completed: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!(
                request_id = %self.request_id,
                "client disconnected, upstream connection dropped"
            );
        }
    }
}

fn stream_response(
    state: Arc<ProxyState>,
    adapter: Arc<dyn Provider>,
    ctx: RequestContext,
    upstream_response: reqwest::Response,
    start: Instant,
) -> Response {
    let upstream = upstream_response.bytes_stream();

    let output = async_stream::stream! {
        let mut upstream = std::pin::pin!(upstream);
        let mut guard = StreamGuard {
            request_id: ctx.request_id.clone(),
            completed: false,
        };
        let mut translate_state = StreamState::new();

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    match adapter.transform_stream(&chunk, &mut translate_state) {
                        Ok(events) if !events.is_empty() => {
                            let events = state.plugins.apply_stream_transformers(&ctx, events);
                            yield Ok::<Bytes, std::io::Error>(events);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "stream translation error, chunk dropped");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "upstream stream error, finishing early");
                    break;
                }
            }
        }

        // 无论上游如何收尾，都给客户端一个完整的事件尾
        match adapter.finish_stream(&mut translate_state) {
            Ok(tail) if !tail.is_empty() => {
                let tail = state.plugins.apply_stream_transformers(&ctx, tail);
                yield Ok(tail);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "stream finalization error");
            }
        }

        guard.completed = true;
        state.plugins.notify_response(
            &ctx,
            &ResponseMetadata {
                provider: ctx.provider.clone(),
                model: ctx.model.clone(),
                status: 200,
                duration_ms: start.elapsed().as_millis() as u64,
                output_tokens: translate_state.output_tokens,
                cached_tokens: 0,
            },
        );
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(output))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to build streaming response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}
