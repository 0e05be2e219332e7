//! End-to-end tests: drive the axum app in-process with a wiremock upstream
//! standing in for an OpenAI-shaped provider.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ccrelay::config::{KeyEntry, PluginSettings, ProviderConfig, RelayConfig, RouterRules};
use ccrelay::proxy::{build_app, ProxyState};

fn base_config(upstream_uri: &str) -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        log_level: "info".to_string(),
        api_key: None,
        max_body_bytes: 1024 * 1024,
        providers: vec![ProviderConfig {
            name: "openai".to_string(),
            api_base: format!("{upstream_uri}/v1/chat/completions"),
            api_key: KeyEntry::Single("sk-test".to_string()),
            models: vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
            whitelist: None,
            model_metadata: Default::default(),
        }],
        router: RouterRules {
            default: Some("openai/gpt-4o".to_string()),
            think: Some("openai/think-model".to_string()),
            background: Some("openai/small-model".to_string()),
            long_context: None,
            web_search: None,
            long_context_threshold: 60_000,
        },
        plugins: PluginSettings::default(),
        config_source: None,
    }
}

fn app_for(config: RelayConfig) -> axum::Router {
    build_app(Arc::new(ProxyState::new(config).unwrap()))
}

fn messages_request(body: &Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn read_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn sse_event_names(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|l| l.strip_prefix("event: "))
        .map(|s| s.to_string())
        .collect()
}

#[tokio::test]
async fn buffered_text_round_trip() {
    // S1: explicit qualified model, buffered upstream text response
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-s1",
            "model": "gpt-4o-mini",
            "choices": [{
                "message": {"role": "assistant", "content": "Hi there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 11}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(base_config(&server.uri()));
    let response = app
        .oneshot(messages_request(
            &json!({
                "model": "openai/gpt-4o-mini",
                "messages": [{"role": "user", "content": "hello"}],
                "max_tokens": 64,
                "stream": false
            }),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "Hi there");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 7);
    assert_eq!(body["usage"]["output_tokens"], 11);
}

#[tokio::test]
async fn background_route_substitutes_model() {
    // S2: haiku model name lands on the configured background model
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "small-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-s2",
            "model": "small-model",
            "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(base_config(&server.uri()));
    let response = app
        .oneshot(messages_request(
            &json!({
                "model": "claude-3-5-haiku-20241022",
                "messages": [{"role": "user", "content": "quick check"}]
            }),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn thinking_object_routes_to_think_model() {
    // S3
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "think-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-s3",
            "model": "think-model",
            "choices": [{"message": {"content": "pondered"}, "finish_reason": "stop"}],
            "usage": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(base_config(&server.uri()));
    let response = app
        .oneshot(messages_request(
            &json!({
                "model": "claude-sonnet-4-20250514",
                "thinking": {"type": "enabled", "budget_tokens": 1024},
                "messages": [{"role": "user", "content": "hard question"}]
            }),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn comma_tag_beats_explicit_model() {
    // S4: "openai/gpt-4o,think" routes via the think rule
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "think-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-s4",
            "model": "think-model",
            "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}],
            "usage": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(base_config(&server.uri()));
    let response = app
        .oneshot(messages_request(
            &json!({
                "model": "openai/gpt-4o,think",
                "messages": [{"role": "user", "content": "hi"}]
            }),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn streaming_text_and_tool_call() {
    // S5: text deltas, then a tool call, then tool_calls finish + [DONE]
    let sse_body = concat!(
        "data: {\"id\":\"chatcmpl-s5\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"tc_1\",\"function\":{\"name\":\"get_time\",\"arguments\":\"{\\\"tz\\\":\\\"UTC\\\"}\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes(), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(base_config(&server.uri()));
    let response = app
        .oneshot(messages_request(
            &json!({
                "model": "openai/gpt-4o",
                "messages": [{"role": "user", "content": "what time is it"}],
                "stream": true
            }),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = read_text(response).await;
    assert_eq!(
        sse_event_names(&body),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    // spot-check payloads
    let datas: Vec<Value> = body
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(datas[0]["message"]["id"], "chatcmpl-s5");
    let tool_start = datas
        .iter()
        .find(|d| d["content_block"]["type"] == "tool_use")
        .unwrap();
    assert_eq!(tool_start["index"], 1);
    assert_eq!(tool_start["content_block"]["id"], "tc_1");
    assert_eq!(tool_start["content_block"]["name"], "get_time");
    let message_delta = datas
        .iter()
        .find(|d| d["type"] == "message_delta")
        .unwrap();
    assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
}

#[tokio::test]
async fn wrong_bearer_token_rejected_before_upstream() {
    // S6: upstream must never be contacted
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = base_config(&server.uri());
    config.api_key = Some("router-secret".to_string());
    let app = app_for(config);

    let response = app
        .oneshot(messages_request(
            &json!({"model": "openai/gpt-4o", "messages": []}),
            Some("wrong-token"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = read_json(response).await;
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn correct_bearer_token_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "x", "model": "gpt-4o",
            "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}],
            "usage": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = base_config(&server.uri());
    config.api_key = Some("router-secret".to_string());
    let app = app_for(config);

    let response = app
        .oneshot(messages_request(
            &json!({"model": "openai/gpt-4o", "messages": []}),
            Some("router-secret"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn model_outside_whitelist_is_400() {
    let server = MockServer::start().await;
    let mut config = base_config(&server.uri());
    config.providers[0].whitelist = Some(vec!["gpt-4o".to_string()]);
    let app = app_for(config);

    let response = app
        .oneshot(messages_request(
            &json!({"model": "openai/gpt-5-ultra", "messages": []}),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn invalid_json_is_400() {
    let server = MockServer::start().await;
    let app = app_for(base_config(&server.uri()));

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_body_is_413() {
    let server = MockServer::start().await;
    let mut config = base_config(&server.uri());
    config.max_body_bytes = 256;
    let app = app_for(config);

    let big = "x".repeat(512);
    let response = app
        .oneshot(messages_request(
            &json!({"model": "openai/gpt-4o", "messages": [{"role": "user", "content": big}]}),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn upstream_error_surfaces_as_502() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(base_config(&server.uri()));
    let response = app
        .oneshot(messages_request(
            &json!({"model": "openai/gpt-4o", "messages": []}),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = read_json(response).await;
    assert_eq!(body["error"]["type"], "api_error");
    assert_eq!(body["error"]["upstream_status"], 500);
    assert_eq!(body["error"]["upstream_body"], "upstream exploded");
}

#[tokio::test]
async fn response_filter_plugin_applies_to_buffered_responses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "x", "model": "gpt-4o",
            "choices": [{"message": {"content": "the password is hunter2"}, "finish_reason": "stop"}],
            "usage": {}
        })))
        .mount(&server)
        .await;

    let mut config = base_config(&server.uri());
    config.plugins.response_filter.enabled = true;
    config.plugins.response_filter.words = vec!["hunter2".to_string()];
    config.plugins.response_filter.replacement = "[redacted]".to_string();
    let app = app_for(config);

    let response = app
        .oneshot(messages_request(
            &json!({"model": "openai/gpt-4o", "messages": []}),
            None,
        ))
        .await
        .unwrap();

    let body = read_json(response).await;
    assert_eq!(body["content"][0]["text"], "the password is [redacted]");
}

#[tokio::test]
async fn system_prompt_injector_reaches_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(
            json!({"messages": [{"role": "system", "content": "Be terse."}]}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "x", "model": "gpt-4o",
            "choices": [{"message": {"content": "k"}, "finish_reason": "stop"}],
            "usage": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = base_config(&server.uri());
    config.plugins.system_prompt.enabled = true;
    config.plugins.system_prompt.prompt = "Be terse.".to_string();
    let app = app_for(config);

    let response = app
        .oneshot(messages_request(
            &json!({"model": "openai/gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_endpoint() {
    let server = MockServer::start().await;
    let app = app_for(base_config(&server.uri()));

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn models_endpoint_lists_provider_models() {
    let server = MockServer::start().await;
    let app = app_for(base_config(&server.uri()));

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert!(ids.contains(&"gpt-4o"));
    assert!(ids.contains(&"gpt-4o-mini"));
}

#[tokio::test]
async fn upstream_close_without_done_still_terminates_stream() {
    // upstream sends one delta then closes; client still gets a full tail
    let sse_body = "data: {\"id\":\"c\",\"model\":\"m\",\"choices\":[{\"delta\":{\"content\":\"half\"}}]}\n\n";

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let app = app_for(base_config(&server.uri()));
    let response = app
        .oneshot(messages_request(
            &json!({"model": "openai/gpt-4o", "messages": [], "stream": true}),
            None,
        ))
        .await
        .unwrap();

    let body = read_text(response).await;
    let names = sse_event_names(&body);
    assert_eq!(names.first().map(|s| s.as_str()), Some("message_start"));
    assert_eq!(names.last().map(|s| s.as_str()), Some("message_stop"));
    assert!(names.iter().any(|n| n == "content_block_stop"));
}
