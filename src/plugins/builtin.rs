//! Built-in plugins, registered from `[plugins]` configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Value};

use super::{
    MetadataObserver, Plugin, PluginRegistry, RequestMetadata, RequestTransformer,
    ResponseMetadata, ResponseTransformer,
};
use crate::config::PluginSettings;
use crate::context::RequestContext;
use crate::proxy::error::RelayError;

/// Register the built-ins that are enabled in configuration.
pub fn register_builtins(registry: &PluginRegistry, settings: &PluginSettings) {
    if settings.token_counter.enabled {
        registry.register_metadata_observer(Arc::new(TokenCounter::new()));
    }
    if settings.system_prompt.enabled && !settings.system_prompt.prompt.is_empty() {
        registry.register_request_transformer(Arc::new(SystemPromptInjector::new(
            settings.system_prompt.prompt.clone(),
        )));
    }
    if settings.response_filter.enabled && !settings.response_filter.words.is_empty() {
        registry.register_response_transformer(Arc::new(ResponseFilter::new(
            settings.response_filter.words.clone(),
            settings.response_filter.replacement.clone(),
        )));
    }
}

/// Logs one line per request and per response, tracking start times keyed by
/// request id to report durations.
pub struct TokenCounter {
    start_times: Mutex<HashMap<String, Instant>>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            start_times: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for TokenCounter {
    fn name(&self) -> &str {
        "token-counter"
    }

    fn description(&self) -> &str {
        "Tracks and logs token usage statistics"
    }

    fn priority(&self) -> i32 {
        1000
    }
}

impl MetadataObserver for TokenCounter {
    fn on_request(&self, ctx: &RequestContext, metadata: &RequestMetadata) {
        self.start_times
            .lock()
            .unwrap()
            .insert(ctx.request_id.clone(), Instant::now());

        tracing::info!(
            request_id = %ctx.request_id,
            provider = %metadata.provider,
            model = %metadata.model,
            input_tokens = metadata.input_tokens,
            streaming = metadata.streaming,
            "request received"
        );
    }

    fn on_response(&self, ctx: &RequestContext, metadata: &ResponseMetadata) {
        let tracked_ms = self
            .start_times
            .lock()
            .unwrap()
            .remove(&ctx.request_id)
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(metadata.duration_ms);

        if metadata.cached_tokens > 0 {
            tracing::info!(
                request_id = %ctx.request_id,
                provider = %metadata.provider,
                model = %metadata.model,
                output_tokens = metadata.output_tokens,
                cached_tokens = metadata.cached_tokens,
                duration_ms = tracked_ms,
                status = metadata.status,
                "response completed"
            );
        } else {
            tracing::info!(
                request_id = %ctx.request_id,
                provider = %metadata.provider,
                model = %metadata.model,
                output_tokens = metadata.output_tokens,
                duration_ms = tracked_ms,
                status = metadata.status,
                "response completed"
            );
        }
    }
}

/// Sets the request's `system` prompt, or prepends to the existing one.
pub struct SystemPromptInjector {
    prompt: String,
}

impl SystemPromptInjector {
    pub fn new(prompt: String) -> Self {
        Self { prompt }
    }
}

impl Plugin for SystemPromptInjector {
    fn name(&self) -> &str {
        "system-prompt-injector"
    }

    fn description(&self) -> &str {
        "Injects a custom system prompt into all requests"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn enabled(&self, _ctx: &RequestContext) -> bool {
        !self.prompt.is_empty()
    }
}

impl RequestTransformer for SystemPromptInjector {
    fn transform_request(
        &self,
        _ctx: &RequestContext,
        mut body: Value,
    ) -> Result<Value, RelayError> {
        let system = body.get("system").cloned();
        match system {
            Some(Value::String(existing)) if !existing.is_empty() => {
                body["system"] = json!(format!("{}\n\n{existing}", self.prompt));
            }
            Some(Value::Array(mut blocks)) => {
                blocks.insert(0, json!({"type": "text", "text": self.prompt}));
                body["system"] = Value::Array(blocks);
            }
            _ => {
                body["system"] = json!(self.prompt);
            }
        }
        Ok(body)
    }
}

/// Replaces configured words in every text block of an Anthropic-shaped
/// response.
pub struct ResponseFilter {
    words: Vec<String>,
    replacement: String,
}

impl ResponseFilter {
    pub fn new(words: Vec<String>, replacement: String) -> Self {
        Self { words, replacement }
    }
}

impl Plugin for ResponseFilter {
    fn name(&self) -> &str {
        "response-filter"
    }

    fn description(&self) -> &str {
        "Filters sensitive content from responses"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn enabled(&self, _ctx: &RequestContext) -> bool {
        !self.words.is_empty()
    }
}

impl ResponseTransformer for ResponseFilter {
    fn transform_response(
        &self,
        _ctx: &RequestContext,
        mut body: Value,
    ) -> Result<Value, RelayError> {
        if let Some(blocks) = body.get_mut("content").and_then(|c| c.as_array_mut()) {
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) != Some("text") {
                    continue;
                }
                if let Some(Value::String(text)) = block.get_mut("text") {
                    let mut filtered = text.clone();
                    for word in &self.words {
                        filtered = filtered.replace(word.as_str(), &self.replacement);
                    }
                    *text = filtered;
                }
            }
        }
        Ok(body)
    }
}
