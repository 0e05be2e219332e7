mod anthropic;
mod deepseek;
mod gemini;
mod groq;
mod nvidia;
mod ollama;
mod openai;
mod openrouter;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::http::HeaderMap;
use bytes::Bytes;
use reqwest::RequestBuilder;

pub use anthropic::AnthropicProvider;
pub use deepseek::DeepSeekProvider;
pub use gemini::GeminiProvider;
pub use groq::GroqProvider;
pub use nvidia::NvidiaProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use openrouter::OpenRouterProvider;

use crate::config::ProviderConfig;
use crate::proxy::error::RelayError;

/// One upstream family. Adapters translate between the Anthropic dialect and
/// their own; the Anthropic adapter passes everything through.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Full upstream endpoint URL from configuration.
    fn endpoint(&self) -> &str;

    /// Next key from the pool (round-robin), if any are configured.
    fn api_key(&self) -> Option<String>;

    /// Whitelist check; with no whitelist configured every model is allowed.
    fn allows_model(&self, model: &str) -> bool;

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Whether the upstream response headers indicate an event stream.
    fn is_streaming(&self, headers: &HeaderMap) -> bool {
        headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream") || ct.contains("stream"))
            .unwrap_or(false)
    }

    /// The URL to POST for one request. Most adapters use the configured
    /// endpoint as-is; Gemini builds a per-model URL.
    fn request_url(&self, _model: &str, _stream: bool) -> String {
        self.endpoint().to_string()
    }

    /// Attach this family's auth convention to the outbound request.
    fn apply_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_key() {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Anthropic request body -> upstream request body.
    fn transform_request(&self, body: serde_json::Value)
        -> Result<serde_json::Value, RelayError>;

    /// Buffered upstream response body -> Anthropic response body.
    fn transform_response(
        &self,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RelayError>;

    /// One upstream chunk -> zero or more Anthropic SSE events. Chunks need
    /// not align with event boundaries; `state` buffers partial events.
    fn transform_stream(&self, chunk: &[u8], state: &mut StreamState)
        -> Result<Bytes, RelayError>;

    /// Called once after the upstream closes so the client always sees a
    /// well-formed event tail.
    fn finish_stream(&self, state: &mut StreamState) -> Result<Bytes, RelayError> {
        Ok(crate::proxy::streaming::finish(state))
    }
}

/// Streaming translation state, created per upstream connection.
#[derive(Debug, Default)]
pub struct StreamState {
    pub message_start_sent: bool,
    pub message_id: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,

    /// Anthropic block index -> block state, dense from 0 in open order.
    pub content_blocks: BTreeMap<usize, ContentBlockState>,
    /// Index of the most recently opened block.
    pub current_index: Option<usize>,

    pub stop_reason: Option<String>,
    pub message_stop_sent: bool,

    /// Partial SSE data carried across chunk boundaries.
    pub(crate) buffer: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    ToolUse,
}

#[derive(Debug)]
pub struct ContentBlockState {
    pub kind: BlockKind,
    pub start_sent: bool,
    pub stop_sent: bool,
    pub tool_call_id: String,
    /// The upstream's own tool-call index, used to route argument deltas.
    pub upstream_tool_index: Option<u64>,
    pub tool_name: String,
    pub arguments: String,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the open text block, if one exists.
    pub fn open_text_index(&self) -> Option<usize> {
        self.content_blocks
            .iter()
            .find(|(_, b)| b.kind == BlockKind::Text && !b.stop_sent)
            .map(|(i, _)| *i)
    }

    /// Index of the block tracking the given upstream tool index.
    pub fn tool_block_index(&self, upstream_index: u64) -> Option<usize> {
        self.content_blocks
            .iter()
            .find(|(_, b)| b.upstream_tool_index == Some(upstream_index) && !b.stop_sent)
            .map(|(i, _)| *i)
    }

    /// Next dense block index.
    pub fn next_index(&self) -> usize {
        self.content_blocks.len()
    }
}

/// Lookup table from provider name (and endpoint hostname) to adapter.
pub struct Registry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Resolve an adapter from an endpoint URL's hostname.
    pub fn get_by_domain(&self, api_base: &str) -> Result<Arc<dyn Provider>, RelayError> {
        let url = reqwest::Url::parse(api_base)
            .map_err(|e| RelayError::Routing(format!("invalid API base URL: {e}")))?;
        let domain = url
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| RelayError::Routing("API base URL has no host".to_string()))?;

        let name = match domain.as_str() {
            "openrouter.ai" | "api.openrouter.ai" => "openrouter",
            "api.openai.com" | "openai.com" => "openai",
            "api.anthropic.com" | "anthropic.com" => "anthropic",
            "integrate.api.nvidia.com" | "api.nvidia.com" => "nvidia",
            "generativelanguage.googleapis.com" | "googleapis.com" => "gemini",
            "api.deepseek.com" => "deepseek",
            "api.groq.com" => "groq",
            "localhost" | "127.0.0.1" => "ollama",
            other => {
                return Err(RelayError::Routing(format!(
                    "no provider found for domain: {other}"
                )))
            }
        };

        self.get(name)
            .ok_or_else(|| RelayError::Routing(format!("provider '{name}' is not configured")))
    }

    /// Build adapters for every configured provider. Names outside the known
    /// families fall back to the generic OpenAI-compatible adapter.
    pub fn from_config(configs: &[ProviderConfig]) -> Self {
        let mut registry = Self::new();
        for cfg in configs {
            let provider: Arc<dyn Provider> = match cfg.name.as_str() {
                "anthropic" => Arc::new(AnthropicProvider::new(cfg.clone())),
                "openrouter" => Arc::new(OpenRouterProvider::new(cfg.clone())),
                "nvidia" => Arc::new(NvidiaProvider::new(cfg.clone())),
                "gemini" => Arc::new(GeminiProvider::new(cfg.clone())),
                "ollama" => Arc::new(OllamaProvider::new(cfg.clone())),
                "deepseek" => Arc::new(DeepSeekProvider::new(cfg.clone())),
                "groq" => Arc::new(GroqProvider::new(cfg.clone())),
                _ => Arc::new(OpenAiProvider::new(cfg.clone())),
            };
            registry.register(provider);
        }
        registry
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
