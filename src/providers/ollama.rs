use bytes::Bytes;
use reqwest::RequestBuilder;
use serde_json::Value;

use super::{Provider, StreamState};
use crate::config::{KeyPool, ProviderConfig};
use crate::proxy::error::RelayError;
use crate::proxy::{streaming, translation};

/// Local Ollama speaking its OpenAI-compatible `/v1/chat/completions`
/// endpoint. No auth.
pub struct OllamaProvider {
    cfg: ProviderConfig,
    keys: KeyPool,
}

impl OllamaProvider {
    pub fn new(cfg: ProviderConfig) -> Self {
        let keys = KeyPool::from_entry(&cfg.api_key);
        Self { cfg, keys }
    }
}

impl Provider for OllamaProvider {
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

    fn apply_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
    }

    fn transform_request(&self, body: Value) -> Result<Value, RelayError> {
        translation::anthropic_to_openai(&body)
    }

    fn transform_response(&self, body: Value) -> Result<Value, RelayError> {
        translation::openai_to_anthropic(&body)
    }

    fn transform_stream(&self, chunk: &[u8], state: &mut StreamState) -> Result<Bytes, RelayError> {
        Ok(streaming::translate_chunk(chunk, state))
    }
}
