use bytes::Bytes;
use reqwest::RequestBuilder;
use serde_json::Value;

use super::{Provider, StreamState};
use crate::config::{KeyPool, ProviderConfig};
use crate::proxy::error::RelayError;

/// Anthropic-native upstream: the wire dialect already matches what the
/// client speaks, so every hook is a pass-through.
pub struct AnthropicProvider {
    cfg: ProviderConfig,
    keys: KeyPool,
}

impl AnthropicProvider {
    pub fn new(cfg: ProviderConfig) -> Self {
        let keys = KeyPool::from_entry(&cfg.api_key);
        Self { cfg, keys }
    }
}

impl Provider for AnthropicProvider {
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
        let builder = builder.header("anthropic-version", "2023-06-01");
        match self.api_key() {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    fn transform_request(&self, body: Value) -> Result<Value, RelayError> {
        Ok(body)
    }

    fn transform_response(&self, body: Value) -> Result<Value, RelayError> {
        Ok(body)
    }

    fn transform_stream(&self, chunk: &[u8], _state: &mut StreamState) -> Result<Bytes, RelayError> {
        Ok(Bytes::copy_from_slice(chunk))
    }

    fn finish_stream(&self, _state: &mut StreamState) -> Result<Bytes, RelayError> {
        // 上游本身就会发出完整的事件尾
        Ok(Bytes::new())
    }
}
