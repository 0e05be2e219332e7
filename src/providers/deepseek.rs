use bytes::Bytes;
use serde_json::{json, Value};

use super::{Provider, StreamState};
use crate::config::{KeyPool, ProviderConfig};
use crate::proxy::error::RelayError;
use crate::proxy::{streaming, translation};

/// DeepSeek 最大输出 8192 tokens，超出会被 API 拒绝
const MAX_OUTPUT_TOKENS: u64 = 8192;

/// DeepSeek: OpenAI-shaped with a hard output-token ceiling.
pub struct DeepSeekProvider {
    cfg: ProviderConfig,
    keys: KeyPool,
}

impl DeepSeekProvider {
    pub fn new(cfg: ProviderConfig) -> Self {
        let keys = KeyPool::from_entry(&cfg.api_key);
        Self { cfg, keys }
    }
}

impl Provider for DeepSeekProvider {
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

    fn transform_request(&self, body: Value) -> Result<Value, RelayError> {
        let mut out = translation::anthropic_to_openai(&body)?;
        if let Some(max_tokens) = out.get("max_tokens").and_then(|t| t.as_u64()) {
            if max_tokens > MAX_OUTPUT_TOKENS {
                out["max_tokens"] = json!(MAX_OUTPUT_TOKENS);
            }
        }
        Ok(out)
    }

    fn transform_response(&self, body: Value) -> Result<Value, RelayError> {
        translation::openai_to_anthropic(&body)
    }

    fn transform_stream(&self, chunk: &[u8], state: &mut StreamState) -> Result<Bytes, RelayError> {
        Ok(streaming::translate_chunk(chunk, state))
    }
}
