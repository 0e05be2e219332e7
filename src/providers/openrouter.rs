use bytes::Bytes;
use serde_json::{json, Value};

use super::{Provider, StreamState};
use crate::config::{KeyPool, ProviderConfig};
use crate::proxy::error::RelayError;
use crate::proxy::{streaming, translation};

/// OpenRouter: OpenAI-shaped, with two quirks. `cache_control` markers leak
/// from Anthropic clients and some routed models reject them, so they are
/// stripped; usage accounting must be requested explicitly to get token
/// totals on streams.
pub struct OpenRouterProvider {
    cfg: ProviderConfig,
    keys: KeyPool,
}

impl OpenRouterProvider {
    pub fn new(cfg: ProviderConfig) -> Self {
        let keys = KeyPool::from_entry(&cfg.api_key);
        Self { cfg, keys }
    }
}

impl Provider for OpenRouterProvider {
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
        strip_cache_control(&mut out);
        if out.get("stream").and_then(|s| s.as_bool()).unwrap_or(false) {
            out["usage"] = json!({"include": true});
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

fn strip_cache_control(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("cache_control");
            for v in map.values_mut() {
                strip_cache_control(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_cache_control(v);
            }
        }
        _ => {}
    }
}
