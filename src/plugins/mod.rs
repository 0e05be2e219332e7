pub mod builtin;
mod registry;

pub use registry::PluginRegistry;

use bytes::Bytes;
use serde_json::Value;

use crate::context::RequestContext;
use crate::proxy::error::RelayError;

/// Common surface of every plugin. Chains run in ascending priority order
/// (lower = earlier); `enabled` is checked per invocation.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn priority(&self) -> i32 {
        100
    }

    fn enabled(&self, _ctx: &RequestContext) -> bool {
        true
    }
}

/// Rewrites request bodies after routing, before the adapter translation.
/// Errors here fail the request.
pub trait RequestTransformer: Plugin {
    fn transform_request(&self, ctx: &RequestContext, body: Value) -> Result<Value, RelayError>;
}

/// Rewrites buffered Anthropic-shaped responses. Errors are logged and the
/// pre-transform body is kept.
pub trait ResponseTransformer: Plugin {
    fn transform_response(&self, ctx: &RequestContext, body: Value) -> Result<Value, RelayError>;
}

/// Rewrites one emitted Anthropic SSE chunk at a time. Errors are logged and
/// the pre-transform chunk is kept.
pub trait StreamTransformer: Plugin {
    fn transform_chunk(&self, ctx: &RequestContext, chunk: Bytes) -> Result<Bytes, RelayError>;
}

/// Side-effect-only observers fired on request entry and response exit.
pub trait MetadataObserver: Plugin {
    fn on_request(&self, ctx: &RequestContext, metadata: &RequestMetadata);

    fn on_response(&self, ctx: &RequestContext, metadata: &ResponseMetadata);
}

#[derive(Debug, Clone)]
pub struct RequestMetadata {
    pub provider: String,
    pub model: String,
    pub input_tokens: usize,
    pub streaming: bool,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct ResponseMetadata {
    pub provider: String,
    pub model: String,
    pub status: u16,
    pub duration_ms: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}
