use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde_json::Value;

use super::{
    MetadataObserver, RequestMetadata, RequestTransformer, ResponseMetadata, ResponseTransformer,
    StreamTransformer,
};
use crate::context::RequestContext;
use crate::proxy::error::RelayError;

/// Four priority-ordered plugin chains. Registration sorts each chain;
/// lookups take a read lock so requests proceed in parallel.
#[derive(Default)]
pub struct PluginRegistry {
    request_transformers: RwLock<Vec<Arc<dyn RequestTransformer>>>,
    response_transformers: RwLock<Vec<Arc<dyn ResponseTransformer>>>,
    stream_transformers: RwLock<Vec<Arc<dyn StreamTransformer>>>,
    metadata_observers: RwLock<Vec<Arc<dyn MetadataObserver>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request_transformer(&self, plugin: Arc<dyn RequestTransformer>) {
        let mut chain = self.request_transformers.write().unwrap();
        chain.push(plugin);
        chain.sort_by_key(|p| p.priority());
    }

    pub fn register_response_transformer(&self, plugin: Arc<dyn ResponseTransformer>) {
        let mut chain = self.response_transformers.write().unwrap();
        chain.push(plugin);
        chain.sort_by_key(|p| p.priority());
    }

    pub fn register_stream_transformer(&self, plugin: Arc<dyn StreamTransformer>) {
        let mut chain = self.stream_transformers.write().unwrap();
        chain.push(plugin);
        chain.sort_by_key(|p| p.priority());
    }

    pub fn register_metadata_observer(&self, plugin: Arc<dyn MetadataObserver>) {
        let mut chain = self.metadata_observers.write().unwrap();
        chain.push(plugin);
        chain.sort_by_key(|p| p.priority());
    }

    /// Request chain is fail-closed: the first failing plugin aborts the
    /// request.
    pub fn apply_request_transformers(
        &self,
        ctx: &RequestContext,
        body: Value,
    ) -> Result<Value, RelayError> {
        let chain = self.request_transformers.read().unwrap();
        let mut result = body;
        for plugin in chain.iter() {
            if !plugin.enabled(ctx) {
                continue;
            }
            result = plugin.transform_request(ctx, result).map_err(|e| {
                RelayError::Plugin {
                    name: plugin.name().to_string(),
                    message: e.to_string(),
                }
            })?;
        }
        Ok(result)
    }

    /// Response chain is fail-open: a failing plugin keeps the body it was
    /// handed and the chain continues.
    pub fn apply_response_transformers(&self, ctx: &RequestContext, body: Value) -> Value {
        let chain = self.response_transformers.read().unwrap();
        let mut result = body;
        for plugin in chain.iter() {
            if !plugin.enabled(ctx) {
                continue;
            }
            match plugin.transform_response(ctx, result.clone()) {
                Ok(transformed) => result = transformed,
                Err(e) => {
                    tracing::warn!(
                        plugin = plugin.name(),
                        error = %e,
                        "response transformer failed, passing body through"
                    );
                }
            }
        }
        result
    }

    /// Stream chain is fail-open, per chunk.
    pub fn apply_stream_transformers(&self, ctx: &RequestContext, chunk: Bytes) -> Bytes {
        let chain = self.stream_transformers.read().unwrap();
        let mut result = chunk;
        for plugin in chain.iter() {
            if !plugin.enabled(ctx) {
                continue;
            }
            match plugin.transform_chunk(ctx, result.clone()) {
                Ok(transformed) => result = transformed,
                Err(e) => {
                    tracing::warn!(
                        plugin = plugin.name(),
                        error = %e,
                        "stream transformer failed, passing chunk through"
                    );
                }
            }
        }
        result
    }

    pub fn notify_request(&self, ctx: &RequestContext, metadata: &RequestMetadata) {
        let chain = self.metadata_observers.read().unwrap();
        for plugin in chain.iter() {
            if plugin.enabled(ctx) {
                plugin.on_request(ctx, metadata);
            }
        }
    }

    pub fn notify_response(&self, ctx: &RequestContext, metadata: &ResponseMetadata) {
        let chain = self.metadata_observers.read().unwrap();
        for plugin in chain.iter() {
            if plugin.enabled(ctx) {
                plugin.on_response(ctx, metadata);
            }
        }
    }

    /// name / description / priority per chain, for diagnostics.
    pub fn describe(&self) -> Vec<(String, Vec<String>)> {
        let fmt = |name: &str, desc: &str, prio: i32| format!("{name} - {desc} (priority: {prio})");
        vec![
            (
                "request_transformers".to_string(),
                self.request_transformers
                    .read()
                    .unwrap()
                    .iter()
                    .map(|p| fmt(p.name(), p.description(), p.priority()))
                    .collect(),
            ),
            (
                "response_transformers".to_string(),
                self.response_transformers
                    .read()
                    .unwrap()
                    .iter()
                    .map(|p| fmt(p.name(), p.description(), p.priority()))
                    .collect(),
            ),
            (
                "stream_transformers".to_string(),
                self.stream_transformers
                    .read()
                    .unwrap()
                    .iter()
                    .map(|p| fmt(p.name(), p.description(), p.priority()))
                    .collect(),
            ),
            (
                "metadata_observers".to_string(),
                self.metadata_observers
                    .read()
                    .unwrap()
                    .iter()
                    .map(|p| fmt(p.name(), p.description(), p.priority()))
                    .collect(),
            ),
        ]
    }
}
