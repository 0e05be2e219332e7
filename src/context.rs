use crate::router::RouteClass;

/// Per-request context threaded through the pipeline. Created by the handler
/// after routing, immutable for the request's lifetime.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub route: RouteClass,
    pub streaming: bool,
}

impl RequestContext {
    pub fn new(provider: &str, model: &str, route: RouteClass, streaming: bool) -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            provider: provider.to_string(),
            model: model.to_string(),
            route,
            streaming,
        }
    }
}
