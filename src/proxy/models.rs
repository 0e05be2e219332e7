use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::proxy::ProxyState;

/// GET /v1/models: union of allowed models across configured providers.
pub async fn list_models(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    let mut models = Vec::new();
    for provider in &state.config.providers {
        for model in provider.advertised_models() {
            models.push(json!({
                "id": model,
                "object": "model",
                "owned_by": provider.name,
            }));
        }
    }

    Json(json!({
        "object": "list",
        "data": models,
    }))
}
