use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::util::anthropic_error_body;

/// Everything that can go wrong between the client and an upstream.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("model '{model}' is not allowed for provider '{provider}'")]
    ModelNotAllowed { provider: String, model: String },

    #[error("invalid request: {0}")]
    RequestTranslation(String),

    #[error("upstream returned HTTP {status}")]
    Upstream { status: u16, body: String },

    #[error("client disconnected")]
    ClientCancelled,

    #[error("plugin '{name}' failed: {message}")]
    Plugin { name: String, message: String },

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Auth(_) => StatusCode::UNAUTHORIZED,
            RelayError::Routing(_) | RelayError::ModelNotAllowed { .. } => StatusCode::BAD_REQUEST,
            RelayError::RequestTranslation(_) => StatusCode::BAD_REQUEST,
            RelayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            RelayError::ClientCancelled => StatusCode::BAD_REQUEST,
            RelayError::Plugin { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Http(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = anthropic_error_body(status.as_u16(), &self.to_string());
        // 上游错误附带原始状态和（截断后的）响应体
        if let RelayError::Upstream {
            status: upstream_status,
            body: upstream_body,
        } = &self
        {
            body["error"]["upstream_status"] = serde_json::json!(upstream_status);
            body["error"]["upstream_body"] = serde_json::json!(upstream_body);
        }
        (status, Json(body)).into_response()
    }
}
