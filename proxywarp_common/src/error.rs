use core::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Gateway error taxonomy. Every variant knows the status it surfaces
/// with; `Persistence` is logged and retried instead of being shown to
/// a client.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Input(String),
    #[error("no upstream is registered for token '{0}'")]
    UnknownToken(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("the gateway did not produce a response in time")]
    GatewayTimeout,
    #[error("token database error: {0}")]
    Persistence(String),
    #[error("internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Input(_) | GatewayError::UnknownToken(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Persistence(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            GatewayError::Input(_) => "Bad Request",
            GatewayError::UnknownToken(_) => "Unknown Proxy Token",
            GatewayError::Upstream(_) => "Bad Gateway",
            GatewayError::GatewayTimeout => "Gateway Timeout",
            GatewayError::Persistence(_) => "Storage Error",
            GatewayError::Internal(_) => "Internal Error",
        }
    }
}

// Make our own error that wraps `anyhow::Error`.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

pub type Result<T> = std::result::Result<T, AppError>;

// Tell axum how to convert `AppError` into a response. JSON endpoints
// surface the taxonomy status; anything else is a 500.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<GatewayError>()
            .map(GatewayError::status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(json!({
                "error": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// This enables using `?` on functions that return `Result<_, anyhow::Error>` to turn them into
// `Result<_, AppError>`. That way you don't need to do that manually.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        assert_eq!(
            GatewayError::Input("bad url".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::UnknownToken("abc123".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Upstream("connect refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::GatewayTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn app_error_downcasts_gateway_status() {
        let err = AppError(anyhow::Error::new(GatewayError::Input("missing url".into())));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let err = AppError(anyhow::anyhow!("something else"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
