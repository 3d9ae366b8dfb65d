//! Error taxonomy for the HTTP API surface.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors surfaced to API callers as structured JSON.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("insufficient scope")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("rate limit exceeded")]
    RateLimited { limit: u32, reset: u64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn code(&self) -> (&'static str, StatusCode) {
        match self {
            ApiError::Validation(_) => ("validation_error", StatusCode::BAD_REQUEST),
            ApiError::Unauthorized => ("unauthorized", StatusCode::UNAUTHORIZED),
            ApiError::Forbidden => ("forbidden", StatusCode::FORBIDDEN),
            ApiError::NotFound(_) => ("not_found", StatusCode::NOT_FOUND),
            ApiError::Conflict(_) => ("conflict", StatusCode::CONFLICT),
            ApiError::RateLimited { .. } => ("rate_limited", StatusCode::TOO_MANY_REQUESTS),
            ApiError::Internal(_) => ("internal_error", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = self.code();
        // Internal details go to the log, never to the caller.
        let message = match &self {
            ApiError::Internal(e) => {
                error!("internal error: {e:#}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let mut resp = (status, Json(json!({ "error": code, "message": message }))).into_response();
        if let ApiError::RateLimited { limit, reset } = &self {
            let headers = resp.headers_mut();
            headers.insert("X-RateLimit-Limit", header_value(*limit as u64));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
            headers.insert("X-RateLimit-Reset", header_value(*reset));
        }
        resp
    }
}

fn header_value(v: u64) -> HeaderValue {
    HeaderValue::from_str(&v.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn validation_maps_to_400() {
        let resp = ApiError::Validation("bad period".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "validation_error");
        assert_eq!(body["message"], "bad period");
    }

    #[tokio::test]
    async fn rate_limited_carries_reset_headers() {
        let resp = ApiError::RateLimited {
            limit: 100,
            reset: 1_700_003_600,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["X-RateLimit-Limit"], "100");
        assert_eq!(resp.headers()["X-RateLimit-Remaining"], "0");
        assert_eq!(resp.headers()["X-RateLimit-Reset"], "1700003600");
    }

    #[tokio::test]
    async fn internal_hides_detail() {
        let resp = ApiError::Internal(anyhow::anyhow!("db constraint violated")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["message"], "internal server error");
    }
}
