use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid or missing token")]
    Unauthorized,
    #[error("rate limit exceeded, retry in {}s", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },
    #[error("{field} exceeds limit of {limit}")]
    ValidationFailed { field: &'static str, limit: usize },
    #[error("malformed request: {0}")]
    MalformedInput(String),
    #[error("generation failed: {0}")]
    Engine(#[from] EngineError),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::ValidationFailed { .. } | ServiceError::MalformedInput(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for the error `type` field and the rejection metric.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unauthorized => "unauthorized",
            ServiceError::RateLimited { .. } => "rate_limited",
            ServiceError::ValidationFailed { .. } => "validation",
            ServiceError::MalformedInput(_) => "malformed",
            ServiceError::Engine(_) => "engine_error",
        }
    }

    /// JSON body shared by plain error responses and in-stream error events.
    pub fn body(&self) -> serde_json::Value {
        let param = match self {
            ServiceError::ValidationFailed { field, .. } => Some(*field),
            _ => None,
        };
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "param": param,
            }
        })
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), axum::Json(self.body())).into_response();

        match &self {
            ServiceError::Unauthorized => {
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer"),
                );
            }
            ServiceError::RateLimited { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            _ => {}
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_field_and_ceiling() {
        let err = ServiceError::ValidationFailed {
            field: "max_tokens",
            limit: 512,
        };
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let body = err.body();
        assert_eq!(body["error"]["param"], "max_tokens");
        assert_eq!(body["error"]["message"], "max_tokens exceeds limit of 512");
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let response = ServiceError::RateLimited {
            retry_after: Duration::from_millis(200),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn engine_failures_are_server_errors() {
        let err = ServiceError::from(EngineError::PromptMismatch);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.kind(), "engine_error");
    }
}
