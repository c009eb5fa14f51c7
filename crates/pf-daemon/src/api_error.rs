//! HTTP mapping for the core error enum.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use pf_core::error::CoreError;

/// Newtype carrying a [`CoreError`] out of a handler.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            CoreError::RateLimited {
                kind,
                retry_after_secs,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                Json(json!({
                    "error": kind.to_string(),
                    "retry_after": retry_after_secs
                })),
            )
                .into_response(),
            CoreError::Unauthenticated(msg) => {
                (StatusCode::UNAUTHORIZED, Json(json!({"error": msg}))).into_response()
            }
            CoreError::Forbidden(msg) => {
                (StatusCode::FORBIDDEN, Json(json!({"error": msg}))).into_response()
            }
            CoreError::Invalid(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
            }
            CoreError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({"error": msg}))).into_response()
            }
            CoreError::Conflict(msg) => {
                (StatusCode::CONFLICT, Json(json!({"error": msg}))).into_response()
            }
            CoreError::NoNodeAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": CoreError::NoNodeAvailable.to_string()})),
            )
                .into_response(),
            CoreError::JobTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({"error": CoreError::JobTimeout.to_string()})),
            )
                .into_response(),
            CoreError::NodeDisconnected => (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": CoreError::NodeDisconnected.to_string()})),
            )
                .into_response(),
            err @ (CoreError::Cancelled | CoreError::Storage(_) | CoreError::Internal(_)) => {
                // Details stay in the logs; the caller gets an opaque 500.
                error!(error = %err, "internal error on api path");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pf_core::error::RateLimitKind;

    #[test]
    fn rate_limited_maps_to_429_with_retry_after() {
        let response =
            ApiError(CoreError::rate_limited(RateLimitKind::PerMinute, 17)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("retry-after").unwrap().to_str().unwrap(),
            "17"
        );
    }

    #[test]
    fn storage_errors_are_opaque() {
        let response = ApiError(CoreError::Internal("secret detail".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn status_mapping_table() {
        let cases = [
            (CoreError::Unauthenticated("x".into()), StatusCode::UNAUTHORIZED),
            (CoreError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (CoreError::Invalid("x".into()), StatusCode::BAD_REQUEST),
            (CoreError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (CoreError::Conflict("x".into()), StatusCode::CONFLICT),
            (CoreError::NoNodeAvailable, StatusCode::SERVICE_UNAVAILABLE),
            (CoreError::JobTimeout, StatusCode::GATEWAY_TIMEOUT),
            (CoreError::NodeDisconnected, StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
