//! API-boundary error taxonomy.
//!
//! Every operation surfaces one of these kinds; the [`IntoResponse`]
//! implementation maps them onto the HTTP contract. Transaction failures roll
//! back their whole stage and come out as 5xx with a diagnostic log entry;
//! push, email and PDF side effects never produce an error here.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed or unprocessable input. No persistence mutation happened.
    #[error("{0}")]
    Validation(String),

    /// The request conflicts with current state (already paid, already
    /// taken, duplicate booking window).
    #[error("{reason}")]
    Conflict {
        reason: String,
        existing_request_id: Option<i64>,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    /// Gateway credentials are absent from the environment.
    #[error("Payment gateway is not configured")]
    GatewayUnconfigured,

    /// Client-side payment signature did not verify.
    #[error("Invalid payment signature")]
    SignatureMismatch,

    /// Webhook signature did not verify.
    #[error("Invalid webhook signature")]
    WebhookSignatureMismatch,

    /// The payment gateway rejected or failed an upstream call.
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        ApiError::Conflict {
            reason: reason.into(),
            existing_request_id: None,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::GatewayUnconfigured => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::SignatureMismatch => StatusCode::BAD_REQUEST,
            ApiError::WebhookSignatureMismatch => StatusCode::UNAUTHORIZED,
            ApiError::Gateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed");
        }
        let mut body = json!({
            "success": false,
            "message": self.to_string(),
        });
        if let ApiError::Conflict {
            existing_request_id: Some(existing),
            ..
        } = &self
        {
            body["existingRequestId"] = json!(existing);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::conflict("taken").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::NotFound("request").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::GatewayUnconfigured.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::WebhookSignatureMismatch.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::SignatureMismatch.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_gateway_unconfigured_message() {
        assert_eq!(
            ApiError::GatewayUnconfigured.to_string(),
            "Payment gateway is not configured"
        );
    }
}
