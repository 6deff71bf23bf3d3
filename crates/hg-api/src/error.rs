//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hg_dispatch::ExchangeError;
use serde::Serialize;
use thiserror::Error;

/// Standard API error body
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("OAuth install flow is not configured")]
    NotConfigured,

    #[error("Install failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, code, details) = match &self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", None),
            Self::NotConfigured => (StatusCode::NOT_FOUND, "NOT_CONFIGURED", None),
            Self::Exchange(ExchangeError::NotConfigured) => {
                (StatusCode::NOT_FOUND, "NOT_CONFIGURED", None)
            }
            Self::Exchange(ExchangeError::Store(msg)) => {
                tracing::error!(error = %msg, "Install flow storage failure");
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", None)
            }
            Self::Exchange(e) => (
                StatusCode::BAD_REQUEST,
                "EXCHANGE_FAILED",
                Some(serde_json::json!({ "reason": exchange_reason(e) })),
            ),
            Self::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", None),
        };

        let body = Json(ApiError {
            error: code.to_string(),
            message: self.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

fn exchange_reason(error: &ExchangeError) -> &'static str {
    match error {
        ExchangeError::InvalidState => "invalid_state",
        ExchangeError::RedirectMismatch => "redirect_mismatch",
        ExchangeError::MissingCode => "missing_code",
        ExchangeError::Http(_) => "provider_unreachable",
        ExchangeError::Provider(_) => "provider_rejected",
        ExchangeError::MalformedResponse(_) => "malformed_response",
        ExchangeError::Store(_) => "storage",
        ExchangeError::NotConfigured => "not_configured",
    }
}

pub type ApiResult<T> = std::result::Result<T, HttpError>;
