use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{BillingError, NotConvertibleReason};

/// Error returned by every handler; maps the billing taxonomy onto HTTP.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str),
    BadRequest(String),
    Billing(BillingError),
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        ApiError::Billing(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(err) => billing_status(err),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Billing(err) => match err {
                BillingError::NotFound { .. }
                | BillingError::QuoteNotConvertible {
                    reason: NotConvertibleReason::NotFound,
                    ..
                } => "not_found",
                BillingError::QuoteNotConvertible {
                    reason: NotConvertibleReason::WrongCompany,
                    ..
                } => "wrong_company",
                BillingError::QuoteNotConvertible { .. } => "not_convertible",
                BillingError::InvalidTransition { .. } => "invalid_transition",
                BillingError::Conflict { .. } => "conflict",
                BillingError::Validation(_) => "validation",
                err if err.is_retryable() => "unavailable",
                _ => "internal",
            },
        }
    }
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::NotFound { .. } => StatusCode::NOT_FOUND,
        BillingError::QuoteNotConvertible { reason, .. } => match reason {
            NotConvertibleReason::NotFound => StatusCode::NOT_FOUND,
            NotConvertibleReason::WrongCompany => StatusCode::FORBIDDEN,
            NotConvertibleReason::NotAccepted => StatusCode::CONFLICT,
        },
        BillingError::InvalidTransition { .. } | BillingError::Conflict { .. } => StatusCode::CONFLICT,
        BillingError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        err if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let (message, retryable) = match &self {
            ApiError::Unauthorized(message) => (message.to_string(), false),
            ApiError::BadRequest(message) => (message.clone(), false),
            ApiError::Billing(err) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %err, "request failed");
                ("internal error".to_string(), false)
            }
            ApiError::Billing(err) => (err.to_string(), err.is_retryable()),
        };

        let body = Json(json!({
            "error": code,
            "message": message,
            "retryable": retryable,
        }));
        (status, body).into_response()
    }
}
