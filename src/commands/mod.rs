//! HTTP surface of the billing core.

pub mod cron;
pub mod detected;
pub mod error;
pub mod health;
pub mod invoices;
pub mod quotes;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::Router;

use crate::services::state::AppState;
use error::ApiError;

/// Header set by the upstream identity layer.
pub const COMPANY_HEADER: &str = "x-company-id";

/// Company the caller acts for.
#[derive(Debug, Clone)]
pub struct CompanyId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for CompanyId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(COMPANY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| CompanyId(value.to_string()))
            .ok_or(ApiError::Unauthorized("missing company identity"))
    }
}

pub fn router(state: AppState) -> Router {
    let cron = Router::new()
        .route("/api/cron/recurring-invoices", post(cron::run_recurring))
        .route("/api/cron/status-sweep", post(cron::sweep_statuses));

    let documents = Router::new()
        .route("/api/quotes", post(quotes::create))
        .route("/api/quotes/{id}/status", post(quotes::update_status))
        .route("/api/quotes/{id}/convert", post(quotes::convert))
        .route("/api/invoices", post(invoices::create))
        .route("/api/invoices/{id}/status", post(invoices::update_status));

    let detected = Router::new()
        .route("/api/detected-quotes", post(detected::stage))
        .route("/api/detected-quotes/{id}/approve", post(detected::approve))
        .route("/api/detected-quotes/{id}/dismiss", post(detected::dismiss));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(cron)
        .merge(documents)
        .merge(detected)
        .with_state(state)
}
