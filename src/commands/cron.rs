use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use super::error::ApiError;
use crate::models::{RunReport, TemplateFailure};
use crate::services::lifecycle::{expire_quotes, mark_overdue_invoices};
use crate::services::recurring::RecurringGenerator;
use crate::services::state::AppState;
use crate::utils::secrets_match;

#[derive(Debug, Serialize)]
pub struct IdList {
    pub count: usize,
    pub ids: Vec<String>,
}

impl From<Vec<String>> for IdList {
    fn from(ids: Vec<String>) -> Self {
        IdList {
            count: ids.len(),
            ids,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FailureList {
    pub count: usize,
    pub details: Vec<TemplateFailure>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    /// Ids of the generated invoices.
    pub generated: IdList,
    pub errors: FailureList,
    pub skipped: IdList,
    pub deferred: IdList,
    pub duration_ms: u64,
}

impl From<RunReport> for RunResponse {
    fn from(report: RunReport) -> Self {
        RunResponse {
            generated: report
                .generated
                .into_iter()
                .map(|generated| generated.invoice_id)
                .collect::<Vec<_>>()
                .into(),
            errors: FailureList {
                count: report.errors.len(),
                details: report.errors,
            },
            skipped: report.skipped.into(),
            deferred: report.deferred.into(),
            duration_ms: report.duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepResponse {
    pub expired_quotes: IdList,
    pub overdue_invoices: IdList,
}

/// Accepts only `Authorization: Bearer <CRON_SECRET>`.
fn authorize(headers: &HeaderMap, secret: &str) -> Result<(), ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    match token {
        Some(token) if secrets_match(token, secret) => Ok(()),
        _ => {
            tracing::warn!("rejected scheduler call with missing or wrong credential");
            Err(ApiError::Unauthorized("invalid scheduler credential"))
        }
    }
}

pub async fn run_recurring(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RunResponse>, ApiError> {
    authorize(&headers, &state.config.cron_secret)?;

    let options = state.run_options();
    let now = Utc::now();
    let report = state
        .with_db(move |db| RecurringGenerator::run(db, now, &options))
        .await?;
    Ok(Json(report.into()))
}

pub async fn sweep_statuses(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SweepResponse>, ApiError> {
    authorize(&headers, &state.config.cron_secret)?;

    let today = Utc::now().date_naive();
    let (expired, overdue) = state
        .with_db(move |db| Ok((expire_quotes(db, today)?, mark_overdue_invoices(db, today)?)))
        .await?;
    tracing::info!(
        expired_quotes = expired.len(),
        overdue_invoices = overdue.len(),
        "status sweep finished"
    );
    Ok(Json(SweepResponse {
        expired_quotes: expired.into(),
        overdue_invoices: overdue.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_secret_must_match_exactly() {
        let mut headers = HeaderMap::new();
        assert!(authorize(&headers, "tick").is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tock"));
        assert!(authorize(&headers, "tick").is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("tick"));
        assert!(authorize(&headers, "tick").is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tick"));
        assert!(authorize(&headers, "tick").is_ok());
    }
}
