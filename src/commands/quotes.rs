use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::CompanyId;
use crate::models::{NewDocument, Quote, QuoteStatus};
use crate::services::state::AppState;
use crate::services::{conversion, documents, lifecycle};

#[derive(Debug, Deserialize)]
pub struct StatusPayload {
    pub status: QuoteStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertResponse {
    pub invoice_id: String,
    pub number: String,
}

pub async fn create(
    State(state): State<AppState>,
    CompanyId(company_id): CompanyId,
    Json(input): Json<NewDocument>,
) -> Result<(StatusCode, Json<Quote>), ApiError> {
    let quote = state
        .with_db(move |db| documents::create_quote(db, &company_id, input))
        .await?;
    Ok((StatusCode::CREATED, Json(quote)))
}

pub async fn update_status(
    State(state): State<AppState>,
    CompanyId(company_id): CompanyId,
    Path(quote_id): Path<String>,
    Json(payload): Json<StatusPayload>,
) -> Result<Json<Quote>, ApiError> {
    let quote = state
        .with_db(move |db| lifecycle::apply_quote_status(db, &company_id, &quote_id, payload.status))
        .await?;
    Ok(Json(quote))
}

pub async fn convert(
    State(state): State<AppState>,
    CompanyId(company_id): CompanyId,
    Path(quote_id): Path<String>,
) -> Result<(StatusCode, Json<ConvertResponse>), ApiError> {
    let now = Utc::now();
    let invoice = state
        .with_db(move |db| conversion::convert(db, &company_id, &quote_id, now))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ConvertResponse {
            invoice_id: invoice.id,
            number: invoice.number,
        }),
    ))
}
