use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use super::error::ApiError;
use super::CompanyId;
use crate::models::{Invoice, InvoiceStatus, NewDocument};
use crate::services::state::AppState;
use crate::services::{documents, lifecycle};

#[derive(Debug, Deserialize)]
pub struct StatusPayload {
    pub status: InvoiceStatus,
}

pub async fn create(
    State(state): State<AppState>,
    CompanyId(company_id): CompanyId,
    Json(input): Json<NewDocument>,
) -> Result<(StatusCode, Json<Invoice>), ApiError> {
    let invoice = state
        .with_db(move |db| documents::create_invoice(db, &company_id, input))
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn update_status(
    State(state): State<AppState>,
    CompanyId(company_id): CompanyId,
    Path(invoice_id): Path<String>,
    Json(payload): Json<StatusPayload>,
) -> Result<Json<Invoice>, ApiError> {
    let invoice = state
        .with_db(move |db| lifecycle::apply_invoice_status(db, &company_id, &invoice_id, payload.status))
        .await?;
    Ok(Json(invoice))
}
