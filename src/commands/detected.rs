use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use super::error::ApiError;
use super::CompanyId;
use crate::models::DetectedQuote;
use crate::services::detected::{self, Approval};
use crate::services::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagePayload {
    pub client_id: String,
    /// Raw extraction output; checked against the payload schema.
    pub payload: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveParams {
    #[serde(default)]
    pub convert: bool,
}

pub async fn stage(
    State(state): State<AppState>,
    CompanyId(company_id): CompanyId,
    Json(body): Json<StagePayload>,
) -> Result<(StatusCode, Json<DetectedQuote>), ApiError> {
    let staged = state
        .with_db(move |db| detected::stage_detected_quote(db, &company_id, &body.client_id, &body.payload))
        .await?;
    Ok((StatusCode::CREATED, Json(staged)))
}

pub async fn approve(
    State(state): State<AppState>,
    CompanyId(company_id): CompanyId,
    Path(detected_id): Path<String>,
    Query(params): Query<ApproveParams>,
) -> Result<Json<Approval>, ApiError> {
    let now = Utc::now();
    let approval = state
        .with_db(move |db| {
            detected::approve_detected_quote(db, &company_id, &detected_id, params.convert, now)
        })
        .await?;
    Ok(Json(approval))
}

pub async fn dismiss(
    State(state): State<AppState>,
    CompanyId(company_id): CompanyId,
    Path(detected_id): Path<String>,
) -> Result<Json<DetectedQuote>, ApiError> {
    let dismissed = state
        .with_db(move |db| detected::dismiss_detected_quote(db, &company_id, &detected_id))
        .await?;
    Ok(Json(dismissed))
}
