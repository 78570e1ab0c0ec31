//! Staging and approval of quotes detected by the email extraction pipeline.

use chrono::{DateTime, Utc};
use jsonschema::JSONSchema;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};

use crate::db::{self, Database};
use crate::error::{BillingError, Result};
use crate::models::{
    Currency, DetectedQuote, DetectedQuotePayload, DetectedQuoteStatus, DocumentType, Invoice,
    NewDocument, Quote, QuoteStatus, Totals,
};
use crate::services::{conversion, documents, sequence};

/// Everything written by one approval.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub detected: DetectedQuote,
    pub quote: Quote,
    pub invoice: Option<Invoice>,
}

fn payload_schema() -> Value {
    let amount = json!({"type": ["string", "number"], "pattern": "^-?[0-9]+(\\.[0-9]+)?$"});
    let date = json!({"type": ["string", "null"], "pattern": "^[0-9]{4}-[0-9]{2}-[0-9]{2}$"});
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["title", "items"],
        "properties": {
            "title": {"type": "string", "minLength": 1},
            "currency": {"enum": ["EUR", "USD", null]},
            "tax": {"type": ["string", "number", "null"], "pattern": "^[0-9]+(\\.[0-9]+)?$"},
            "issue_date": date,
            "due_date": date,
            "source_message_id": {"type": ["string", "null"]},
            "items": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["description", "qty", "price"],
                    "properties": {
                        "description": {"type": "string", "minLength": 1},
                        "qty": amount,
                        "price": amount
                    }
                }
            }
        }
    })
}

/// Checks raw extraction output and decodes it into a payload.
pub fn parse_payload(raw: &Value) -> Result<DetectedQuotePayload> {
    let schema = JSONSchema::compile(&payload_schema())
        .map_err(|e| BillingError::InvalidRecord(format!("detected quote schema: {e}")))?;
    if let Err(errors) = schema.validate(raw) {
        let problems: Vec<String> = errors
            .map(|err| format!("{} at '{}'", err, err.instance_path))
            .collect();
        return Err(BillingError::validation(format!(
            "detected quote payload rejected: {}",
            problems.join("; ")
        )));
    }

    let payload: DetectedQuotePayload = serde_json::from_value(raw.clone())
        .map_err(|e| BillingError::validation(format!("detected quote payload: {e}")))?;
    crate::models::validate_pricing(payload.tax.unwrap_or(Decimal::ZERO), &payload.items)?;
    Ok(payload)
}

/// Stores validated extraction output as a PENDING candidate for `client_id`.
pub fn stage_detected_quote(
    db: &mut Database,
    company_id: &str,
    client_id: &str,
    raw: &Value,
) -> Result<DetectedQuote> {
    let payload = parse_payload(raw)?;
    let now = Utc::now();
    let detected = DetectedQuote {
        id: uuid::Uuid::new_v4().to_string(),
        company_id: company_id.to_string(),
        client_id: client_id.to_string(),
        payload,
        status: DetectedQuoteStatus::Pending,
        quote_id: None,
        created_at: now,
        updated_at: now,
    };

    db.write_tx(|tx| {
        match db::client_company(tx, client_id)? {
            Some(owner) if owner == company_id => {}
            _ => return Err(BillingError::not_found("client", client_id)),
        }
        db::insert_detected_quote(tx, &detected)
    })?;

    tracing::info!(
        company_id,
        detected_id = %detected.id,
        source = ?detected.payload.source_message_id,
        "staged detected quote"
    );
    Ok(detected)
}

fn load_pending(conn: &rusqlite::Connection, company_id: &str, detected_id: &str) -> Result<DetectedQuote> {
    let detected = db::load_detected_quote(conn, detected_id)?
        .filter(|detected| detected.company_id == company_id)
        .ok_or_else(|| BillingError::not_found("detected quote", detected_id))?;
    if detected.status != DetectedQuoteStatus::Pending {
        return Err(BillingError::Conflict {
            entity: "detected quote",
            id: detected_id.to_string(),
            message: format!("already {}", detected.status),
        });
    }
    Ok(detected)
}

fn lost_race(detected_id: &str) -> BillingError {
    BillingError::Conflict {
        entity: "detected quote",
        id: detected_id.to_string(),
        message: "status changed concurrently".into(),
    }
}

/// Missing extraction fields fall back to EUR, no tax and today's date.
pub fn document_from_payload(client_id: &str, payload: &DetectedQuotePayload, now: DateTime<Utc>) -> NewDocument {
    NewDocument {
        client_id: client_id.to_string(),
        title: payload.title.clone(),
        issue_date: payload.issue_date.unwrap_or_else(|| now.date_naive()),
        due_date: payload.due_date,
        currency: payload.currency.unwrap_or(Currency::Eur),
        tax: payload.tax.unwrap_or(Decimal::ZERO),
        items: payload.items.clone(),
    }
}

/// Turns a PENDING candidate into a quote.
///
/// With `convert` the quote is created ACCEPTED and converted to a DRAFT
/// invoice in the same transaction; otherwise it starts as DRAFT.
pub fn approve_detected_quote(
    db: &mut Database,
    company_id: &str,
    detected_id: &str,
    convert: bool,
    now: DateTime<Utc>,
) -> Result<Approval> {
    let approval = db
        .write_tx(|tx| {
            let detected = load_pending(tx, company_id, detected_id)?;
            let input = document_from_payload(&detected.client_id, &detected.payload, now);
            input.validate()?;

            let status = if convert { QuoteStatus::Accepted } else { QuoteStatus::Draft };
            let settings = db::numbering_settings(tx, company_id)?;
            let number = sequence::allocate(tx, company_id, DocumentType::Quote, &settings)?;
            let totals = Totals::compute(&input.items, input.tax);
            let quote = documents::quote_from_input(company_id, number.formatted, &input, totals, status);
            db::insert_quote(tx, &quote)?;

            let invoice = if convert {
                Some(conversion::convert_loaded(tx, &quote, now)?)
            } else {
                None
            };

            if !db::update_detected_status(
                tx,
                detected_id,
                DetectedQuoteStatus::Pending,
                DetectedQuoteStatus::Approved,
                Some(&quote.id),
            )? {
                return Err(lost_race(detected_id));
            }
            let detected = db::load_detected_quote(tx, detected_id)?
                .ok_or_else(|| BillingError::not_found("detected quote", detected_id))?;
            Ok(Approval {
                detected,
                quote,
                invoice,
            })
        })
        .map_err(|e| e.into_allocation_failure(company_id, DocumentType::Quote))?;

    tracing::info!(
        company_id,
        detected_id,
        quote_number = %approval.quote.number,
        invoice_number = ?approval.invoice.as_ref().map(|invoice| invoice.number.as_str()),
        "approved detected quote"
    );
    Ok(approval)
}

pub fn dismiss_detected_quote(db: &mut Database, company_id: &str, detected_id: &str) -> Result<DetectedQuote> {
    let detected = db.write_tx(|tx| {
        load_pending(tx, company_id, detected_id)?;
        if !db::update_detected_status(
            tx,
            detected_id,
            DetectedQuoteStatus::Pending,
            DetectedQuoteStatus::Dismissed,
            None,
        )? {
            return Err(lost_race(detected_id));
        }
        db::load_detected_quote(tx, detected_id)?
            .ok_or_else(|| BillingError::not_found("detected quote", detected_id))
    })?;
    tracing::info!(company_id, detected_id, "dismissed detected quote");
    Ok(detected)
}
