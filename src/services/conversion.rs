//! Turning an accepted quote into a draft invoice.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::db::{self, Database};
use crate::error::{BillingError, NotConvertibleReason, Result};
use crate::models::{DocumentType, Invoice, InvoiceStatus, Quote};
use crate::services::sequence;

/// Converts quote `quote_id` of `company_id` into a new DRAFT invoice.
///
/// Number allocation, the invoice row and its items are written in one
/// transaction. The quote itself is left as it was.
pub fn convert(
    db: &mut Database,
    company_id: &str,
    quote_id: &str,
    now: DateTime<Utc>,
) -> Result<Invoice> {
    let invoice = db
        .write_tx(|tx| {
            let quote = load_convertible(tx, company_id, quote_id)?;
            convert_loaded(tx, &quote, now)
        })
        .map_err(|e| e.into_allocation_failure(company_id, DocumentType::Invoice))?;

    tracing::info!(
        company_id,
        quote_id,
        invoice_id = %invoice.id,
        number = %invoice.number,
        "converted quote to invoice"
    );
    Ok(invoice)
}

/// Loads a quote and checks it may be converted by `company_id`.
pub(crate) fn load_convertible(conn: &Connection, company_id: &str, quote_id: &str) -> Result<Quote> {
    let not_convertible = |reason| BillingError::QuoteNotConvertible {
        quote_id: quote_id.to_string(),
        reason,
    };

    let quote = db::load_quote(conn, quote_id)?
        .ok_or_else(|| not_convertible(NotConvertibleReason::NotFound))?;
    if quote.company_id != company_id {
        return Err(not_convertible(NotConvertibleReason::WrongCompany));
    }
    if !quote.status.is_convertible() {
        return Err(not_convertible(NotConvertibleReason::NotAccepted));
    }
    Ok(quote)
}

/// Writes the invoice for an already checked quote on an open transaction.
pub(crate) fn convert_loaded(conn: &Connection, quote: &Quote, now: DateTime<Utc>) -> Result<Invoice> {
    let settings = db::numbering_settings(conn, &quote.company_id)?;
    let number = sequence::allocate(conn, &quote.company_id, DocumentType::Invoice, &settings)?;
    let invoice = invoice_from_quote(quote, number.formatted, now);
    db::insert_invoice(conn, &invoice)?;
    Ok(invoice)
}

/// Snapshot of the quote's financial fields; amounts are copied, not recomputed.
pub fn invoice_from_quote(quote: &Quote, number: String, now: DateTime<Utc>) -> Invoice {
    Invoice {
        id: uuid::Uuid::new_v4().to_string(),
        company_id: quote.company_id.clone(),
        client_id: quote.client_id.clone(),
        number,
        title: quote.title.clone(),
        issue_date: quote.issue_date,
        due_date: Some(quote.due_date.unwrap_or_else(|| now.date_naive())),
        currency: quote.currency,
        tax: quote.tax,
        subtotal: quote.subtotal,
        tax_amount: quote.tax_amount,
        total: quote.total,
        balance_due: quote.total,
        status: InvoiceStatus::Draft,
        quote_id: Some(quote.id.clone()),
        recurring_template_id: None,
        items: quote.items.clone(),
        created_at: now,
        updated_at: now,
    }
}
