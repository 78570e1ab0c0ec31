//! Status rules for quotes and invoices.

use chrono::NaiveDate;

use crate::db::{self, Database};
use crate::error::{BillingError, Result};
use crate::models::{DocumentType, Invoice, InvoiceStatus, Quote, QuoteStatus};

impl QuoteStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QuoteStatus::Accepted | QuoteStatus::Rejected | QuoteStatus::Expired
        )
    }

    pub fn can_transition_to(self, next: QuoteStatus) -> bool {
        use QuoteStatus::*;
        match (self, next) {
            (Draft, Sent) | (Sent, Accepted) | (Sent, Rejected) => true,
            (current, Expired) => !current.is_terminal(),
            _ => false,
        }
    }

    /// Only accepted quotes may become invoices.
    pub fn is_convertible(self) -> bool {
        self == QuoteStatus::Accepted
    }
}

impl InvoiceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        match (self, next) {
            (Draft, Sent) | (Sent, Paid) | (Sent, Overdue) => true,
            (current, Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Checks a transition given as status text for the given document kind.
///
/// Unknown status names are never legal.
pub fn can_transition(current: &str, next: &str, kind: DocumentType) -> bool {
    match kind {
        DocumentType::Quote => match (current.parse::<QuoteStatus>(), next.parse::<QuoteStatus>()) {
            (Ok(current), Ok(next)) => current.can_transition_to(next),
            _ => false,
        },
        DocumentType::Invoice => {
            match (current.parse::<InvoiceStatus>(), next.parse::<InvoiceStatus>()) {
                (Ok(current), Ok(next)) => current.can_transition_to(next),
                _ => false,
            }
        }
    }
}

pub fn check_quote_transition(from: QuoteStatus, to: QuoteStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
            kind: DocumentType::Quote,
        })
    }
}

pub fn check_invoice_transition(from: InvoiceStatus, to: InvoiceStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
            kind: DocumentType::Invoice,
        })
    }
}

/// Moves a quote of `company_id` to `next`, rejecting illegal transitions without writing.
pub fn apply_quote_status(
    db: &mut Database,
    company_id: &str,
    quote_id: &str,
    next: QuoteStatus,
) -> Result<Quote> {
    db.write_tx(|tx| {
        let quote = db::load_quote(tx, quote_id)?
            .filter(|quote| quote.company_id == company_id)
            .ok_or_else(|| BillingError::not_found("quote", quote_id))?;
        check_quote_transition(quote.status, next)?;
        if !db::update_quote_status(tx, quote_id, quote.status, next)? {
            return Err(BillingError::Conflict {
                entity: "quote",
                id: quote_id.to_string(),
                message: "status changed concurrently".into(),
            });
        }
        db::load_quote(tx, quote_id)?.ok_or_else(|| BillingError::not_found("quote", quote_id))
    })
    .inspect(|quote| {
        tracing::info!(quote_id, number = %quote.number, status = %quote.status, "quote status updated");
    })
}

/// Moves an invoice of `company_id` to `next`, rejecting illegal transitions without writing.
pub fn apply_invoice_status(
    db: &mut Database,
    company_id: &str,
    invoice_id: &str,
    next: InvoiceStatus,
) -> Result<Invoice> {
    db.write_tx(|tx| {
        let invoice = db::load_invoice(tx, invoice_id)?
            .filter(|invoice| invoice.company_id == company_id)
            .ok_or_else(|| BillingError::not_found("invoice", invoice_id))?;
        check_invoice_transition(invoice.status, next)?;
        if !db::update_invoice_status(tx, invoice_id, invoice.status, next)? {
            return Err(BillingError::Conflict {
                entity: "invoice",
                id: invoice_id.to_string(),
                message: "status changed concurrently".into(),
            });
        }
        db::load_invoice(tx, invoice_id)?.ok_or_else(|| BillingError::not_found("invoice", invoice_id))
    })
    .inspect(|invoice| {
        tracing::info!(invoice_id, number = %invoice.number, status = %invoice.status, "invoice status updated");
    })
}

/// Expires open quotes whose due date passed before `today`. Returns the expired ids.
pub fn expire_quotes(db: &mut Database, today: NaiveDate) -> Result<Vec<String>> {
    db.write_tx(|tx| {
        let mut expired = Vec::new();
        for id in db::quotes_past_due(tx, today)? {
            let Some(quote) = db::load_quote(tx, &id)? else {
                continue;
            };
            if quote.status.can_transition_to(QuoteStatus::Expired)
                && db::update_quote_status(tx, &id, quote.status, QuoteStatus::Expired)?
            {
                expired.push(id);
            }
        }
        Ok(expired)
    })
    .inspect(|expired| {
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired quotes past their due date");
        }
    })
}

/// Marks sent invoices whose due date passed before `today` as overdue.
pub fn mark_overdue_invoices(db: &mut Database, today: NaiveDate) -> Result<Vec<String>> {
    db.write_tx(|tx| {
        let mut overdue = Vec::new();
        for id in db::invoices_past_due(tx, today)? {
            let Some(invoice) = db::load_invoice(tx, &id)? else {
                continue;
            };
            if invoice.status.can_transition_to(InvoiceStatus::Overdue)
                && db::update_invoice_status(tx, &id, invoice.status, InvoiceStatus::Overdue)?
            {
                overdue.push(id);
            }
        }
        Ok(overdue)
    })
    .inspect(|overdue| {
        if !overdue.is_empty() {
            tracing::info!(count = overdue.len(), "marked invoices overdue");
        }
    })
}
