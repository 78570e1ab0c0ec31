//! Direct creation of numbered quotes and invoices.

use chrono::Utc;

use crate::db::{self, Database};
use crate::error::Result;
use crate::models::{
    DocumentType, Invoice, InvoiceStatus, NewDocument, Quote, QuoteStatus, Totals,
};
use crate::services::sequence;

/// Creates a DRAFT quote with a freshly allocated number.
pub fn create_quote(db: &mut Database, company_id: &str, input: NewDocument) -> Result<Quote> {
    input.validate()?;
    let totals = Totals::compute(&input.items, input.tax);

    let quote = db
        .write_tx(|tx| {
            let settings = db::numbering_settings(tx, company_id)?;
            let number = sequence::allocate(tx, company_id, DocumentType::Quote, &settings)?;
            let quote = quote_from_input(company_id, number.formatted, &input, totals, QuoteStatus::Draft);
            db::insert_quote(tx, &quote)?;
            Ok(quote)
        })
        .map_err(|e| e.into_allocation_failure(company_id, DocumentType::Quote))?;

    tracing::info!(company_id, quote_id = %quote.id, number = %quote.number, "created quote");
    Ok(quote)
}

/// Creates a DRAFT invoice with a freshly allocated number.
pub fn create_invoice(db: &mut Database, company_id: &str, input: NewDocument) -> Result<Invoice> {
    input.validate()?;
    let totals = Totals::compute(&input.items, input.tax);

    let invoice = db
        .write_tx(|tx| {
            let settings = db::numbering_settings(tx, company_id)?;
            let number = sequence::allocate(tx, company_id, DocumentType::Invoice, &settings)?;
            let now = Utc::now();
            let invoice = Invoice {
                id: uuid::Uuid::new_v4().to_string(),
                company_id: company_id.to_string(),
                client_id: input.client_id.clone(),
                number: number.formatted,
                title: input.title.clone(),
                issue_date: input.issue_date,
                due_date: input.due_date,
                currency: input.currency,
                tax: input.tax,
                subtotal: totals.subtotal,
                tax_amount: totals.tax_amount,
                total: totals.total,
                balance_due: totals.total,
                status: InvoiceStatus::Draft,
                quote_id: None,
                recurring_template_id: None,
                items: input.items.clone(),
                created_at: now,
                updated_at: now,
            };
            db::insert_invoice(tx, &invoice)?;
            Ok(invoice)
        })
        .map_err(|e| e.into_allocation_failure(company_id, DocumentType::Invoice))?;

    tracing::info!(company_id, invoice_id = %invoice.id, number = %invoice.number, "created invoice");
    Ok(invoice)
}

pub(crate) fn quote_from_input(
    company_id: &str,
    number: String,
    input: &NewDocument,
    totals: Totals,
    status: QuoteStatus,
) -> Quote {
    let now = Utc::now();
    Quote {
        id: uuid::Uuid::new_v4().to_string(),
        company_id: company_id.to_string(),
        client_id: input.client_id.clone(),
        number,
        title: input.title.clone(),
        issue_date: input.issue_date,
        due_date: input.due_date,
        currency: input.currency,
        tax: input.tax,
        subtotal: totals.subtotal,
        tax_amount: totals.tax_amount,
        total: totals.total,
        status,
        items: input.items.clone(),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::models::{Currency, LineItem};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn input(client_id: &str) -> NewDocument {
        NewDocument {
            client_id: client_id.to_string(),
            title: "Audit".into(),
            issue_date: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            due_date: Some(NaiveDate::from_ymd_opt(2026, 4, 30).unwrap()),
            currency: Currency::Eur,
            tax: Decimal::new(10, 0),
            items: vec![LineItem::new("A", Decimal::new(2, 0), Decimal::new(10, 0))],
        }
    }

    #[test]
    fn quotes_and_invoices_draw_from_separate_sequences() {
        let mut db = Database::open_in_memory().unwrap();
        let company = db.create_company("Acme", None, None, None).unwrap();
        let client = db.create_client(&company.id, "Globex", None).unwrap();

        let quote = create_quote(&mut db, &company.id, input(&client.id)).unwrap();
        let invoice = create_invoice(&mut db, &company.id, input(&client.id)).unwrap();
        let second = create_invoice(&mut db, &company.id, input(&client.id)).unwrap();

        assert_eq!(quote.number, "QUO-00001");
        assert_eq!(invoice.number, "INV-00001");
        assert_eq!(second.number, "INV-00002");
        assert_eq!(invoice.total, Decimal::new(22, 0));
        assert_eq!(invoice.balance_due, invoice.total);
        assert_eq!(invoice.status, InvoiceStatus::Draft);
    }

    #[test]
    fn invalid_input_allocates_nothing() {
        let mut db = Database::open_in_memory().unwrap();
        let company = db.create_company("Acme", None, None, None).unwrap();
        let client = db.create_client(&company.id, "Globex", None).unwrap();

        let mut bad = input(&client.id);
        bad.tax = Decimal::new(120, 0);
        assert!(matches!(
            create_invoice(&mut db, &company.id, bad),
            Err(BillingError::Validation(_))
        ));
        let next = sequence::peek_next(db.conn(), &company.id, DocumentType::Invoice).unwrap();
        assert_eq!(next.value, 1);
    }

    #[test]
    fn failed_insert_rolls_back_the_number() {
        let mut db = Database::open_in_memory().unwrap();
        let company = db.create_company("Acme", None, None, None).unwrap();

        let err = create_invoice(&mut db, &company.id, input("no-such-client")).unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));
        assert!(db.invoices_for_company(&company.id).unwrap().is_empty());
    }
}
