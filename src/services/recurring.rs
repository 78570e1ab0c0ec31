//! Recurring invoice generation.
//!
//! One run loads the due templates once and then treats every template as an
//! independent unit: re-check eligibility, allocate a number, insert the
//! invoice, advance `next_run_at`, all inside a single write transaction. A
//! unit that fails rolls back alone and the run moves on. Because the advance
//! commits together with the invoice, running the same tick twice (or on two
//! replicas) cannot produce a second invoice for the same period.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::Connection;
use std::time::{Duration, Instant};

use crate::db::{self, Database};
use crate::error::{BillingError, Result};
use crate::models::{
    validate_pricing, DocumentType, GeneratedInvoice, Invoice, InvoiceStatus, RecurringTemplate,
    RunReport, TemplateFailure, Totals,
};
use crate::services::{schedule, sequence};

pub const DEFAULT_TEMPLATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Templates not started by this instant are left for the next tick.
    pub deadline: Option<Instant>,
    /// A template unit still running after this long is rolled back.
    ///
    /// Elapsed time is checked once, after the unit's statements have run and
    /// before its commit. A slow statement is not interrupted; its unit is only
    /// rolled back once the statement returns.
    pub template_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            deadline: None,
            template_timeout: DEFAULT_TEMPLATE_TIMEOUT,
        }
    }
}

impl RunOptions {
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_template_timeout(mut self, timeout: Duration) -> Self {
        self.template_timeout = timeout;
        self
    }
}

/// Result of one template unit that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateOutcome {
    Generated(GeneratedInvoice),
    /// No longer due when the unit ran; another runner got there first.
    Skipped,
}

/// Drives one scheduler tick over all due templates.
pub struct RecurringGenerator;

impl RecurringGenerator {
    /// Generates invoices for every active template due at `now`.
    ///
    /// Only a failure to list the due templates aborts the run; every per-template
    /// failure is reported in [`RunReport::errors`].
    pub fn run(db: &mut Database, now: DateTime<Utc>, options: &RunOptions) -> Result<RunReport> {
        let started = Instant::now();
        let due = db::due_template_ids(db.conn(), now)
            .map_err(|err| BillingError::GeneratorFatal(Box::new(err)))?;
        tracing::info!(due = due.len(), now = %now, "recurring invoice run started");

        let mut report = RunReport::default();
        for (index, template_id) in due.iter().enumerate() {
            if options.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                report.deferred = due[index..].to_vec();
                tracing::warn!(
                    deferred = report.deferred.len(),
                    "batch deadline reached, leaving remaining templates for the next tick"
                );
                break;
            }

            match process_template(db, template_id, now, options) {
                Ok(TemplateOutcome::Generated(generated)) => {
                    tracing::info!(
                        template_id = %generated.template_id,
                        invoice_id = %generated.invoice_id,
                        number = %generated.number,
                        next_run_at = %generated.next_run_at,
                        "generated recurring invoice"
                    );
                    report.generated.push(generated);
                }
                Ok(TemplateOutcome::Skipped) => {
                    tracing::debug!(template_id = %template_id, "template no longer due, skipped");
                    report.skipped.push(template_id.clone());
                }
                Err(err) => {
                    tracing::warn!(template_id = %template_id, error = %err, "recurring template failed");
                    report.errors.push(failure_entry(template_id, err));
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            generated = report.generated.len(),
            errors = report.errors.len(),
            skipped = report.skipped.len(),
            deferred = report.deferred.len(),
            duration_ms = report.duration_ms,
            "recurring invoice run finished"
        );
        Ok(report)
    }
}

fn failure_entry(template_id: &str, err: BillingError) -> TemplateFailure {
    match err.for_template(template_id) {
        BillingError::TemplateProcessing {
            template_id,
            message,
            retryable,
        } => TemplateFailure {
            template_id,
            message,
            retryable,
        },
        other => TemplateFailure {
            template_id: template_id.to_string(),
            retryable: other.is_retryable(),
            message: other.to_string(),
        },
    }
}

/// Runs one template as its own transaction. Errors are always `TemplateProcessing`.
pub fn process_template(
    db: &mut Database,
    template_id: &str,
    now: DateTime<Utc>,
    options: &RunOptions,
) -> Result<TemplateOutcome> {
    let started = Instant::now();
    let mut company_id: Option<String> = None;

    let outcome = db.write_tx(|tx| {
        let Some(template) = db::load_template(tx, template_id)? else {
            return Ok(TemplateOutcome::Skipped);
        };
        if !template.active || template.next_run_at > now {
            return Ok(TemplateOutcome::Skipped);
        }
        company_id = Some(template.company_id.clone());

        let generated = generate_for(tx, &template, now)?;
        if started.elapsed() >= options.template_timeout {
            return Err(BillingError::TemplateProcessing {
                template_id: template_id.to_string(),
                message: format!(
                    "timed out after {} ms, rolled back",
                    started.elapsed().as_millis()
                ),
                retryable: true,
            });
        }
        Ok(TemplateOutcome::Generated(generated))
    });

    outcome.map_err(|err| {
        let err = match company_id.as_deref() {
            Some(company_id) => err.into_allocation_failure(company_id, DocumentType::Invoice),
            None => err,
        };
        err.for_template(template_id)
    })
}

fn generate_for(
    conn: &Connection,
    template: &RecurringTemplate,
    now: DateTime<Utc>,
) -> Result<GeneratedInvoice> {
    validate_pricing(template.tax, &template.items)?;
    let next_run_at = schedule::next_run_after(&template.interval_policy, template.next_run_at, now)?;

    let settings = db::numbering_settings(conn, &template.company_id)?;
    let number = sequence::allocate(conn, &template.company_id, DocumentType::Invoice, &settings)?;
    let invoice = invoice_from_template(template, number.formatted, now, next_run_at);
    db::insert_invoice(conn, &invoice)?;

    if !db::advance_template(conn, &template.id, template.next_run_at, next_run_at, now)? {
        return Err(BillingError::Conflict {
            entity: "recurring template",
            id: template.id.clone(),
            message: "next run moved concurrently".into(),
        });
    }

    Ok(GeneratedInvoice {
        template_id: template.id.clone(),
        invoice_id: invoice.id,
        number: invoice.number,
        next_run_at,
    })
}

/// A DRAFT invoice issued at `now`; due after the payment terms, or at the next run.
pub fn invoice_from_template(
    template: &RecurringTemplate,
    number: String,
    now: DateTime<Utc>,
    next_run_at: DateTime<Utc>,
) -> Invoice {
    let totals = Totals::compute(&template.items, template.tax);
    let issue_date = now.date_naive();
    let due_date = match template.payment_terms_days {
        Some(days) => issue_date + ChronoDuration::days(days as i64),
        None => next_run_at.date_naive(),
    };

    Invoice {
        id: uuid::Uuid::new_v4().to_string(),
        company_id: template.company_id.clone(),
        client_id: template.client_id.clone(),
        number,
        title: template.title.clone(),
        issue_date,
        due_date: Some(due_date),
        currency: template.currency,
        tax: template.tax,
        subtotal: totals.subtotal,
        tax_amount: totals.tax_amount,
        total: totals.total,
        balance_due: totals.total,
        status: InvoiceStatus::Draft,
        quote_id: None,
        recurring_template_id: Some(template.id.clone()),
        items: template.items.clone(),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Currency, IntervalPolicy, LineItem, NewRecurringTemplate};
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;
    use std::sync::{Arc, Barrier};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()
    }

    fn seed(db: &Database) -> (String, String) {
        let company = db.create_company("Acme", None, None, None).unwrap();
        let client = db.create_client(&company.id, "Globex", None).unwrap();
        (company.id, client.id)
    }

    fn template(
        db: &mut Database,
        company_id: &str,
        client_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> RecurringTemplate {
        db.create_template(
            company_id,
            NewRecurringTemplate {
                client_id: client_id.to_string(),
                title: "Monthly retainer".into(),
                currency: Currency::Eur,
                tax: Decimal::new(10, 0),
                items: vec![LineItem::new("Support", Decimal::new(2, 0), Decimal::new(10, 0))],
                interval_policy: IntervalPolicy::Monthly { day: 16 },
                payment_terms_days: None,
                next_run_at,
            },
        )
        .unwrap()
    }

    fn next_run(db: &Database, id: &str) -> DateTime<Utc> {
        db.get_template(id).unwrap().unwrap().next_run_at
    }

    #[test]
    fn due_template_produces_draft_invoice_and_advances() {
        let mut db = Database::open_in_memory().unwrap();
        let (company_id, client_id) = seed(&db);
        let tpl = template(&mut db, &company_id, &client_id, now());

        let report = RecurringGenerator::run(&mut db, now(), &RunOptions::default()).unwrap();

        assert_eq!(report.generated.len(), 1);
        assert!(report.errors.is_empty());
        let generated = &report.generated[0];
        assert_eq!(generated.number, "INV-00001");

        let invoice = db.get_invoice(&generated.invoice_id).unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Draft);
        assert_eq!(invoice.issue_date, NaiveDate::from_ymd_opt(2026, 10, 16).unwrap());
        assert_eq!(invoice.due_date, NaiveDate::from_ymd_opt(2026, 11, 16));
        assert_eq!(invoice.total, Decimal::new(22, 0));
        assert_eq!(invoice.balance_due, invoice.total);
        assert_eq!(invoice.recurring_template_id.as_deref(), Some(tpl.id.as_str()));

        let advanced = Utc.with_ymd_and_hms(2026, 11, 16, 9, 0, 0).unwrap();
        assert_eq!(next_run(&db, &tpl.id), advanced);
        assert_eq!(db.get_template(&tpl.id).unwrap().unwrap().last_run_at, Some(now()));
    }

    #[test]
    fn payment_terms_set_the_due_date() {
        let mut db = Database::open_in_memory().unwrap();
        let (company_id, client_id) = seed(&db);
        let mut tpl = template(&mut db, &company_id, &client_id, now());
        tpl.payment_terms_days = Some(14);

        let invoice = invoice_from_template(&tpl, "INV-1".into(), now(), now() + ChronoDuration::days(31));
        assert_eq!(invoice.due_date, NaiveDate::from_ymd_opt(2026, 10, 30));
    }

    #[test]
    fn inactive_and_future_templates_are_ignored() {
        let mut db = Database::open_in_memory().unwrap();
        let (company_id, client_id) = seed(&db);
        let paused = template(&mut db, &company_id, &client_id, now() - ChronoDuration::hours(1));
        db.set_template_active(&paused.id, false).unwrap();
        let future = template(&mut db, &company_id, &client_id, now() + ChronoDuration::minutes(1));

        let report = RecurringGenerator::run(&mut db, now(), &RunOptions::default()).unwrap();

        assert!(report.generated.is_empty());
        assert!(report.errors.is_empty());
        assert_eq!(next_run(&db, &future.id), now() + ChronoDuration::minutes(1));
    }

    #[test]
    fn one_failing_template_does_not_block_the_others() {
        let mut db = Database::open_in_memory().unwrap();
        let (company_id, client_id) = seed(&db);
        let first = template(&mut db, &company_id, &client_id, now() - ChronoDuration::hours(3));
        // Client was removed outside this core; the invoice insert hits the foreign key.
        let broken = template(&mut db, &company_id, "deleted-client", now() - ChronoDuration::hours(2));
        let third = template(&mut db, &company_id, &client_id, now() - ChronoDuration::hours(1));

        let report = RecurringGenerator::run(&mut db, now(), &RunOptions::default()).unwrap();

        let generated: Vec<_> = report.generated.iter().map(|g| g.template_id.as_str()).collect();
        assert_eq!(generated, vec![first.id.as_str(), third.id.as_str()]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].template_id, broken.id);
        assert!(!report.errors[0].retryable);

        assert_eq!(next_run(&db, &broken.id), broken.next_run_at);
        assert!(next_run(&db, &first.id) > now());
        assert!(next_run(&db, &third.id) > now());
        assert!(db.invoices_for_template(&broken.id).unwrap().is_empty());

        let numbers: Vec<_> = report.generated.iter().map(|g| g.number.as_str()).collect();
        assert_eq!(numbers, vec!["INV-00001", "INV-00002"]);
    }

    #[test]
    fn invalid_template_data_is_reported_per_template() {
        let mut db = Database::open_in_memory().unwrap();
        let (company_id, client_id) = seed(&db);
        let tpl = template(&mut db, &company_id, &client_id, now());
        db.conn()
            .execute(
                "UPDATE recurring_templates SET tax = '150' WHERE id = ?1",
                rusqlite::params![tpl.id],
            )
            .unwrap();

        let report = RecurringGenerator::run(&mut db, now(), &RunOptions::default()).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains("tax"));
        assert_eq!(next_run(&db, &tpl.id), tpl.next_run_at);
    }

    #[test]
    fn second_run_for_same_tick_generates_nothing() {
        let mut db = Database::open_in_memory().unwrap();
        let (company_id, client_id) = seed(&db);
        template(&mut db, &company_id, &client_id, now());
        // Three months behind: one invoice, not three.
        template(&mut db, &company_id, &client_id, now() - ChronoDuration::days(90));

        let first = RecurringGenerator::run(&mut db, now(), &RunOptions::default()).unwrap();
        let second = RecurringGenerator::run(&mut db, now(), &RunOptions::default()).unwrap();

        assert_eq!(first.generated.len(), 2);
        assert!(second.generated.is_empty());
        assert!(second.errors.is_empty());
        assert_eq!(db.invoices_for_company(&company_id).unwrap().len(), 2);
    }

    #[test]
    fn stale_unit_is_skipped_after_another_runner_advanced_it() {
        let mut db = Database::open_in_memory().unwrap();
        let (company_id, client_id) = seed(&db);
        let tpl = template(&mut db, &company_id, &client_id, now());

        let first = process_template(&mut db, &tpl.id, now(), &RunOptions::default()).unwrap();
        let again = process_template(&mut db, &tpl.id, now(), &RunOptions::default()).unwrap();

        assert!(matches!(first, TemplateOutcome::Generated(_)));
        assert_eq!(again, TemplateOutcome::Skipped);
    }

    #[test]
    fn template_timeout_rolls_back_the_unit() {
        let mut db = Database::open_in_memory().unwrap();
        let (company_id, client_id) = seed(&db);
        let tpl = template(&mut db, &company_id, &client_id, now());

        let options = RunOptions::default().with_template_timeout(Duration::ZERO);
        let report = RecurringGenerator::run(&mut db, now(), &options).unwrap();

        assert!(report.generated.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].retryable);
        assert_eq!(next_run(&db, &tpl.id), tpl.next_run_at);
        assert!(db.invoices_for_company(&company_id).unwrap().is_empty());
    }

    #[test]
    fn expired_batch_deadline_defers_everything() {
        let mut db = Database::open_in_memory().unwrap();
        let (company_id, client_id) = seed(&db);
        let a = template(&mut db, &company_id, &client_id, now() - ChronoDuration::hours(1));
        let b = template(&mut db, &company_id, &client_id, now());

        let options = RunOptions::default().with_batch_timeout(Duration::ZERO);
        let report = RecurringGenerator::run(&mut db, now(), &options).unwrap();

        assert!(report.generated.is_empty());
        assert_eq!(report.deferred, vec![a.id.clone(), b.id.clone()]);
        assert_eq!(next_run(&db, &a.id), a.next_run_at);
    }

    #[test]
    fn unreadable_template_table_is_fatal() {
        let mut db = Database::open_in_memory().unwrap();
        db.conn()
            .execute_batch("DROP TABLE recurring_template_items; DROP TABLE recurring_templates;")
            .unwrap();

        let err = RecurringGenerator::run(&mut db, now(), &RunOptions::default()).unwrap_err();
        assert!(matches!(err, BillingError::GeneratorFatal(_)));
    }

    #[test]
    fn concurrent_runners_generate_each_period_once() {
        const RUNNERS: usize = 4;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recurring.sqlite");
        let company_id = {
            let mut db = Database::new(&path).unwrap();
            let (company_id, client_id) = seed(&db);
            for hours in 1..=6 {
                template(&mut db, &company_id, &client_id, now() - ChronoDuration::hours(hours));
            }
            company_id
        };

        let barrier = Arc::new(Barrier::new(RUNNERS));
        let handles: Vec<_> = (0..RUNNERS)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let mut db = Database::new(&path).unwrap();
                    barrier.wait();
                    RecurringGenerator::run(&mut db, now(), &RunOptions::default()).unwrap()
                })
            })
            .collect();

        let reports: Vec<RunReport> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let generated: usize = reports.iter().map(|r| r.generated.len()).sum();
        let retryable_errors = reports
            .iter()
            .flat_map(|r| r.errors.iter())
            .all(|e| e.retryable);

        let db = Database::new(&path).unwrap();
        let invoices = db.invoices_for_company(&company_id).unwrap();
        assert!(retryable_errors);
        assert_eq!(invoices.len(), generated);
        assert!(generated <= 6);
        let mut per_template: Vec<_> = invoices
            .iter()
            .filter_map(|i| i.recurring_template_id.clone())
            .collect();
        per_template.sort();
        per_template.dedup();
        assert_eq!(per_template.len(), invoices.len());
    }
}
