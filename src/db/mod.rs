use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{
    params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use std::path::Path;
use std::time::Duration;

use crate::error::{BillingError, Result};
use crate::models::{
    Client, Company, DetectedQuote, DetectedQuoteStatus, DocumentType, IntervalPolicy, Invoice,
    InvoiceStatus, LineItem, NewRecurringTemplate, NumberingSettings, Quote, QuoteStatus,
    RecurringTemplate,
};
use crate::utils::{
    format_date, format_timestamp, now_timestamp, parse_date, parse_decimal, parse_timestamp,
};

/// Attempts made by [`Database::write_tx`] before reporting contention.
pub const MAX_WRITE_ATTEMPTS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);
const RETRY_BACKOFF: Duration = Duration::from_millis(20);

const MIGRATIONS: [(&str, &str); 3] = [
    (
        "001_create_companies_and_counters.sql",
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/migrations/001_create_companies_and_counters.sql"
        )),
    ),
    (
        "002_create_quotes_and_invoices.sql",
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/migrations/002_create_quotes_and_invoices.sql"
        )),
    ),
    (
        "003_create_recurring_and_detected.sql",
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/migrations/003_create_recurring_and_detected.sql"
        )),
    ),
];

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let mut db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        for (name, sql) in MIGRATIONS {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
                    params![name, now_timestamp()],
                )?;
                tx.commit()?;
                tracing::debug!(migration = name, "applied migration");
            }
        }

        Ok(())
    }

    /// Read access for queries that need no transaction.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Runs `unit` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The transaction commits when `unit` returns `Ok` and rolls back otherwise.
    /// Lock contention is retried up to [`MAX_WRITE_ATTEMPTS`] times, after which
    /// [`BillingError::StoreContended`] is returned. `unit` may run more than once.
    pub fn write_tx<T, F>(&mut self, mut unit: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_write_tx(&mut unit) {
                Err(err) if err.is_busy() => {
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        tracing::warn!(attempts = attempt, "write transaction gave up on contention");
                        return Err(BillingError::StoreContended { attempts: attempt });
                    }
                    tracing::debug!(attempt, "database busy, retrying write transaction");
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                }
                other => return other,
            }
        }
    }

    fn try_write_tx<T, F>(&mut self, unit: &mut F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = unit(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn create_company(
        &self,
        name: &str,
        invoice_prefix: Option<&str>,
        quote_prefix: Option<&str>,
        number_padding: Option<u32>,
    ) -> Result<Company> {
        let company = Company {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            invoice_prefix: invoice_prefix.map(str::to_string),
            quote_prefix: quote_prefix.map(str::to_string),
            number_padding,
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO companies (id, name, invoice_prefix, quote_prefix, number_padding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                company.id,
                company.name,
                company.invoice_prefix,
                company.quote_prefix,
                company.number_padding,
                format_timestamp(company.created_at)
            ],
        )?;
        Ok(company)
    }

    pub fn get_company(&self, id: &str) -> Result<Option<Company>> {
        load_company(&self.conn, id)
    }

    pub fn create_client(&self, company_id: &str, name: &str, email: Option<&str>) -> Result<Client> {
        let client = Client {
            id: uuid::Uuid::new_v4().to_string(),
            company_id: company_id.to_string(),
            name: name.to_string(),
            email: email.map(str::to_string),
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO clients (id, company_id, name, email, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                client.id,
                client.company_id,
                client.name,
                client.email,
                format_timestamp(client.created_at)
            ],
        )?;
        Ok(client)
    }

    pub fn get_quote(&self, id: &str) -> Result<Option<Quote>> {
        load_quote(&self.conn, id)
    }

    pub fn get_invoice(&self, id: &str) -> Result<Option<Invoice>> {
        load_invoice(&self.conn, id)
    }

    pub fn get_template(&self, id: &str) -> Result<Option<RecurringTemplate>> {
        load_template(&self.conn, id)
    }

    pub fn get_detected_quote(&self, id: &str) -> Result<Option<DetectedQuote>> {
        load_detected_quote(&self.conn, id)
    }

    pub fn invoices_for_company(&self, company_id: &str) -> Result<Vec<Invoice>> {
        let ids = query_ids(
            &self.conn,
            "SELECT id FROM invoices WHERE company_id = ?1 ORDER BY created_at, number",
            company_id,
        )?;
        ids.iter()
            .filter_map(|id| load_invoice(&self.conn, id).transpose())
            .collect()
    }

    pub fn invoices_for_template(&self, template_id: &str) -> Result<Vec<Invoice>> {
        let ids = query_ids(
            &self.conn,
            "SELECT id FROM invoices WHERE recurring_template_id = ?1 ORDER BY created_at, number",
            template_id,
        )?;
        ids.iter()
            .filter_map(|id| load_invoice(&self.conn, id).transpose())
            .collect()
    }

    pub fn create_template(
        &mut self,
        company_id: &str,
        input: NewRecurringTemplate,
    ) -> Result<RecurringTemplate> {
        if input.title.trim().is_empty() {
            return Err(BillingError::validation("title must not be empty"));
        }
        crate::models::validate_pricing(input.tax, &input.items)?;
        crate::services::schedule::validate_policy(&input.interval_policy)?;

        let now = Utc::now();
        let template = RecurringTemplate {
            id: uuid::Uuid::new_v4().to_string(),
            company_id: company_id.to_string(),
            client_id: input.client_id,
            title: input.title,
            currency: input.currency,
            tax: input.tax,
            items: input.items,
            interval_policy: input.interval_policy,
            payment_terms_days: input.payment_terms_days,
            next_run_at: input.next_run_at,
            last_run_at: None,
            active: true,
            created_at: now,
            updated_at: now,
        };
        self.write_tx(|tx| insert_template(tx, &template))?;
        Ok(template)
    }

    pub fn set_template_active(&self, id: &str, active: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE recurring_templates SET active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active, now_timestamp()],
        )?;
        if changed == 0 {
            return Err(BillingError::not_found("recurring template", id));
        }
        Ok(())
    }
}

fn query_ids(conn: &Connection, sql: &str, key: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![key], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

pub(crate) fn load_company(conn: &Connection, id: &str) -> Result<Option<Company>> {
    let row = conn
        .query_row(
            "SELECT id, name, invoice_prefix, quote_prefix, number_padding, created_at
             FROM companies WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<u32>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    row.map(
        |(id, name, invoice_prefix, quote_prefix, number_padding, created_at)| {
            Ok(Company {
                id,
                name,
                invoice_prefix,
                quote_prefix,
                number_padding,
                created_at: parse_timestamp(&created_at)?,
            })
        },
    )
    .transpose()
}

/// Owning company of a client, if the client exists.
pub(crate) fn client_company(conn: &Connection, client_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT company_id FROM clients WHERE id = ?1",
            params![client_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Numbering settings for a company; unset columns use the defaults.
pub(crate) fn numbering_settings(conn: &Connection, company_id: &str) -> Result<NumberingSettings> {
    load_company(conn, company_id)?
        .map(|company| company.numbering())
        .ok_or_else(|| BillingError::not_found("company", company_id))
}

#[derive(Clone, Copy)]
enum ItemTable {
    Quote,
    Invoice,
    Template,
}

impl ItemTable {
    fn insert_sql(self) -> &'static str {
        match self {
            ItemTable::Quote => {
                "INSERT INTO quote_items (id, quote_id, position, description, qty, price)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            }
            ItemTable::Invoice => {
                "INSERT INTO invoice_items (id, invoice_id, position, description, qty, price)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            }
            ItemTable::Template => {
                "INSERT INTO recurring_template_items (id, template_id, position, description, qty, price)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            }
        }
    }

    fn select_sql(self) -> &'static str {
        match self {
            ItemTable::Quote => {
                "SELECT description, qty, price FROM quote_items WHERE quote_id = ?1 ORDER BY position"
            }
            ItemTable::Invoice => {
                "SELECT description, qty, price FROM invoice_items WHERE invoice_id = ?1 ORDER BY position"
            }
            ItemTable::Template => {
                "SELECT description, qty, price FROM recurring_template_items
                 WHERE template_id = ?1 ORDER BY position"
            }
        }
    }
}

fn insert_items(conn: &Connection, table: ItemTable, owner_id: &str, items: &[LineItem]) -> Result<()> {
    let mut stmt = conn.prepare_cached(table.insert_sql())?;
    for (position, item) in items.iter().enumerate() {
        stmt.execute(params![
            uuid::Uuid::new_v4().to_string(),
            owner_id,
            position as i64,
            item.description,
            item.qty.to_string(),
            item.price.to_string()
        ])?;
    }
    Ok(())
}

fn load_items(conn: &Connection, table: ItemTable, owner_id: &str) -> Result<Vec<LineItem>> {
    let mut stmt = conn.prepare_cached(table.select_sql())?;
    let rows = stmt.query_map(params![owner_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut items = Vec::new();
    for row in rows {
        let (description, qty, price) = row?;
        items.push(LineItem {
            description,
            qty: parse_decimal(&qty)?,
            price: parse_decimal(&price)?,
        });
    }
    Ok(items)
}

fn optional_date(value: Option<String>) -> Result<Option<NaiveDate>> {
    value.as_deref().map(parse_date).transpose()
}

fn optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

/// Raw text columns shared by quotes and invoices.
struct DocumentRow {
    id: String,
    company_id: String,
    client_id: String,
    number: String,
    title: String,
    issue_date: String,
    due_date: Option<String>,
    currency: String,
    tax: String,
    subtotal: String,
    tax_amount: String,
    total: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(DocumentRow {
            id: row.get("id")?,
            company_id: row.get("company_id")?,
            client_id: row.get("client_id")?,
            number: row.get("number")?,
            title: row.get("title")?,
            issue_date: row.get("issue_date")?,
            due_date: row.get("due_date")?,
            currency: row.get("currency")?,
            tax: row.get("tax")?,
            subtotal: row.get("subtotal")?,
            tax_amount: row.get("tax_amount")?,
            total: row.get("total")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

pub(crate) fn insert_quote(conn: &Connection, quote: &Quote) -> Result<()> {
    conn.execute(
        "INSERT INTO quotes (
            id, company_id, client_id, number, title, issue_date, due_date, currency,
            tax, subtotal, tax_amount, total, status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            quote.id,
            quote.company_id,
            quote.client_id,
            quote.number,
            quote.title,
            format_date(quote.issue_date),
            quote.due_date.map(format_date),
            quote.currency.as_str(),
            quote.tax.to_string(),
            quote.subtotal.to_string(),
            quote.tax_amount.to_string(),
            quote.total.to_string(),
            quote.status.as_str(),
            format_timestamp(quote.created_at),
            format_timestamp(quote.updated_at)
        ],
    )?;
    insert_items(conn, ItemTable::Quote, &quote.id, &quote.items)
}

pub(crate) fn load_quote(conn: &Connection, id: &str) -> Result<Option<Quote>> {
    let row = conn
        .query_row(
            "SELECT id, company_id, client_id, number, title, issue_date, due_date, currency,
                    tax, subtotal, tax_amount, total, status, created_at, updated_at
             FROM quotes WHERE id = ?1",
            params![id],
            DocumentRow::from_row,
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };
    let items = load_items(conn, ItemTable::Quote, &row.id)?;
    Ok(Some(Quote {
        issue_date: parse_date(&row.issue_date)?,
        due_date: optional_date(row.due_date)?,
        currency: row.currency.parse()?,
        tax: parse_decimal(&row.tax)?,
        subtotal: parse_decimal(&row.subtotal)?,
        tax_amount: parse_decimal(&row.tax_amount)?,
        total: parse_decimal(&row.total)?,
        status: row.status.parse()?,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        id: row.id,
        company_id: row.company_id,
        client_id: row.client_id,
        number: row.number,
        title: row.title,
        items,
    }))
}

/// Moves a quote from `from` to `to`; false when the stored status was no longer `from`.
pub(crate) fn update_quote_status(
    conn: &Connection,
    id: &str,
    from: QuoteStatus,
    to: QuoteStatus,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE quotes SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
        params![id, from.as_str(), to.as_str(), now_timestamp()],
    )?;
    Ok(changed == 1)
}

/// DRAFT or SENT quotes whose due date lies before `today`.
pub(crate) fn quotes_past_due(conn: &Connection, today: NaiveDate) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM quotes
         WHERE status IN ('DRAFT', 'SENT') AND due_date IS NOT NULL AND due_date < ?1
         ORDER BY due_date, id",
    )?;
    let rows = stmt.query_map(params![format_date(today)], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

pub(crate) fn insert_invoice(conn: &Connection, invoice: &Invoice) -> Result<()> {
    conn.execute(
        "INSERT INTO invoices (
            id, company_id, client_id, number, title, issue_date, due_date, currency,
            tax, subtotal, tax_amount, total, balance_due, status, quote_id,
            recurring_template_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            invoice.id,
            invoice.company_id,
            invoice.client_id,
            invoice.number,
            invoice.title,
            format_date(invoice.issue_date),
            invoice.due_date.map(format_date),
            invoice.currency.as_str(),
            invoice.tax.to_string(),
            invoice.subtotal.to_string(),
            invoice.tax_amount.to_string(),
            invoice.total.to_string(),
            invoice.balance_due.to_string(),
            invoice.status.as_str(),
            invoice.quote_id,
            invoice.recurring_template_id,
            format_timestamp(invoice.created_at),
            format_timestamp(invoice.updated_at)
        ],
    )?;
    insert_items(conn, ItemTable::Invoice, &invoice.id, &invoice.items)
}

pub(crate) fn load_invoice(conn: &Connection, id: &str) -> Result<Option<Invoice>> {
    let row = conn
        .query_row(
            "SELECT id, company_id, client_id, number, title, issue_date, due_date, currency,
                    tax, subtotal, tax_amount, total, status, created_at, updated_at,
                    balance_due, quote_id, recurring_template_id
             FROM invoices WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    DocumentRow::from_row(row)?,
                    row.get::<_, String>("balance_due")?,
                    row.get::<_, Option<String>>("quote_id")?,
                    row.get::<_, Option<String>>("recurring_template_id")?,
                ))
            },
        )
        .optional()?;

    let Some((row, balance_due, quote_id, recurring_template_id)) = row else {
        return Ok(None);
    };
    let items = load_items(conn, ItemTable::Invoice, &row.id)?;
    Ok(Some(Invoice {
        issue_date: parse_date(&row.issue_date)?,
        due_date: optional_date(row.due_date)?,
        currency: row.currency.parse()?,
        tax: parse_decimal(&row.tax)?,
        subtotal: parse_decimal(&row.subtotal)?,
        tax_amount: parse_decimal(&row.tax_amount)?,
        total: parse_decimal(&row.total)?,
        balance_due: parse_decimal(&balance_due)?,
        status: row.status.parse()?,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        id: row.id,
        company_id: row.company_id,
        client_id: row.client_id,
        number: row.number,
        title: row.title,
        quote_id,
        recurring_template_id,
        items,
    }))
}

pub(crate) fn update_invoice_status(
    conn: &Connection,
    id: &str,
    from: InvoiceStatus,
    to: InvoiceStatus,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE invoices SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
        params![id, from.as_str(), to.as_str(), now_timestamp()],
    )?;
    Ok(changed == 1)
}

/// SENT invoices whose due date lies before `today`.
pub(crate) fn invoices_past_due(conn: &Connection, today: NaiveDate) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM invoices
         WHERE status = 'SENT' AND due_date IS NOT NULL AND due_date < ?1
         ORDER BY due_date, id",
    )?;
    let rows = stmt.query_map(params![format_date(today)], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

pub(crate) fn insert_template(conn: &Connection, template: &RecurringTemplate) -> Result<()> {
    conn.execute(
        "INSERT INTO recurring_templates (
            id, company_id, client_id, title, currency, tax, interval_policy,
            payment_terms_days, next_run_at, last_run_at, active, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            template.id,
            template.company_id,
            template.client_id,
            template.title,
            template.currency.as_str(),
            template.tax.to_string(),
            serde_json::to_string(&template.interval_policy)?,
            template.payment_terms_days,
            format_timestamp(template.next_run_at),
            template.last_run_at.map(format_timestamp),
            template.active,
            format_timestamp(template.created_at),
            format_timestamp(template.updated_at)
        ],
    )?;
    insert_items(conn, ItemTable::Template, &template.id, &template.items)
}

pub(crate) fn load_template(conn: &Connection, id: &str) -> Result<Option<RecurringTemplate>> {
    let row = conn
        .query_row(
            "SELECT id, company_id, client_id, title, currency, tax, interval_policy,
                    payment_terms_days, next_run_at, last_run_at, active, created_at, updated_at
             FROM recurring_templates WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    (
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ),
                    (
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<u32>>(7)?,
                    ),
                    (
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, bool>(10)?,
                        row.get::<_, String>(11)?,
                        row.get::<_, String>(12)?,
                    ),
                ))
            },
        )
        .optional()?;

    let Some((
        (id, company_id, client_id, title),
        (currency, tax, interval_policy, payment_terms_days),
        (next_run_at, last_run_at, active, created_at, updated_at),
    )) = row
    else {
        return Ok(None);
    };

    let interval_policy: IntervalPolicy = serde_json::from_str(&interval_policy)
        .map_err(|e| BillingError::InvalidRecord(format!("interval policy of {id}: {e}")))?;
    let items = load_items(conn, ItemTable::Template, &id)?;
    Ok(Some(RecurringTemplate {
        currency: currency.parse()?,
        tax: parse_decimal(&tax)?,
        interval_policy,
        payment_terms_days,
        next_run_at: parse_timestamp(&next_run_at)?,
        last_run_at: optional_timestamp(last_run_at)?,
        active,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        id,
        company_id,
        client_id,
        title,
        items,
    }))
}

/// Active templates whose `next_run_at` is at or before `now`, oldest first.
pub(crate) fn due_template_ids(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM recurring_templates
         WHERE active = 1 AND next_run_at <= ?1
         ORDER BY next_run_at, id",
    )?;
    let rows = stmt.query_map(params![format_timestamp(now)], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

/// Moves `next_run_at` forward only if nobody else already did.
pub(crate) fn advance_template(
    conn: &Connection,
    id: &str,
    expected_next_run_at: DateTime<Utc>,
    next_run_at: DateTime<Utc>,
    ran_at: DateTime<Utc>,
) -> Result<bool> {
    if next_run_at <= expected_next_run_at {
        return Err(BillingError::InvalidRecord(format!(
            "next run of template {id} must move forward"
        )));
    }
    let changed = conn.execute(
        "UPDATE recurring_templates
         SET next_run_at = ?3, last_run_at = ?4, updated_at = ?4
         WHERE id = ?1 AND next_run_at = ?2 AND active = 1",
        params![
            id,
            format_timestamp(expected_next_run_at),
            format_timestamp(next_run_at),
            format_timestamp(ran_at)
        ],
    )?;
    Ok(changed == 1)
}

pub(crate) fn insert_detected_quote(conn: &Connection, detected: &DetectedQuote) -> Result<()> {
    conn.execute(
        "INSERT INTO detected_quotes (id, company_id, client_id, payload, status, quote_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            detected.id,
            detected.company_id,
            detected.client_id,
            serde_json::to_string(&detected.payload)?,
            detected.status.as_str(),
            detected.quote_id,
            format_timestamp(detected.created_at),
            format_timestamp(detected.updated_at)
        ],
    )?;
    Ok(())
}

pub(crate) fn load_detected_quote(conn: &Connection, id: &str) -> Result<Option<DetectedQuote>> {
    let row = conn
        .query_row(
            "SELECT id, company_id, client_id, payload, status, quote_id, created_at, updated_at
             FROM detected_quotes WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?;

    row.map(
        |(id, company_id, client_id, payload, status, quote_id, created_at, updated_at)| {
            Ok(DetectedQuote {
                payload: serde_json::from_str(&payload)?,
                status: status.parse()?,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
                id,
                company_id,
                client_id,
                quote_id,
            })
        },
    )
    .transpose()
}

pub(crate) fn update_detected_status(
    conn: &Connection,
    id: &str,
    from: DetectedQuoteStatus,
    to: DetectedQuoteStatus,
    quote_id: Option<&str>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE detected_quotes SET status = ?3, quote_id = COALESCE(?4, quote_id), updated_at = ?5
         WHERE id = ?1 AND status = ?2",
        params![id, from.as_str(), to.as_str(), quote_id, now_timestamp()],
    )?;
    Ok(changed == 1)
}

/// Current counter value without consuming one; zero for a key never allocated.
pub(crate) fn counter_value(
    conn: &Connection,
    company_id: &str,
    document_type: DocumentType,
) -> Result<u64> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT last_value FROM sequence_counters WHERE company_id = ?1 AND document_type = ?2",
            params![company_id, document_type.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.unwrap_or(0) as u64)
}
