use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BillingError;

pub const DEFAULT_INVOICE_PREFIX: &str = "INV-";
pub const DEFAULT_QUOTE_PREFIX: &str = "QUO-";
pub const DEFAULT_NUMBER_PADDING: usize = 5;

/// Implements `as_str`, `Display` and `FromStr` for a string-backed enum.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BillingError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(BillingError::InvalidRecord(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentType {
    Invoice,
    Quote,
}

string_enum!(DocumentType { Invoice => "INVOICE", Quote => "QUOTE" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Eur,
    Usd,
}

string_enum!(Currency { Eur => "EUR", Usd => "USD" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuoteStatus {
    Draft,
    Sent,
    Accepted,
    Rejected,
    Expired,
}

string_enum!(QuoteStatus {
    Draft => "DRAFT",
    Sent => "SENT",
    Accepted => "ACCEPTED",
    Rejected => "REJECTED",
    Expired => "EXPIRED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Cancelled,
}

string_enum!(InvoiceStatus {
    Draft => "DRAFT",
    Sent => "SENT",
    Paid => "PAID",
    Overdue => "OVERDUE",
    Cancelled => "CANCELLED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectedQuoteStatus {
    Pending,
    Approved,
    Dismissed,
}

string_enum!(DetectedQuoteStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Dismissed => "DISMISSED",
});

/// Prefixes and padding used when formatting document numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberingSettings {
    pub invoice_prefix: String,
    pub quote_prefix: String,
    pub padding: usize,
}

impl Default for NumberingSettings {
    fn default() -> Self {
        NumberingSettings {
            invoice_prefix: DEFAULT_INVOICE_PREFIX.to_string(),
            quote_prefix: DEFAULT_QUOTE_PREFIX.to_string(),
            padding: DEFAULT_NUMBER_PADDING,
        }
    }
}

impl NumberingSettings {
    pub fn prefix_for(&self, document_type: DocumentType) -> &str {
        match document_type {
            DocumentType::Invoice => &self.invoice_prefix,
            DocumentType::Quote => &self.quote_prefix,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub invoice_prefix: Option<String>,
    pub quote_prefix: Option<String>,
    pub number_padding: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Company {
    /// Company overrides layered over the system defaults.
    pub fn numbering(&self) -> NumberingSettings {
        let defaults = NumberingSettings::default();
        NumberingSettings {
            invoice_prefix: self
                .invoice_prefix
                .clone()
                .unwrap_or(defaults.invoice_prefix),
            quote_prefix: self.quote_prefix.clone().unwrap_or(defaults.quote_prefix),
            padding: self
                .number_padding
                .map(|p| p as usize)
                .unwrap_or(defaults.padding),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub company_id: String,
    pub name: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub qty: Decimal,
    pub price: Decimal,
}

impl LineItem {
    pub fn new(description: impl Into<String>, qty: Decimal, price: Decimal) -> Self {
        LineItem {
            description: description.into(),
            qty,
            price,
        }
    }

    /// Derived on read, never stored.
    pub fn line_total(&self) -> Decimal {
        self.qty * self.price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

impl Totals {
    pub fn compute(items: &[LineItem], tax: Decimal) -> Self {
        let subtotal = round_money(items.iter().map(LineItem::line_total).sum());
        let tax_amount = round_money(subtotal * tax / Decimal::ONE_HUNDRED);
        Totals {
            subtotal,
            tax_amount,
            total: subtotal + tax_amount,
        }
    }
}

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub id: String,
    pub company_id: String,
    pub client_id: String,
    pub number: String,
    pub title: String,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub currency: Currency,
    pub tax: Decimal,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub status: QuoteStatus,
    pub items: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    pub company_id: String,
    pub client_id: String,
    pub number: String,
    pub title: String,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub currency: Currency,
    pub tax: Decimal,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub balance_due: Decimal,
    pub status: InvoiceStatus,
    pub quote_id: Option<String>,
    pub recurring_template_id: Option<String>,
    pub items: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a quote or an invoice directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDocument {
    pub client_id: String,
    pub title: String,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub currency: Currency,
    pub tax: Decimal,
    pub items: Vec<LineItem>,
}

impl NewDocument {
    pub fn validate(&self) -> Result<(), BillingError> {
        if self.title.trim().is_empty() {
            return Err(BillingError::validation("title must not be empty"));
        }
        validate_pricing(self.tax, &self.items)?;
        if let Some(due) = self.due_date {
            if due < self.issue_date {
                return Err(BillingError::validation("due date precedes issue date"));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_pricing(tax: Decimal, items: &[LineItem]) -> Result<(), BillingError> {
    if tax < Decimal::ZERO || tax > Decimal::ONE_HUNDRED {
        return Err(BillingError::validation(format!(
            "tax must be between 0 and 100, got {tax}"
        )));
    }
    for (position, item) in items.iter().enumerate() {
        if item.qty < Decimal::ZERO {
            return Err(BillingError::validation(format!(
                "item {position}: quantity must not be negative"
            )));
        }
        if item.price < Decimal::ZERO {
            return Err(BillingError::validation(format!(
                "item {position}: price must not be negative"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "every", rename_all = "lowercase")]
pub enum IntervalPolicy {
    /// Weekday number counted from Monday = 1.
    Weekly { weekday: u32 },
    Monthly { day: u32 },
    Quarterly { day: u32 },
    Yearly { month: u32, day: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTemplate {
    pub id: String,
    pub company_id: String,
    pub client_id: String,
    pub title: String,
    pub currency: Currency,
    pub tax: Decimal,
    pub items: Vec<LineItem>,
    pub interval_policy: IntervalPolicy,
    pub payment_terms_days: Option<u32>,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecurringTemplate {
    pub client_id: String,
    pub title: String,
    pub currency: Currency,
    pub tax: Decimal,
    pub items: Vec<LineItem>,
    pub interval_policy: IntervalPolicy,
    pub payment_terms_days: Option<u32>,
    pub next_run_at: DateTime<Utc>,
}

/// Quote data produced by the email extraction pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedQuotePayload {
    pub title: String,
    pub currency: Option<Currency>,
    pub tax: Option<Decimal>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub items: Vec<LineItem>,
    pub source_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedQuote {
    pub id: String,
    pub company_id: String,
    pub client_id: String,
    pub payload: DetectedQuotePayload,
    pub status: DetectedQuoteStatus,
    pub quote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedInvoice {
    pub template_id: String,
    pub invoice_id: String,
    pub number: String,
    pub next_run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateFailure {
    pub template_id: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub generated: Vec<GeneratedInvoice>,
    pub errors: Vec<TemplateFailure>,
    /// Templates another runner advanced first.
    pub skipped: Vec<String>,
    /// Templates left for the next tick because the batch deadline passed.
    pub deferred: Vec<String>,
    pub duration_ms: u64,
}
