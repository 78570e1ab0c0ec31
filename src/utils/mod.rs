use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use subtle::ConstantTimeEq;

use crate::error::BillingError;

/// Fixed-width UTC text so that SQL string comparison follows time order.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, BillingError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BillingError::InvalidRecord(format!("timestamp '{value}': {e}")))
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_date(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

pub fn parse_date(value: &str) -> Result<NaiveDate, BillingError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| BillingError::InvalidRecord(format!("date '{value}': {e}")))
}

pub fn parse_decimal(value: &str) -> Result<Decimal, BillingError> {
    Decimal::from_str(value.trim())
        .map_err(|e| BillingError::InvalidRecord(format!("decimal '{value}': {e}")))
}

pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Constant-time comparison of two secrets.
///
/// Both sides are hashed first so the compared slices always have the same
/// length and the secret's length does not leak through an early return.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided.as_slice().ct_eq(expected.as_slice()).into()
}
