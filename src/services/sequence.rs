//! Per-company document numbering.
//!
//! Every number handed out comes from one `INSERT ... ON CONFLICT DO UPDATE ...
//! RETURNING` statement, so the increment and the read of the new value can
//! never be split by another writer. Values never repeat for a key; a rolled
//! back transaction may leave a gap.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::{self, Database};
use crate::error::{BillingError, Result};
use crate::models::{DocumentType, NumberingSettings};
use crate::utils::now_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedNumber {
    pub value: u64,
    pub formatted: String,
}

/// `prefix` followed by `value` zero-padded to `padding` digits; wider values are kept whole.
pub fn format_number(prefix: &str, value: u64, padding: usize) -> String {
    format!("{prefix}{value:0>padding$}")
}

/// Allocates the next number for `(company_id, document_type)` on an open connection.
///
/// Call this inside the same transaction that stores the numbered document.
pub fn allocate(
    conn: &Connection,
    company_id: &str,
    document_type: DocumentType,
    settings: &NumberingSettings,
) -> Result<AllocatedNumber> {
    let prefix = settings.prefix_for(document_type);
    let value: i64 = conn.query_row(
        "INSERT INTO sequence_counters (company_id, document_type, last_value, prefix, padding, updated_at)
         VALUES (?1, ?2, 1, ?3, ?4, ?5)
         ON CONFLICT (company_id, document_type) DO UPDATE SET
             last_value = last_value + 1,
             prefix = excluded.prefix,
             padding = excluded.padding,
             updated_at = excluded.updated_at
         RETURNING last_value",
        params![
            company_id,
            document_type.as_str(),
            prefix,
            settings.padding as i64,
            now_timestamp()
        ],
        |row| row.get(0),
    )?;

    let value = u64::try_from(value)
        .map_err(|_| BillingError::InvalidRecord(format!("negative counter value {value}")))?;
    Ok(AllocatedNumber {
        value,
        formatted: format_number(prefix, value, settings.padding),
    })
}

/// The number the next allocation would return, without consuming it.
pub fn peek_next(
    conn: &Connection,
    company_id: &str,
    document_type: DocumentType,
) -> Result<AllocatedNumber> {
    let settings = db::numbering_settings(conn, company_id)?;
    let value = db::counter_value(conn, company_id, document_type)? + 1;
    let prefix = settings.prefix_for(document_type);
    Ok(AllocatedNumber {
        value,
        formatted: format_number(prefix, value, settings.padding),
    })
}

impl Database {
    /// Standalone allocation in its own write transaction, using the company's settings.
    pub fn allocate_number(
        &mut self,
        company_id: &str,
        document_type: DocumentType,
    ) -> Result<AllocatedNumber> {
        let allocated = self
            .write_tx(|tx| {
                let settings = db::numbering_settings(tx, company_id)?;
                allocate(tx, company_id, document_type, &settings)
            })
            .map_err(|e| e.into_allocation_failure(company_id, document_type))?;
        tracing::debug!(
            company_id,
            document_type = %document_type,
            number = %allocated.formatted,
            "allocated document number"
        );
        Ok(allocated)
    }
}
