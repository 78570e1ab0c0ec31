use rusqlite::ErrorCode;
use thiserror::Error;

use crate::models::DocumentType;

pub type Result<T, E = BillingError> = std::result::Result<T, E>;

/// Why a quote could not be turned into an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotConvertibleReason {
    NotFound,
    WrongCompany,
    NotAccepted,
}

impl std::fmt::Display for NotConvertibleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NotConvertibleReason::NotFound => "quote not found",
            NotConvertibleReason::WrongCompany => "quote belongs to another company",
            NotConvertibleReason::NotAccepted => "quote is not accepted",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("could not allocate {document_type} number for company {company_id} after {attempts} attempts")]
    AllocationFailed {
        company_id: String,
        document_type: DocumentType,
        attempts: u32,
    },

    #[error("invalid {kind} transition from {from} to {to}")]
    InvalidTransition {
        from: String,
        to: String,
        kind: DocumentType,
    },

    #[error("quote {quote_id} cannot be converted: {reason}")]
    QuoteNotConvertible {
        quote_id: String,
        reason: NotConvertibleReason,
    },

    #[error("recurring template {template_id} failed: {message}")]
    TemplateProcessing {
        template_id: String,
        message: String,
        retryable: bool,
    },

    #[error("recurring generator could not load due templates: {0}")]
    GeneratorFatal(#[source] Box<BillingError>),

    #[error("store still contended after {attempts} attempts")]
    StoreContended { attempts: u32 },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} is not in a state that allows this: {message}")]
    Conflict {
        entity: &'static str,
        id: String,
        message: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid stored record: {0}")]
    InvalidRecord(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        BillingError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// True when SQLite reported lock contention rather than a real failure.
    pub fn is_busy(&self) -> bool {
        match self {
            BillingError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the same request may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::AllocationFailed { .. } | BillingError::StoreContended { .. } => true,
            BillingError::TemplateProcessing { retryable, .. } => *retryable,
            BillingError::GeneratorFatal(inner) => inner.is_retryable() || inner.is_busy(),
            other => other.is_busy(),
        }
    }

    /// Wraps a failure of one recurring template, keeping whether a later tick may succeed.
    pub fn for_template(self, template_id: &str) -> Self {
        match self {
            err @ BillingError::TemplateProcessing { .. } => err,
            other => BillingError::TemplateProcessing {
                template_id: template_id.to_string(),
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }

    /// Contention on a unit that allocates a number is reported as an allocation failure.
    pub(crate) fn into_allocation_failure(
        self,
        company_id: &str,
        document_type: DocumentType,
    ) -> Self {
        match self {
            BillingError::StoreContended { attempts } => BillingError::AllocationFailed {
                company_id: company_id.to_string(),
                document_type,
                attempts,
            },
            other => other,
        }
    }
}
