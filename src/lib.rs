//! Billing core: document numbering, quote and invoice lifecycles, quote
//! conversion and recurring invoice generation on top of SQLite.

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use db::Database;
pub use error::{BillingError, NotConvertibleReason, Result};
pub use services::recurring::{RecurringGenerator, RunOptions};
pub use services::state::AppState;
