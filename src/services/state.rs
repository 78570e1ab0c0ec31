use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::Config;
use crate::db::Database;
use crate::error::{BillingError, Result};
use crate::services::recurring::RunOptions;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Self {
        AppState {
            db: Arc::new(Mutex::new(db)),
            config: Arc::new(config),
        }
    }

    /// Runs blocking database work off the async executor.
    pub async fn with_db<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|_| BillingError::Internal("database lock poisoned".into()))?;
            work(&mut guard)
        })
        .await
        .map_err(|e| BillingError::Internal(format!("database task failed: {e}")))?
    }

    /// Generator options for a run starting now.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            deadline: Some(Instant::now() + self.config.batch_timeout),
            template_timeout: self.config.template_timeout,
        }
    }
}
