//! Service configuration

use anyhow::{anyhow, bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::sha256_hex;

const DEFAULT_DATABASE_PATH: &str = "ledgerline.sqlite";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 300;
const DEFAULT_TEMPLATE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file shared by every replica
    pub database_path: PathBuf,
    pub bind_addr: SocketAddr,
    /// Bearer secret expected by the scheduler endpoint
    pub cron_secret: String,
    /// development | staging | production
    pub environment: String,
    /// Upper bound for one recurring run
    pub batch_timeout: Duration,
    /// Upper bound for one template inside a run
    pub template_timeout: Duration,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "development".into());

        let cron_secret = match lookup("CRON_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None if environment == "development" => "dev-CRON_SECRET-not-for-production".into(),
            None => bail!("CRON_SECRET must be set in {environment} environment"),
        };

        let bind_addr = lookup("LEDGERLINE_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.into());
        let bind_addr = bind_addr
            .parse()
            .with_context(|| format!("LEDGERLINE_BIND_ADDR '{bind_addr}' is not a socket address"))?;

        Ok(Config {
            database_path: lookup("LEDGERLINE_DATABASE_PATH")
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.into())
                .into(),
            bind_addr,
            cron_secret,
            environment,
            batch_timeout: Duration::from_secs(number(
                &lookup,
                "LEDGERLINE_BATCH_TIMEOUT_SECS",
                DEFAULT_BATCH_TIMEOUT_SECS,
            )?),
            template_timeout: Duration::from_millis(number(
                &lookup,
                "LEDGERLINE_TEMPLATE_TIMEOUT_MS",
                DEFAULT_TEMPLATE_TIMEOUT_MS,
            )?),
        })
    }

    /// Short digest of the cron secret, safe to log.
    pub fn cron_secret_fingerprint(&self) -> String {
        sha256_hex(&self.cron_secret)[..12].to_string()
    }
}

fn number(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<u64> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("{name} must be a whole number, got '{raw}'")),
        None => Ok(default),
    }
}
