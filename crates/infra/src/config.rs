//! Ledger configuration.
//!
//! Loaded hierarchically:
//! 1. Default values in code
//! 2. An optional `config/<environment>.toml` file
//! 3. Environment variable overrides with the `RXLEDGER__` prefix
//!    (e.g. `RXLEDGER__TRANSACTION__TIMEOUT_MS=2000`), after reading `.env`

use std::time::Duration;

use config::{ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use rxledger_observability::LogSettings;
use rxledger_products::CatalogDefaults;

use crate::retry::RetryPolicy;

/// Main ledger configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Current environment (development, production, test).
    pub environment: String,

    pub transaction: TransactionConfig,

    pub retry: RetryConfig,

    pub reporting: ReportingConfig,

    pub catalog: CatalogConfig,

    /// Absent when running on the in-memory store.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransactionConfig {
    /// Upper bound for one unit of work, lock waits included.
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportingConfig {
    /// Window used by `expiring_within` when the caller passes none.
    pub expiry_window_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    pub default_tax_rate: Decimal,
    pub default_low_stock_threshold: i64,
    pub default_markup_percent: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl LedgerConfig {
    /// Load configuration from `.env`, files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let environment =
            std::env::var("RXLEDGER_ENVIRONMENT").unwrap_or_else(|_| "development".into());

        let config = Self::builder(&environment)?
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(
                Environment::with_prefix("RXLEDGER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    fn builder(
        environment: &str,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        config::Config::builder()
            .set_default("environment", environment)?
            .set_default("transaction.timeout_ms", 5_000)?
            .set_default("retry.max_attempts", 3)?
            .set_default("retry.initial_delay_ms", 20)?
            .set_default("retry.max_delay_ms", 500)?
            .set_default("retry.backoff_factor", 2.0)?
            .set_default("reporting.expiry_window_days", 90)?
            .set_default("catalog.default_tax_rate", "0")?
            .set_default("catalog.default_low_stock_threshold", 10)?
            .set_default("catalog.default_markup_percent", "0")?
            .set_default("log.filter", "info")?
            .set_default("log.json", true)
    }

    /// Built-in defaults only; no files or environment.
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::builder("test")?.build()?.try_deserialize()
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_factor: clamp_backoff(self.retry.backoff_factor),
        }
    }

    pub fn catalog_defaults(&self) -> CatalogDefaults {
        CatalogDefaults {
            tax_rate: self.catalog.default_tax_rate,
            low_stock_threshold: self.catalog.default_low_stock_threshold,
            markup_percent: self.catalog.default_markup_percent,
        }
    }
}

/// Backoff never shrinks the delay; NaN and factors below 1 become 1.
fn clamp_backoff(factor: f64) -> f64 {
    if factor.is_finite() && factor >= 1.0 {
        factor
    } else {
        1.0
    }
}
