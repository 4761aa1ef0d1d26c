//! Infrastructure layer: persistence, configuration and the transactional
//! ledger services.
//!
//! Domain rules live in the pure crates (`rxledger-inventory`,
//! `rxledger-purchasing`, `rxledger-products`). This crate runs them inside
//! store transactions with timeouts, retries and tracing.

pub mod config;
pub mod ledger;
pub mod retry;
pub mod services;
pub mod store;

pub use config::LedgerConfig;
pub use ledger::Ledger;
pub use retry::{RetryPolicy, with_retry};
pub use services::ServiceSettings;
pub use store::{
    InMemoryLedgerStore, LedgerSnapshot, LedgerStore, LedgerTx, PostgresLedgerStore, StoreError,
};
