//! Transactional ledger services.
//!
//! Each public operation follows the same shape:
//!
//! ```text
//! retry (TransactionConflict only)
//!   └─ timeout (configured per unit of work)
//!        └─ begin tx → *_in_tx(tx, ctx, request) → commit | rollback
//! ```
//!
//! The `*_in_tx` functions hold the actual logic. They take an open
//! [`LedgerTx`] so that one unit of work can span several components: a
//! purchase-order receipt credits batches through the same transaction that
//! saves the order.

pub mod allocator;
pub mod batch_store;
pub mod catalog;
pub mod purchase_orders;
pub mod reporter;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use rxledger_core::{DomainError, DomainResult, TenantId};
use rxledger_products::CatalogDefaults;

use crate::config::LedgerConfig;
use crate::retry::RetryPolicy;
use crate::store::{LedgerStore, LedgerTx};

pub use allocator::{Checkout, CheckoutLine, CheckoutRequest, Settlement, StockAllocator};
pub use batch_store::{BatchStore, CreditRequest, LegacyStock};
pub use catalog::ProductCatalog;
pub use purchase_orders::{OrderRequest, PurchaseOrderLedger, Receipt};
pub use reporter::{
    ExpiringBatch, LowStockEntry, ProductValuation, ReconciliationReporter, ReplayDiscrepancy,
    ReplayReport, Valuation,
};

/// Runtime knobs shared by every service.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub transaction_timeout: Duration,
    pub retry: RetryPolicy,
    pub catalog_defaults: CatalogDefaults,
    pub expiry_window_days: i64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            catalog_defaults: CatalogDefaults::default(),
            expiry_window_days: 90,
        }
    }
}

impl ServiceSettings {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            transaction_timeout: config.transaction_timeout(),
            retry: config.retry_policy(),
            catalog_defaults: config.catalog_defaults(),
            expiry_window_days: config.reporting.expiry_window_days,
        }
    }
}

/// Store handle plus settings, cloned into each service.
#[derive(Debug)]
pub(crate) struct Shared<S> {
    pub(crate) store: Arc<S>,
    pub(crate) settings: Arc<ServiceSettings>,
}

impl<S> Clone for Shared<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S: LedgerStore> Shared<S> {
    pub(crate) fn new(store: Arc<S>, settings: Arc<ServiceSettings>) -> Self {
        Self { store, settings }
    }

    pub(crate) async fn begin(&self, tenant_id: TenantId) -> DomainResult<Box<dyn LedgerTx>> {
        Ok(self.store.begin(tenant_id).await?)
    }

    /// Bound a unit of work by the transaction timeout.
    ///
    /// On expiry the future is dropped, which drops its open transaction and
    /// discards every staged write.
    pub(crate) async fn timed<T>(
        &self,
        operation: &'static str,
        work: impl Future<Output = DomainResult<T>>,
    ) -> DomainResult<T> {
        let limit = self.settings.transaction_timeout;
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = limit.as_millis() as u64, "transaction timed out");
                Err(DomainError::Timeout {
                    operation,
                    after_ms: limit.as_millis() as u64,
                })
            }
        }
    }
}

/// Commit on success, roll back on failure.
pub(crate) async fn finish<T>(tx: Box<dyn LedgerTx>, result: DomainResult<T>) -> DomainResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
