//! The ledger facade: every service over one shared store.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::LedgerConfig;
use crate::services::{
    BatchStore, ProductCatalog, PurchaseOrderLedger, ReconciliationReporter, ServiceSettings,
    Shared, StockAllocator,
};
use crate::store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore};

/// Inventory batch ledger and purchase-order lifecycle.
#[derive(Debug)]
pub struct Ledger<S> {
    pub catalog: ProductCatalog<S>,
    pub batches: BatchStore<S>,
    pub allocator: StockAllocator<S>,
    pub purchase_orders: PurchaseOrderLedger<S>,
    pub reporter: ReconciliationReporter<S>,
    store: Arc<S>,
}

impl<S> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            batches: self.batches.clone(),
            allocator: self.allocator.clone(),
            purchase_orders: self.purchase_orders.clone(),
            reporter: self.reporter.clone(),
            store: self.store.clone(),
        }
    }
}

impl<S: LedgerStore> Ledger<S> {
    pub fn new(store: S, settings: ServiceSettings) -> Self {
        Self::from_arc(Arc::new(store), settings)
    }

    pub fn from_arc(store: Arc<S>, settings: ServiceSettings) -> Self {
        let shared = Shared::new(store.clone(), Arc::new(settings));
        Self {
            catalog: ProductCatalog::from_shared(shared.clone()),
            batches: BatchStore::from_shared(shared.clone()),
            allocator: StockAllocator::from_shared(shared.clone()),
            purchase_orders: PurchaseOrderLedger::from_shared(shared.clone()),
            reporter: ReconciliationReporter::from_shared(shared),
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl Ledger<InMemoryLedgerStore> {
    pub fn in_memory(settings: ServiceSettings) -> Self {
        Self::new(InMemoryLedgerStore::new(), settings)
    }
}

impl Ledger<PostgresLedgerStore> {
    /// Connect to the configured database. The schema in
    /// `crates/infra/migrations/` must already be applied.
    ///
    /// Also installs the configured log subscriber unless one is already set.
    pub async fn connect(config: &LedgerConfig) -> anyhow::Result<Self> {
        rxledger_observability::tracing::init(&config.log);
        let database = config
            .database
            .as_ref()
            .context("database settings are required for the Postgres ledger")?;
        let store = PostgresLedgerStore::connect(
            &database.url,
            database.max_connections,
            config.transaction_timeout(),
        )
        .await
        .context("failed to connect to the ledger database")?;
        info!(
            environment = %config.environment,
            max_connections = database.max_connections,
            "ledger connected"
        );
        Ok(Self::new(store, ServiceSettings::from_config(config)))
    }
}
