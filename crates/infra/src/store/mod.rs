//! Transactional persistence boundary for the ledger.
//!
//! Every quantity change and every purchase-order transition runs inside one
//! [`LedgerTx`]: read current state under lock, compute the next state with
//! the pure domain crates, write state and audit rows, commit. A transaction
//! that is dropped or rolled back leaves nothing behind.
//!
//! Non-locking reads on [`LedgerStore`] see the latest committed state and are
//! used by reporting, which tolerates slight staleness.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use rxledger_core::{
    BatchId, DomainError, ExpectedVersion, ProductId, PurchaseOrderId, TenantId,
};
use rxledger_events::RecordedEvent;
use rxledger_inventory::{InventoryBatch, StockMovement};
use rxledger_products::Product;
use rxledger_purchasing::PurchaseOrder;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

/// Stream type recorded on purchase-order history rows.
pub const ORDER_STREAM_TYPE: &str = "purchasing.order";

/// Store operation error.
///
/// These are infrastructure failures, as opposed to domain errors. They are
/// folded into `DomainError` at the service boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Serialization failure, deadlock or stale version; the transaction may be retried.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// A uniqueness rule was violated.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// A stored row or payload could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<StoreError> for DomainError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => DomainError::TransactionConflict(msg),
            StoreError::Duplicate(msg) => DomainError::Conflict(msg),
            StoreError::TenantIsolation(msg) => DomainError::TenantIsolation(msg),
            StoreError::Corrupt(msg) | StoreError::Database(msg) => DomainError::Storage(msg),
        }
    }
}

/// Every batch and movement of a tenant, read at one consistent point.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub batches: Vec<InventoryBatch>,
    /// In sequence order.
    pub movements: Vec<StockMovement>,
}

/// Ledger persistence, scoped per tenant.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a write transaction for one tenant.
    ///
    /// Implementations lock what the transaction touches until commit or
    /// rollback; concurrent writers of the same rows wait.
    async fn begin(&self, tenant_id: TenantId) -> Result<Box<dyn LedgerTx>, StoreError>;

    async fn get_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
    ) -> Result<Option<Product>, StoreError>;

    async fn list_products(&self, tenant_id: TenantId) -> Result<Vec<Product>, StoreError>;

    /// Batches of one product, or of all products when `product_id` is `None`.
    async fn list_batches(
        &self,
        tenant_id: TenantId,
        product_id: Option<ProductId>,
    ) -> Result<Vec<InventoryBatch>, StoreError>;

    /// The tenant's movement log in sequence order.
    async fn list_movements(&self, tenant_id: TenantId) -> Result<Vec<StockMovement>, StoreError>;

    async fn get_order(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError>;

    /// Order events in sequence order.
    async fn order_history(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<Vec<RecordedEvent>, StoreError>;
}

/// One open unit of work.
#[async_trait]
pub trait LedgerTx: Send {
    fn tenant_id(&self) -> TenantId;

    async fn product(&mut self, product_id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Case-insensitive exact name match.
    async fn product_by_name(&mut self, name: &str) -> Result<Option<Product>, StoreError>;

    async fn insert_product(&mut self, product: &Product) -> Result<(), StoreError>;

    async fn update_product(&mut self, product: &Product) -> Result<(), StoreError>;

    /// Lock and return every batch of a product, active or not.
    async fn lock_batches(&mut self, product_id: ProductId)
    -> Result<Vec<InventoryBatch>, StoreError>;

    async fn lock_batch(&mut self, batch_id: BatchId) -> Result<Option<InventoryBatch>, StoreError>;

    async fn lock_batch_by_number(
        &mut self,
        product_id: ProductId,
        batch_number: &str,
    ) -> Result<Option<InventoryBatch>, StoreError>;

    /// Fails with `Duplicate` if the product already has a batch with that number,
    /// or `Conflict` if a concurrent transaction inserted it after the lookup.
    async fn insert_batch(&mut self, batch: &InventoryBatch) -> Result<(), StoreError>;

    async fn update_batch(&mut self, batch: &InventoryBatch) -> Result<(), StoreError>;

    /// Append a movement, assigning the next tenant sequence number.
    async fn append_movement(&mut self, movement: StockMovement)
    -> Result<StockMovement, StoreError>;

    /// Read all batches and movements with movement appends held off until
    /// the transaction ends.
    async fn ledger_snapshot(&mut self) -> Result<LedgerSnapshot, StoreError>;

    async fn lock_order(
        &mut self,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError>;

    /// Write the order state and append its new events.
    ///
    /// `expected` is checked against the stored version; a mismatch is a
    /// `Conflict`.
    async fn save_order(
        &mut self,
        order: &PurchaseOrder,
        events: Vec<RecordedEvent>,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Reject rows that belong to another tenant.
pub(crate) fn ensure_tenant(
    expected: TenantId,
    actual: TenantId,
    what: &str,
) -> Result<(), StoreError> {
    if expected != actual {
        return Err(StoreError::TenantIsolation(format!(
            "{what} belongs to another tenant"
        )));
    }
    Ok(())
}
