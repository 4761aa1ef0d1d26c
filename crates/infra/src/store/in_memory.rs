use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use rxledger_core::{
    AggregateRoot, BatchId, Entity, ExpectedVersion, ProductId, PurchaseOrderId, TenantId,
};
use rxledger_events::RecordedEvent;
use rxledger_inventory::{InventoryBatch, StockMovement};
use rxledger_products::Product;
use rxledger_purchasing::PurchaseOrder;

use super::{LedgerSnapshot, LedgerStore, LedgerTx, StoreError, ensure_tenant};

#[derive(Debug, Clone, Default)]
struct TenantState {
    products: BTreeMap<ProductId, Product>,
    batches: BTreeMap<BatchId, InventoryBatch>,
    orders: BTreeMap<PurchaseOrderId, PurchaseOrder>,
    order_events: BTreeMap<PurchaseOrderId, Vec<RecordedEvent>>,
    movements: Vec<StockMovement>,
    last_sequence: u64,
}

#[derive(Debug, Default)]
struct TenantSlot {
    /// Held by the open write transaction, if any.
    writer: Arc<Mutex<()>>,
    committed: RwLock<TenantState>,
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Not optimized for performance: each transaction
/// works on a copy of the tenant's state and swaps it in on commit. Writers of
/// one tenant are serialized by a per-tenant async mutex held for the life of
/// the transaction.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tenants: RwLock<HashMap<TenantId, Arc<TenantSlot>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, tenant_id: TenantId) -> Result<Arc<TenantSlot>, StoreError> {
        if let Some(slot) = self.tenants.read().map_err(|_| poisoned())?.get(&tenant_id) {
            return Ok(slot.clone());
        }
        let mut tenants = self.tenants.write().map_err(|_| poisoned())?;
        Ok(tenants.entry(tenant_id).or_default().clone())
    }

    fn read<T>(
        &self,
        tenant_id: TenantId,
        f: impl FnOnce(&TenantState) -> T,
    ) -> Result<T, StoreError> {
        let slot = self.slot(tenant_id)?;
        let state = slot.committed.read().map_err(|_| poisoned())?;
        Ok(f(&state))
    }
}

fn poisoned() -> StoreError {
    StoreError::Database("lock poisoned".to_string())
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self, tenant_id: TenantId) -> Result<Box<dyn LedgerTx>, StoreError> {
        let slot = self.slot(tenant_id)?;
        let guard = slot.writer.clone().lock_owned().await;
        let working = slot.committed.read().map_err(|_| poisoned())?.clone();
        Ok(Box::new(InMemoryTx {
            tenant_id,
            slot,
            working,
            _guard: guard,
        }))
    }

    async fn get_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
    ) -> Result<Option<Product>, StoreError> {
        self.read(tenant_id, |s| s.products.get(&product_id).cloned())
    }

    async fn list_products(&self, tenant_id: TenantId) -> Result<Vec<Product>, StoreError> {
        self.read(tenant_id, |s| s.products.values().cloned().collect())
    }

    async fn list_batches(
        &self,
        tenant_id: TenantId,
        product_id: Option<ProductId>,
    ) -> Result<Vec<InventoryBatch>, StoreError> {
        self.read(tenant_id, |s| {
            s.batches
                .values()
                .filter(|b| product_id.is_none_or(|p| b.product_id() == p))
                .cloned()
                .collect()
        })
    }

    async fn list_movements(&self, tenant_id: TenantId) -> Result<Vec<StockMovement>, StoreError> {
        self.read(tenant_id, |s| s.movements.clone())
    }

    async fn get_order(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        self.read(tenant_id, |s| s.orders.get(&order_id).cloned())
    }

    async fn order_history(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        self.read(tenant_id, |s| {
            s.order_events.get(&order_id).cloned().unwrap_or_default()
        })
    }
}

struct InMemoryTx {
    tenant_id: TenantId,
    slot: Arc<TenantSlot>,
    working: TenantState,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    async fn product(&mut self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.working.products.get(&product_id).cloned())
    }

    async fn product_by_name(&mut self, name: &str) -> Result<Option<Product>, StoreError> {
        let needle = name.trim().to_lowercase();
        Ok(self
            .working
            .products
            .values()
            .find(|p| p.name.to_lowercase() == needle)
            .cloned())
    }

    async fn insert_product(&mut self, product: &Product) -> Result<(), StoreError> {
        ensure_tenant(self.tenant_id, product.tenant_id, "product")?;
        if self.working.products.contains_key(&product.id) {
            return Err(StoreError::Duplicate(format!("product {} exists", product.id)));
        }
        self.working.products.insert(product.id, product.clone());
        Ok(())
    }

    async fn update_product(&mut self, product: &Product) -> Result<(), StoreError> {
        ensure_tenant(self.tenant_id, product.tenant_id, "product")?;
        match self.working.products.get_mut(&product.id) {
            Some(existing) => {
                *existing = product.clone();
                Ok(())
            }
            None => Err(StoreError::Database(format!("product {} missing", product.id))),
        }
    }

    async fn lock_batches(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<InventoryBatch>, StoreError> {
        Ok(self
            .working
            .batches
            .values()
            .filter(|b| b.product_id() == product_id)
            .cloned()
            .collect())
    }

    async fn lock_batch(&mut self, batch_id: BatchId) -> Result<Option<InventoryBatch>, StoreError> {
        Ok(self.working.batches.get(&batch_id).cloned())
    }

    async fn lock_batch_by_number(
        &mut self,
        product_id: ProductId,
        batch_number: &str,
    ) -> Result<Option<InventoryBatch>, StoreError> {
        Ok(self
            .working
            .batches
            .values()
            .find(|b| b.product_id() == product_id && b.batch_number() == batch_number)
            .cloned())
    }

    async fn insert_batch(&mut self, batch: &InventoryBatch) -> Result<(), StoreError> {
        ensure_tenant(self.tenant_id, batch.tenant_id(), "batch")?;
        let duplicate = self.working.batches.values().any(|b| {
            b.product_id() == batch.product_id() && b.batch_number() == batch.batch_number()
        });
        if duplicate || self.working.batches.contains_key(&batch.id_typed()) {
            return Err(StoreError::Duplicate(format!(
                "batch number '{}' already exists for product {}",
                batch.batch_number(),
                batch.product_id()
            )));
        }
        self.working.batches.insert(batch.id_typed(), batch.clone());
        Ok(())
    }

    async fn update_batch(&mut self, batch: &InventoryBatch) -> Result<(), StoreError> {
        ensure_tenant(self.tenant_id, batch.tenant_id(), "batch")?;
        match self.working.batches.get_mut(&batch.id_typed()) {
            Some(existing) => {
                *existing = batch.clone();
                Ok(())
            }
            None => Err(StoreError::Database(format!(
                "batch {} missing",
                batch.id_typed()
            ))),
        }
    }

    async fn append_movement(
        &mut self,
        mut movement: StockMovement,
    ) -> Result<StockMovement, StoreError> {
        ensure_tenant(self.tenant_id, movement.tenant_id, "movement")?;
        self.working.last_sequence += 1;
        movement.sequence = self.working.last_sequence;
        self.working.movements.push(movement.clone());
        Ok(movement)
    }

    async fn ledger_snapshot(&mut self) -> Result<LedgerSnapshot, StoreError> {
        // The tenant's writer lock is already held.
        Ok(LedgerSnapshot {
            batches: self.working.batches.values().cloned().collect(),
            movements: self.working.movements.clone(),
        })
    }

    async fn lock_order(
        &mut self,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        Ok(self.working.orders.get(&order_id).cloned())
    }

    async fn save_order(
        &mut self,
        order: &PurchaseOrder,
        events: Vec<RecordedEvent>,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        if let Some(tenant_id) = order.tenant_id() {
            ensure_tenant(self.tenant_id, tenant_id, "purchase order")?;
        }
        for e in &events {
            ensure_tenant(self.tenant_id, e.tenant_id, "order event")?;
        }

        let order_id = order.id_typed();
        let current = self.working.orders.get(&order_id).map(|o| o.version());
        if !expected.matches(current) {
            return Err(StoreError::Conflict(format!(
                "purchase order {order_id}: expected {expected:?}, found {current:?}"
            )));
        }

        self.working.orders.insert(order_id, order.clone());
        self.working
            .order_events
            .entry(order_id)
            .or_default()
            .extend(events);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTx {
            slot,
            working,
            _guard,
            ..
        } = *self;
        *slot.committed.write().map_err(|_| poisoned())? = working;
        // `_guard` is released here, after the new state is visible.
        drop(_guard);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use rxledger_core::OperationContext;
    use rxledger_core::UserId;
    use rxledger_inventory::{BatchSpec, MovementReason};

    fn batch(tenant_id: TenantId, product_id: ProductId, number: &str) -> InventoryBatch {
        let now = Utc::now();
        InventoryBatch::open(
            BatchId::new(),
            tenant_id,
            BatchSpec {
                product_id,
                batch_number: number.into(),
                expiry_date: now.date_naive() + Duration::days(30),
                cost_price: Decimal::ONE,
                selling_price: Decimal::TWO,
                supplier_id: None,
            },
            5,
            now.date_naive(),
            now,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_and_dropped() {
        let store = InMemoryLedgerStore::new();
        let tenant_id = TenantId::new();
        let product_id = ProductId::new();

        let mut tx = store.begin(tenant_id).await.unwrap();
        tx.insert_batch(&batch(tenant_id, product_id, "A")).await.unwrap();
        assert!(store.list_batches(tenant_id, None).await.unwrap().is_empty());
        drop(tx);

        assert!(store.list_batches(tenant_id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_publishes_and_assigns_sequences() {
        let store = InMemoryLedgerStore::new();
        let tenant_id = TenantId::new();
        let product_id = ProductId::new();
        let ctx = OperationContext::now(tenant_id, UserId::new());
        let b = batch(tenant_id, product_id, "A");

        let mut tx = store.begin(tenant_id).await.unwrap();
        tx.insert_batch(&b).await.unwrap();
        let m = StockMovement::new(&ctx, product_id, b.id_typed(), 5, MovementReason::PurchaseReceive, None)
            .unwrap();
        let first = tx.append_movement(m.clone()).await.unwrap();
        let second = tx.append_movement(m).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert_eq!(store.list_batches(tenant_id, Some(product_id)).await.unwrap().len(), 1);
        assert_eq!(store.list_movements(tenant_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_batch_number_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let tenant_id = TenantId::new();
        let product_id = ProductId::new();

        let mut tx = store.begin(tenant_id).await.unwrap();
        tx.insert_batch(&batch(tenant_id, product_id, "A")).await.unwrap();
        let err = tx.insert_batch(&batch(tenant_id, product_id, "A")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        // Same number under another product is fine.
        tx.insert_batch(&batch(tenant_id, ProductId::new(), "A")).await.unwrap();
    }

    #[tokio::test]
    async fn tenants_do_not_see_each_other() {
        let store = InMemoryLedgerStore::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();

        let mut tx = store.begin(tenant_a).await.unwrap();
        let err = tx
            .insert_batch(&batch(tenant_b, ProductId::new(), "A"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TenantIsolation(_)));
        tx.insert_batch(&batch(tenant_a, ProductId::new(), "A")).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.list_batches(tenant_b, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writers_of_different_tenants_do_not_block() {
        let store = InMemoryLedgerStore::new();
        let _held = store.begin(TenantId::new()).await.unwrap();
        let other = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            store.begin(TenantId::new()),
        )
        .await;
        assert!(other.is_ok());
    }
}
