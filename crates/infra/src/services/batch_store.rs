//! Batch store service: the only path by which batch quantities change.
//!
//! Every quantity change appends exactly one `StockMovement` per batch touched,
//! in the same transaction as the batch write.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use rxledger_core::{
    BatchId, DomainError, DomainResult, Entity, OperationContext, ProductId, SaleId, SupplierId,
};
use rxledger_inventory::{
    BatchSpec, InventoryBatch, MovementReason, MovementReference, StockMovement, apply_debits,
};

use crate::retry::with_retry;
use crate::store::{LedgerStore, LedgerTx};

use super::catalog::require_product;
use super::{ServiceSettings, Shared, finish};

/// A receipt of stock into a batch, identified by product and batch number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRequest {
    pub product_id: ProductId,
    pub batch_number: String,
    pub quantity: i64,
    pub cost_price: Decimal,
    pub selling_price: Decimal,
    pub expiry_date: NaiveDate,
    #[serde(default)]
    pub supplier_id: Option<SupplierId>,
}

/// A flat stock figure carried over from before batches were tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyStock {
    pub product_id: ProductId,
    pub quantity: i64,
    pub cost_price: Decimal,
    pub selling_price: Decimal,
    pub expiry_date: NaiveDate,
}

/// Batch number given to a product's imported legacy stock.
pub fn legacy_batch_number(product_id: ProductId) -> String {
    format!("LEGACY-{product_id}")
}

#[derive(Debug)]
pub struct BatchStore<S> {
    shared: Shared<S>,
}

impl<S> Clone for BatchStore<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: LedgerStore> BatchStore<S> {
    pub fn new(store: Arc<S>, settings: Arc<ServiceSettings>) -> Self {
        Self {
            shared: Shared::new(store, settings),
        }
    }

    pub(crate) fn from_shared(shared: Shared<S>) -> Self {
        Self { shared }
    }

    /// Receive stock into the batch `batch_number`, opening it if the product
    /// has no batch of that number yet. An existing batch keeps its own cost
    /// and selling price.
    #[instrument(
        skip(self, ctx, request),
        fields(tenant_id = %ctx.tenant_id, product_id = %request.product_id, quantity = request.quantity),
        err
    )]
    pub async fn credit(
        &self,
        ctx: &OperationContext,
        request: CreditRequest,
    ) -> DomainResult<BatchId> {
        with_retry(&self.shared.settings.retry, "batch_store.credit", || {
            self.try_credit(ctx, &request)
        })
        .await
    }

    async fn try_credit(
        &self,
        ctx: &OperationContext,
        request: &CreditRequest,
    ) -> DomainResult<BatchId> {
        self.shared
            .timed("batch_store.credit", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = credit_in_tx(
                    tx.as_mut(),
                    ctx,
                    request,
                    MovementReason::PurchaseReceive,
                    None,
                )
                .await
                .map(|m| m.batch_id);
                finish(tx, result).await
            })
            .await
    }

    /// Take stock out of the named batches, all or nothing.
    ///
    /// Allocations naming the same batch are summed before the stock check.
    #[instrument(skip(self, ctx, allocations), fields(tenant_id = %ctx.tenant_id, lines = allocations.len()), err)]
    pub async fn debit(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        allocations: &[(BatchId, i64)],
    ) -> DomainResult<Vec<StockMovement>> {
        with_retry(&self.shared.settings.retry, "batch_store.debit", || {
            self.try_debit(ctx, product_id, allocations)
        })
        .await
    }

    async fn try_debit(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        allocations: &[(BatchId, i64)],
    ) -> DomainResult<Vec<StockMovement>> {
        self.shared
            .timed("batch_store.debit", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = debit_in_tx(
                    tx.as_mut(),
                    ctx,
                    product_id,
                    allocations,
                    MovementReason::Sale,
                    None,
                )
                .await;
                finish(tx, result).await
            })
            .await
    }

    /// Units on hand across the product's active batches, as last committed.
    pub async fn quantity_on_hand(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
    ) -> DomainResult<i64> {
        let batches = self
            .shared
            .store
            .list_batches(ctx.tenant_id, Some(product_id))
            .await?;
        Ok(batches
            .iter()
            .filter(|b| b.is_active())
            .fold(0i64, |acc, b| acc.saturating_add(b.quantity())))
    }

    /// Every batch of a product, exhausted and retired ones included.
    pub async fn batches(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
    ) -> DomainResult<Vec<InventoryBatch>> {
        Ok(self
            .shared
            .store
            .list_batches(ctx.tenant_id, Some(product_id))
            .await?)
    }

    /// Movement log, optionally narrowed to one product, in sequence order.
    pub async fn movements(
        &self,
        ctx: &OperationContext,
        product_id: Option<ProductId>,
    ) -> DomainResult<Vec<StockMovement>> {
        let mut movements = self.shared.store.list_movements(ctx.tenant_id).await?;
        if let Some(product_id) = product_id {
            movements.retain(|m| m.product_id == product_id);
        }
        Ok(movements)
    }

    /// Put previously sold units back into the batches they came from.
    ///
    /// Exhausted batches may be restocked; retired ones may not.
    #[instrument(skip(self, ctx, returns), fields(tenant_id = %ctx.tenant_id, product_id = %product_id), err)]
    pub async fn restock(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        returns: &[(BatchId, i64)],
        sale_id: Option<SaleId>,
    ) -> DomainResult<Vec<StockMovement>> {
        with_retry(&self.shared.settings.retry, "batch_store.restock", || {
            self.try_restock(ctx, product_id, returns, sale_id)
        })
        .await
    }

    async fn try_restock(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        returns: &[(BatchId, i64)],
        sale_id: Option<SaleId>,
    ) -> DomainResult<Vec<StockMovement>> {
        self.shared
            .timed("batch_store.restock", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = restock_in_tx(tx.as_mut(), ctx, product_id, returns, sale_id).await;
                finish(tx, result).await
            })
            .await
    }

    /// Manual correction of one batch by a signed amount.
    #[instrument(skip(self, ctx, note), fields(tenant_id = %ctx.tenant_id, product_id = %product_id), err)]
    pub async fn adjust(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        batch_id: BatchId,
        delta: i64,
        note: impl Into<String>,
    ) -> DomainResult<StockMovement> {
        let note = note.into();
        with_retry(&self.shared.settings.retry, "batch_store.adjust", || {
            self.try_adjust(ctx, product_id, batch_id, delta, &note)
        })
        .await
    }

    async fn try_adjust(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        batch_id: BatchId,
        delta: i64,
        note: &str,
    ) -> DomainResult<StockMovement> {
        self.shared
            .timed("batch_store.adjust", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = adjust_in_tx(tx.as_mut(), ctx, product_id, batch_id, delta, note).await;
                finish(tx, result).await
            })
            .await
    }

    /// One-shot conversion of a legacy flat-stock figure into a batch keyed
    /// `LEGACY-<product>`. A second import for the product is a `Conflict`.
    #[instrument(
        skip(self, ctx, stock),
        fields(tenant_id = %ctx.tenant_id, product_id = %stock.product_id, quantity = stock.quantity),
        err
    )]
    pub async fn import_legacy_stock(
        &self,
        ctx: &OperationContext,
        stock: LegacyStock,
    ) -> DomainResult<BatchId> {
        with_retry(&self.shared.settings.retry, "batch_store.import_legacy_stock", || {
            self.try_import_legacy_stock(ctx, &stock)
        })
        .await
    }

    async fn try_import_legacy_stock(
        &self,
        ctx: &OperationContext,
        stock: &LegacyStock,
    ) -> DomainResult<BatchId> {
        self.shared
            .timed("batch_store.import_legacy_stock", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = import_legacy_in_tx(tx.as_mut(), ctx, stock).await;
                finish(tx, result).await
            })
            .await
    }

    /// Take a batch out of service, writing off whatever it still holds.
    ///
    /// Returns the quantity written off.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, batch_id = %batch_id), err)]
    pub async fn retire(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        batch_id: BatchId,
    ) -> DomainResult<i64> {
        with_retry(&self.shared.settings.retry, "batch_store.retire", || {
            self.try_retire(ctx, product_id, batch_id)
        })
        .await
    }

    async fn try_retire(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        batch_id: BatchId,
    ) -> DomainResult<i64> {
        self.shared
            .timed("batch_store.retire", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = retire_in_tx(tx.as_mut(), ctx, product_id, batch_id).await;
                finish(tx, result).await
            })
            .await
    }
}

/// Credit one batch and record the movement.
pub(crate) async fn credit_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    request: &CreditRequest,
    reason: MovementReason,
    reference: Option<MovementReference>,
) -> DomainResult<StockMovement> {
    if request.quantity <= 0 {
        return Err(DomainError::invalid_quantity(
            request.quantity,
            "credited quantity must be positive",
        ));
    }
    require_product(tx, request.product_id).await?;

    let batch_number = request.batch_number.trim();
    let batch_id = match tx
        .lock_batch_by_number(request.product_id, batch_number)
        .await?
    {
        Some(mut batch) => {
            if batch.expiry_date() != request.expiry_date {
                return Err(DomainError::conflict(format!(
                    "batch {batch_number} of product {} expires {}, not {}",
                    request.product_id,
                    batch.expiry_date(),
                    request.expiry_date
                )));
            }
            batch.credit(request.quantity, ctx.occurred_at)?;
            tx.update_batch(&batch).await?;
            batch.id_typed()
        }
        None => {
            let batch = InventoryBatch::open(
                BatchId::new(),
                ctx.tenant_id,
                BatchSpec {
                    product_id: request.product_id,
                    batch_number: batch_number.to_string(),
                    expiry_date: request.expiry_date,
                    cost_price: request.cost_price,
                    selling_price: request.selling_price,
                    supplier_id: request.supplier_id,
                },
                request.quantity,
                ctx.today(),
                ctx.occurred_at,
            )?;
            tx.insert_batch(&batch).await?;
            info!(batch_id = %batch.id_typed(), batch_number, "batch opened");
            batch.id_typed()
        }
    };

    let movement = StockMovement::new(
        ctx,
        request.product_id,
        batch_id,
        request.quantity,
        reason,
        reference,
    )?;
    Ok(tx.append_movement(movement).await?)
}

/// Debit several batches of one product atomically and record one movement
/// per batch.
pub(crate) async fn debit_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    product_id: ProductId,
    allocations: &[(BatchId, i64)],
    reason: MovementReason,
    reference: Option<MovementReference>,
) -> DomainResult<Vec<StockMovement>> {
    require_product(tx, product_id).await?;
    let mut batches = tx.lock_batches(product_id).await?;
    let applied = apply_debits(product_id, &mut batches, allocations, ctx.occurred_at)?;

    let mut movements = Vec::with_capacity(applied.len());
    for (batch_id, quantity) in applied {
        let Some(batch) = batches.iter().find(|b| b.id_typed() == batch_id) else {
            return Err(DomainError::UnknownBatch {
                product_id,
                batch_id,
            });
        };
        tx.update_batch(batch).await?;
        let movement = StockMovement::new(ctx, product_id, batch_id, -quantity, reason, reference)?;
        movements.push(tx.append_movement(movement).await?);
    }
    Ok(movements)
}

async fn lock_product_batch(
    tx: &mut dyn LedgerTx,
    product_id: ProductId,
    batch_id: BatchId,
) -> DomainResult<InventoryBatch> {
    match tx.lock_batch(batch_id).await? {
        Some(batch) if batch.product_id() == product_id => Ok(batch),
        _ => Err(DomainError::UnknownBatch {
            product_id,
            batch_id,
        }),
    }
}

pub(crate) async fn restock_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    product_id: ProductId,
    returns: &[(BatchId, i64)],
    sale_id: Option<SaleId>,
) -> DomainResult<Vec<StockMovement>> {
    if returns.is_empty() {
        return Err(DomainError::invalid_quantity(0, "return has no lines"));
    }
    require_product(tx, product_id).await?;

    let reference = sale_id.map(MovementReference::Sale);
    let mut movements = Vec::with_capacity(returns.len());
    for &(batch_id, quantity) in returns {
        let mut batch = lock_product_batch(tx, product_id, batch_id).await?;
        batch.credit(quantity, ctx.occurred_at)?;
        tx.update_batch(&batch).await?;
        let movement = StockMovement::new(
            ctx,
            product_id,
            batch_id,
            quantity,
            MovementReason::Return,
            reference,
        )?;
        movements.push(tx.append_movement(movement).await?);
    }
    Ok(movements)
}

async fn adjust_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    product_id: ProductId,
    batch_id: BatchId,
    delta: i64,
    note: &str,
) -> DomainResult<StockMovement> {
    if delta == 0 {
        return Err(DomainError::invalid_quantity(0, "adjustment cannot be zero"));
    }
    let mut batch = lock_product_batch(tx, product_id, batch_id).await?;
    if delta > 0 {
        batch.credit(delta, ctx.occurred_at)?;
    } else {
        batch.debit(-delta, ctx.occurred_at)?;
    }
    tx.update_batch(&batch).await?;

    let mut movement =
        StockMovement::new(ctx, product_id, batch_id, delta, MovementReason::Adjustment, None)?;
    if !note.trim().is_empty() {
        movement = movement.with_note(note.trim());
    }
    Ok(tx.append_movement(movement).await?)
}

async fn import_legacy_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    stock: &LegacyStock,
) -> DomainResult<BatchId> {
    require_product(tx, stock.product_id).await?;
    let batch_number = legacy_batch_number(stock.product_id);
    if tx
        .lock_batch_by_number(stock.product_id, &batch_number)
        .await?
        .is_some()
    {
        return Err(DomainError::conflict(format!(
            "legacy stock for product {} was already imported",
            stock.product_id
        )));
    }

    let batch = InventoryBatch::open(
        BatchId::new(),
        ctx.tenant_id,
        BatchSpec {
            product_id: stock.product_id,
            batch_number,
            expiry_date: stock.expiry_date,
            cost_price: stock.cost_price,
            selling_price: stock.selling_price,
            supplier_id: None,
        },
        stock.quantity,
        ctx.today(),
        ctx.occurred_at,
    )?;
    tx.insert_batch(&batch).await?;

    let movement = StockMovement::new(
        ctx,
        stock.product_id,
        batch.id_typed(),
        stock.quantity,
        MovementReason::Adjustment,
        None,
    )?
    .with_note("legacy stock import");
    tx.append_movement(movement).await?;
    Ok(batch.id_typed())
}

async fn retire_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    product_id: ProductId,
    batch_id: BatchId,
) -> DomainResult<i64> {
    let mut batch = lock_product_batch(tx, product_id, batch_id).await?;
    if !batch.is_active() {
        return Ok(0);
    }

    let remaining = batch.quantity();
    if remaining > 0 {
        batch.debit(remaining, ctx.occurred_at)?;
        let movement = StockMovement::new(
            ctx,
            product_id,
            batch_id,
            -remaining,
            MovementReason::Adjustment,
            None,
        )?
        .with_note("written off on retirement");
        tx.append_movement(movement).await?;
    }
    batch.retire(ctx.occurred_at)?;
    tx.update_batch(&batch).await?;
    info!(batch_id = %batch_id, written_off = remaining, "batch retired");
    Ok(remaining)
}
