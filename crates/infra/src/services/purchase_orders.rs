//! Purchase-order ledger.
//!
//! Every transition loads the order under lock, runs the command through the
//! `PurchaseOrder` state machine, and saves the new state together with its
//! events under an optimistic version check. Receipts also credit the batch
//! store inside the same transaction, so a receipt either moves stock and
//! status together or moves neither.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use rxledger_core::{
    AggregateRoot, DomainError, DomainResult, ExpectedVersion, OperationContext, PurchaseOrderId,
};
use rxledger_events::{RecordedEvent, execute, validate_stream};
use rxledger_inventory::{MovementReason, MovementReference, StockMovement};
use rxledger_products::CatalogDefaults;
use rxledger_purchasing::{
    Cancel, CreatePurchaseOrder, MarkOrdered, OrderItemInput, OrderTerms, PurchaseOrder,
    PurchaseOrderCommand, PurchaseOrderEvent, ReceiptLine, ReceiveGoods, ResolvedItem,
    UpdatePurchaseOrder,
};

use crate::retry::with_retry;
use crate::store::{LedgerStore, LedgerTx, ORDER_STREAM_TYPE};

use super::batch_store::{CreditRequest, credit_in_tx};
use super::catalog::{require_product, resolve_item_product};
use super::{ServiceSettings, Shared, finish};

/// Items and header terms for creating or replacing an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub items: Vec<OrderItemInput>,
    pub terms: OrderTerms,
}

/// Result of a receipt: the order after the transition and the stock
/// movements it produced, one per received line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub order: PurchaseOrder,
    pub movements: Vec<StockMovement>,
}

#[derive(Debug)]
pub struct PurchaseOrderLedger<S> {
    shared: Shared<S>,
}

impl<S> Clone for PurchaseOrderLedger<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: LedgerStore> PurchaseOrderLedger<S> {
    pub fn new(store: Arc<S>, settings: Arc<ServiceSettings>) -> Self {
        Self {
            shared: Shared::new(store, settings),
        }
    }

    pub(crate) fn from_shared(shared: Shared<S>) -> Self {
        Self { shared }
    }

    /// Create a `pending` order, registering any new products it names.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id, items = request.items.len()), err)]
    pub async fn create(
        &self,
        ctx: &OperationContext,
        request: OrderRequest,
    ) -> DomainResult<PurchaseOrder> {
        let order_id = PurchaseOrderId::new();
        let order = with_retry(&self.shared.settings.retry, "purchase_orders.create", || {
            self.try_create(ctx, order_id, &request)
        })
        .await?;
        info!(order_id = %order_id, total = %order.totals().total, "purchase order created");
        Ok(order)
    }

    async fn try_create(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
        request: &OrderRequest,
    ) -> DomainResult<PurchaseOrder> {
        self.shared
            .timed("purchase_orders.create", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = create_in_tx(
                    tx.as_mut(),
                    ctx,
                    &self.shared.settings.catalog_defaults,
                    order_id,
                    request,
                )
                .await;
                finish(tx, result).await
            })
            .await
    }

    /// Replace the items and terms of a `pending` order.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id, order_id = %order_id), err)]
    pub async fn update(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
        request: OrderRequest,
    ) -> DomainResult<PurchaseOrder> {
        with_retry(&self.shared.settings.retry, "purchase_orders.update", || {
            self.try_update(ctx, order_id, &request)
        })
        .await
    }

    async fn try_update(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
        request: &OrderRequest,
    ) -> DomainResult<PurchaseOrder> {
        self.shared
            .timed("purchase_orders.update", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = update_in_tx(
                    tx.as_mut(),
                    ctx,
                    &self.shared.settings.catalog_defaults,
                    order_id,
                    request,
                )
                .await;
                finish(tx, result).await
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, order_id = %order_id), err)]
    pub async fn mark_ordered(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
    ) -> DomainResult<PurchaseOrder> {
        let command = PurchaseOrderCommand::MarkOrdered(MarkOrdered {
            tenant_id: ctx.tenant_id,
            order_id,
            occurred_at: ctx.occurred_at,
        });
        with_retry(&self.shared.settings.retry, "purchase_orders.mark_ordered", || {
            self.try_transition(ctx, order_id, &command, "purchase_orders.mark_ordered")
        })
        .await
    }

    /// Cancel a `pending` or `ordered` order. Stock is never touched.
    #[instrument(skip(self, ctx, reason), fields(tenant_id = %ctx.tenant_id, order_id = %order_id), err)]
    pub async fn cancel(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
        reason: Option<String>,
    ) -> DomainResult<PurchaseOrder> {
        let command = PurchaseOrderCommand::Cancel(Cancel {
            tenant_id: ctx.tenant_id,
            order_id,
            reason,
            occurred_at: ctx.occurred_at,
        });
        with_retry(&self.shared.settings.retry, "purchase_orders.cancel", || {
            self.try_transition(ctx, order_id, &command, "purchase_orders.cancel")
        })
        .await
    }

    async fn try_transition(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
        command: &PurchaseOrderCommand,
        operation: &'static str,
    ) -> DomainResult<PurchaseOrder> {
        self.shared
            .timed(operation, async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = transition_in_tx(tx.as_mut(), ctx, order_id, command).await;
                finish(tx, result).await
            })
            .await
    }

    /// Record delivered quantities and credit the matching batches.
    #[instrument(skip(self, ctx, lines), fields(tenant_id = %ctx.tenant_id, order_id = %order_id, lines = lines.len()), err)]
    pub async fn receive(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
        lines: Vec<ReceiptLine>,
    ) -> DomainResult<Receipt> {
        let receipt = with_retry(&self.shared.settings.retry, "purchase_orders.receive", || {
            self.try_receive(ctx, order_id, &lines)
        })
        .await?;
        info!(
            order_id = %order_id,
            status = %receipt.order.status(),
            received = receipt.order.total_received(),
            ordered = receipt.order.total_ordered(),
            "goods received"
        );
        Ok(receipt)
    }

    async fn try_receive(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
        lines: &[ReceiptLine],
    ) -> DomainResult<Receipt> {
        self.shared
            .timed("purchase_orders.receive", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = receive_in_tx(tx.as_mut(), ctx, order_id, lines).await;
                finish(tx, result).await
            })
            .await
    }

    pub async fn get(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
    ) -> DomainResult<PurchaseOrder> {
        self.shared
            .store
            .get_order(ctx.tenant_id, order_id)
            .await?
            .ok_or_else(|| DomainError::not_found("purchase order", order_id))
    }

    /// The order's recorded events, oldest first.
    pub async fn history(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
    ) -> DomainResult<Vec<RecordedEvent>> {
        let events = self
            .shared
            .store
            .order_history(ctx.tenant_id, order_id)
            .await?;
        if events.is_empty() {
            return Err(DomainError::not_found("purchase order", order_id));
        }
        validate_stream(ctx.tenant_id, Uuid::from(order_id), &events)?;
        Ok(events)
    }

    /// Rebuild the order from its history alone.
    pub async fn replay(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
    ) -> DomainResult<PurchaseOrder> {
        let events = self
            .history(ctx, order_id)
            .await?
            .iter()
            .map(RecordedEvent::decode::<PurchaseOrderEvent>)
            .collect::<DomainResult<Vec<_>>>()?;
        Ok(PurchaseOrder::rehydrate(order_id, &events))
    }
}

async fn resolve_items(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    defaults: &CatalogDefaults,
    items: &[OrderItemInput],
) -> DomainResult<Vec<ResolvedItem>> {
    if items.is_empty() {
        return Err(DomainError::invalid_item("purchase order needs at least one item"));
    }
    let mut resolved = Vec::with_capacity(items.len());
    for item in items {
        item.validate()?;
        let product = item.product.clone().resolve()?;
        let product_id = resolve_item_product(tx, ctx, defaults, product).await?;
        resolved.push(ResolvedItem {
            product_id,
            quantity: item.quantity,
            unit_cost: item.unit_cost,
            selling_price: item.selling_price,
        });
    }
    Ok(resolved)
}

async fn load_order(
    tx: &mut dyn LedgerTx,
    order_id: PurchaseOrderId,
) -> DomainResult<(PurchaseOrder, ExpectedVersion)> {
    let order = tx
        .lock_order(order_id)
        .await?
        .ok_or_else(|| DomainError::not_found("purchase order", order_id))?;
    let expected = ExpectedVersion::Exact(order.version());
    Ok((order, expected))
}

/// Persist the order with its new events, numbered after `expected`.
async fn save(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    order: &PurchaseOrder,
    expected: ExpectedVersion,
    events: &[PurchaseOrderEvent],
) -> DomainResult<()> {
    let base = match expected {
        ExpectedVersion::New => 0,
        ExpectedVersion::Exact(v) => v,
    };
    let stream_id = Uuid::from(order.id_typed());
    let recorded = events
        .iter()
        .enumerate()
        .map(|(i, event)| {
            RecordedEvent::from_typed(
                ctx.tenant_id,
                stream_id,
                ORDER_STREAM_TYPE,
                base + i as u64 + 1,
                ctx.actor,
                event,
            )
        })
        .collect::<DomainResult<Vec<_>>>()?;
    tx.save_order(order, recorded, expected).await?;
    Ok(())
}

async fn create_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    defaults: &CatalogDefaults,
    order_id: PurchaseOrderId,
    request: &OrderRequest,
) -> DomainResult<PurchaseOrder> {
    let items = resolve_items(tx, ctx, defaults, &request.items).await?;
    let mut order = PurchaseOrder::empty(order_id);
    let command = PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
        tenant_id: ctx.tenant_id,
        order_id,
        items,
        terms: request.terms.clone(),
        actor: ctx.actor,
        occurred_at: ctx.occurred_at,
    });
    let events = execute(&mut order, &command)?;
    save(tx, ctx, &order, ExpectedVersion::New, &events).await?;
    Ok(order)
}

async fn update_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    defaults: &CatalogDefaults,
    order_id: PurchaseOrderId,
    request: &OrderRequest,
) -> DomainResult<PurchaseOrder> {
    let (mut order, expected) = load_order(tx, order_id).await?;
    let items = resolve_items(tx, ctx, defaults, &request.items).await?;
    let command = PurchaseOrderCommand::UpdatePurchaseOrder(UpdatePurchaseOrder {
        tenant_id: ctx.tenant_id,
        order_id,
        items,
        terms: request.terms.clone(),
        occurred_at: ctx.occurred_at,
    });
    let events = execute(&mut order, &command)?;
    save(tx, ctx, &order, expected, &events).await?;
    Ok(order)
}

async fn transition_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    order_id: PurchaseOrderId,
    command: &PurchaseOrderCommand,
) -> DomainResult<PurchaseOrder> {
    let (mut order, expected) = load_order(tx, order_id).await?;
    let events = execute(&mut order, command)?;
    save(tx, ctx, &order, expected, &events).await?;
    Ok(order)
}

async fn receive_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    order_id: PurchaseOrderId,
    lines: &[ReceiptLine],
) -> DomainResult<Receipt> {
    let (mut order, expected) = load_order(tx, order_id).await?;
    let command = PurchaseOrderCommand::ReceiveGoods(ReceiveGoods {
        tenant_id: ctx.tenant_id,
        order_id,
        lines: lines.to_vec(),
        occurred_at: ctx.occurred_at,
    });
    let events = execute(&mut order, &command)?;

    let mut movements = Vec::new();
    for event in &events {
        let PurchaseOrderEvent::GoodsReceived(received) = event else {
            continue;
        };
        for line in &received.lines {
            let product = require_product(tx, line.product_id).await?;
            let selling_price = match line.selling_price {
                Some(price) => price,
                None => product.pricing.selling_price(line.unit_cost)?,
            };
            let credit = CreditRequest {
                product_id: line.product_id,
                batch_number: line.batch_number.clone(),
                quantity: line.quantity,
                cost_price: line.unit_cost,
                selling_price,
                expiry_date: line.expiry_date,
                supplier_id: received.supplier_id,
            };
            let movement = credit_in_tx(
                tx,
                ctx,
                &credit,
                MovementReason::PurchaseReceive,
                Some(MovementReference::PurchaseOrder(order_id)),
            )
            .await?;
            movements.push(movement);
        }
    }

    save(tx, ctx, &order, expected, &events).await?;
    Ok(Receipt { order, movements })
}
