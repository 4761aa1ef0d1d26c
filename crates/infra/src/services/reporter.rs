//! Read-only reconciliation views.
//!
//! Views other than `verify_replay` read the last committed state without
//! locking and may lag a concurrent writer slightly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use rxledger_core::money::sum_money;
use rxledger_core::{BatchId, DomainError, DomainResult, Entity, OperationContext, ProductId};
use rxledger_inventory::{InventoryBatch, replay};
use rxledger_products::Product;

use crate::store::LedgerStore;

use super::{ServiceSettings, Shared, finish};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockEntry {
    pub product: Product,
    pub on_hand: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiringBatch {
    pub batch: InventoryBatch,
    pub product: Product,
    /// Negative once expired.
    pub days_left: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductValuation {
    pub product_id: ProductId,
    pub name: String,
    pub quantity: i64,
    pub value: Decimal,
}

/// Stock value at cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Valuation {
    pub total: Decimal,
    pub by_product: Vec<ProductValuation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayDiscrepancy {
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub live: i64,
    pub replayed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub batches_checked: usize,
    pub movements_replayed: usize,
    pub discrepancies: Vec<ReplayDiscrepancy>,
}

impl ReplayReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

#[derive(Debug)]
pub struct ReconciliationReporter<S> {
    shared: Shared<S>,
}

impl<S> Clone for ReconciliationReporter<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: LedgerStore> ReconciliationReporter<S> {
    pub fn new(store: Arc<S>, settings: Arc<ServiceSettings>) -> Self {
        Self {
            shared: Shared::new(store, settings),
        }
    }

    pub(crate) fn from_shared(shared: Shared<S>) -> Self {
        Self { shared }
    }

    async fn products_by_id(
        &self,
        ctx: &OperationContext,
    ) -> DomainResult<HashMap<ProductId, Product>> {
        Ok(self
            .shared
            .store
            .list_products(ctx.tenant_id)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect())
    }

    async fn active_batches(&self, ctx: &OperationContext) -> DomainResult<Vec<InventoryBatch>> {
        let mut batches = self.shared.store.list_batches(ctx.tenant_id, None).await?;
        batches.retain(|b| b.is_active());
        Ok(batches)
    }

    /// Active products whose on-hand quantity is below their threshold, or
    /// below `threshold_override` when given.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn low_stock(
        &self,
        ctx: &OperationContext,
        threshold_override: Option<i64>,
    ) -> DomainResult<Vec<LowStockEntry>> {
        if threshold_override.is_some_and(|t| t < 0) {
            return Err(DomainError::validation("threshold cannot be negative"));
        }
        let mut on_hand: HashMap<ProductId, i64> = HashMap::new();
        for batch in self.active_batches(ctx).await? {
            let total = on_hand.entry(batch.product_id()).or_insert(0);
            *total = total.saturating_add(batch.quantity());
        }

        let mut entries: Vec<LowStockEntry> = self
            .shared
            .store
            .list_products(ctx.tenant_id)
            .await?
            .into_iter()
            .filter(|p| p.is_active())
            .filter_map(|product| {
                let on_hand = on_hand.get(&product.id).copied().unwrap_or(0);
                product
                    .is_below_threshold(on_hand, threshold_override)
                    .then_some(LowStockEntry { product, on_hand })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.on_hand
                .cmp(&b.on_hand)
                .then_with(|| a.product.name.cmp(&b.product.name))
        });
        Ok(entries)
    }

    /// Non-empty batches expiring between today and `days` from now,
    /// inclusive, soonest first. `None` uses the configured window.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn expiring_within(
        &self,
        ctx: &OperationContext,
        days: Option<i64>,
    ) -> DomainResult<Vec<ExpiringBatch>> {
        let days = days.unwrap_or(self.shared.settings.expiry_window_days);
        if days < 0 {
            return Err(DomainError::validation(format!(
                "expiry window cannot be negative, got {days}"
            )));
        }
        let today = ctx.today();
        // A window past the calendar's end covers every later date.
        let horizon = Duration::try_days(days)
            .and_then(|window| today.checked_add_signed(window))
            .unwrap_or(NaiveDate::MAX);
        self.batch_view(ctx, |b| b.expiry_date() >= today && b.expiry_date() <= horizon)
            .await
    }

    /// Batches already past expiry that still hold stock.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn expired(&self, ctx: &OperationContext) -> DomainResult<Vec<ExpiringBatch>> {
        let today = ctx.today();
        self.batch_view(ctx, |b| b.is_expired(today)).await
    }

    async fn batch_view(
        &self,
        ctx: &OperationContext,
        include: impl Fn(&InventoryBatch) -> bool,
    ) -> DomainResult<Vec<ExpiringBatch>> {
        let today = ctx.today();
        let products = self.products_by_id(ctx).await?;
        let mut view = Vec::new();
        for batch in self.active_batches(ctx).await? {
            if batch.quantity() == 0 || !include(&batch) {
                continue;
            }
            let Some(product) = products.get(&batch.product_id()) else {
                warn!(batch_id = %batch.id_typed(), "batch references a missing product");
                continue;
            };
            view.push(ExpiringBatch {
                days_left: (batch.expiry_date() - today).num_days(),
                product: product.clone(),
                batch,
            });
        }
        view.sort_by(|a, b| {
            a.batch
                .expiry_date()
                .cmp(&b.batch.expiry_date())
                .then_with(|| a.batch.batch_number().cmp(b.batch.batch_number()))
        });
        Ok(view)
    }

    /// Σ quantity × cost price over active batches, with a per-product split.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn valuation(&self, ctx: &OperationContext) -> DomainResult<Valuation> {
        let products = self.products_by_id(ctx).await?;
        let mut per_product: BTreeMap<ProductId, (i64, Decimal)> = BTreeMap::new();
        for batch in self.active_batches(ctx).await? {
            if batch.quantity() == 0 {
                continue;
            }
            let entry = per_product
                .entry(batch.product_id())
                .or_insert((0, Decimal::ZERO));
            entry.0 = entry.0.saturating_add(batch.quantity());
            entry.1 = sum_money([entry.1, batch.value()?])?;
        }

        let mut by_product: Vec<ProductValuation> = per_product
            .into_iter()
            .map(|(product_id, (quantity, value))| ProductValuation {
                product_id,
                name: products
                    .get(&product_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default(),
                quantity,
                value,
            })
            .collect();
        by_product.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Valuation {
            total: sum_money(by_product.iter().map(|p| p.value))?,
            by_product,
        })
    }

    /// Replay every movement and compare against live batch quantities.
    ///
    /// Runs in a transaction so the two sides are read at the same point.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn verify_replay(&self, ctx: &OperationContext) -> DomainResult<ReplayReport> {
        let snapshot = self
            .shared
            .timed("reporter.verify_replay", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = tx.ledger_snapshot().await.map_err(DomainError::from);
                finish(tx, result).await
            })
            .await?;

        let mut replayed = replay(&snapshot.movements);
        let mut discrepancies = Vec::new();
        for batch in &snapshot.batches {
            let expected = replayed.remove(&batch.id_typed()).unwrap_or(0);
            if expected != batch.quantity() {
                discrepancies.push(ReplayDiscrepancy {
                    batch_id: batch.id_typed(),
                    product_id: batch.product_id(),
                    live: batch.quantity(),
                    replayed: expected,
                });
            }
        }
        // Movements for batches that no longer exist.
        for (batch_id, expected) in replayed.into_iter().filter(|(_, q)| *q != 0) {
            let product_id = snapshot
                .movements
                .iter()
                .find(|m| m.batch_id == batch_id)
                .map(|m| m.product_id);
            if let Some(product_id) = product_id {
                discrepancies.push(ReplayDiscrepancy {
                    batch_id,
                    product_id,
                    live: 0,
                    replayed: expected,
                });
            }
        }

        if !discrepancies.is_empty() {
            warn!(count = discrepancies.len(), "replay does not match live quantities");
        }
        Ok(ReplayReport {
            batches_checked: snapshot.batches.len(),
            movements_replayed: snapshot.movements.len(),
            discrepancies,
        })
    }
}
