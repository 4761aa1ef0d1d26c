use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use rxledger_core::money::line_amount;
use rxledger_core::{BatchId, DomainError, DomainResult, Entity, ProductId, SupplierId, TenantId};

/// Lot description: everything that identifies and prices a batch apart from
/// its live quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpec {
    pub product_id: ProductId,
    /// Supplier lot number, or a synthetic key derived by the ledger.
    pub batch_number: String,
    pub expiry_date: NaiveDate,
    pub cost_price: Decimal,
    pub selling_price: Decimal,
    pub supplier_id: Option<SupplierId>,
}

/// A physically distinct lot of one product.
///
/// `quantity` is private: it only changes through `credit`/`debit`, and the
/// services that call those always record a matching `StockMovement`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryBatch {
    id: BatchId,
    tenant_id: TenantId,
    spec: BatchSpec,
    quantity: i64,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InventoryBatch {
    /// Open a new batch with its first receipt.
    ///
    /// Fails with `InvalidQuantity` for a non-positive quantity and with
    /// `InvalidExpiry` when the lot has already expired on `today`.
    pub fn open(
        id: BatchId,
        tenant_id: TenantId,
        spec: BatchSpec,
        quantity: i64,
        today: NaiveDate,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if quantity <= 0 {
            return Err(DomainError::invalid_quantity(
                quantity,
                "credited quantity must be positive",
            ));
        }
        if spec.expiry_date < today {
            return Err(DomainError::InvalidExpiry {
                expiry: spec.expiry_date,
                today,
            });
        }
        if spec.batch_number.trim().is_empty() {
            return Err(DomainError::validation("batch number cannot be empty"));
        }
        if spec.cost_price < Decimal::ZERO || spec.selling_price < Decimal::ZERO {
            return Err(DomainError::validation("batch prices cannot be negative"));
        }
        Ok(Self {
            id,
            tenant_id,
            spec,
            quantity,
            active: true,
            created_at: at,
            updated_at: at,
        })
    }

    /// Rebuild a batch read back from storage.
    pub fn restore(
        id: BatchId,
        tenant_id: TenantId,
        spec: BatchSpec,
        quantity: i64,
        active: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            spec,
            quantity,
            active,
            created_at,
            updated_at,
        }
    }

    pub fn id_typed(&self) -> BatchId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.spec.product_id
    }

    pub fn spec(&self) -> &BatchSpec {
        &self.spec
    }

    pub fn batch_number(&self) -> &str {
        &self.spec.batch_number
    }

    pub fn expiry_date(&self) -> NaiveDate {
        self.spec.expiry_date
    }

    pub fn cost_price(&self) -> Decimal {
        self.spec.cost_price
    }

    pub fn selling_price(&self) -> Decimal {
        self.spec.selling_price
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.spec.supplier_id
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Active and not exhausted.
    pub fn is_allocatable(&self) -> bool {
        self.active && self.quantity > 0
    }

    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.spec.expiry_date < today
    }

    /// On-hand value at cost.
    pub fn value(&self) -> DomainResult<Decimal> {
        line_amount(self.spec.cost_price, self.quantity)
    }

    /// Increase quantity on hand.
    pub fn credit(&mut self, quantity: i64, at: DateTime<Utc>) -> DomainResult<()> {
        if quantity <= 0 {
            return Err(DomainError::invalid_quantity(
                quantity,
                "credited quantity must be positive",
            ));
        }
        if !self.active {
            return Err(DomainError::validation(format!(
                "batch {} is retired and cannot be credited",
                self.id
            )));
        }
        self.quantity = self.quantity.checked_add(quantity).ok_or_else(|| {
            DomainError::invalid_quantity(
                quantity,
                format!("batch {} cannot hold {} more units", self.id, quantity),
            )
        })?;
        self.updated_at = at;
        Ok(())
    }

    /// Decrease quantity on hand; never below zero.
    pub fn debit(&mut self, quantity: i64, at: DateTime<Utc>) -> DomainResult<()> {
        if quantity <= 0 {
            return Err(DomainError::invalid_quantity(
                quantity,
                "debited quantity must be positive",
            ));
        }
        let available = if self.active { self.quantity } else { 0 };
        if quantity > available {
            return Err(DomainError::InsufficientStock {
                product_id: self.spec.product_id,
                batch_id: Some(self.id),
                requested: quantity,
                available,
            });
        }
        self.quantity -= quantity;
        self.updated_at = at;
        Ok(())
    }

    /// Take the batch out of service. Remaining quantity must already be zero.
    pub fn retire(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.quantity != 0 {
            return Err(DomainError::validation(format!(
                "batch {} still holds {} units",
                self.id, self.quantity
            )));
        }
        self.active = false;
        self.updated_at = at;
        Ok(())
    }
}

impl Entity for InventoryBatch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// Apply a multi-batch debit with no partial effect.
///
/// Every allocation is validated against the batches first: the batch must be
/// one of `batches` and belong to `product_id`, quantities must be positive and
/// allocations naming the same batch are summed before the stock check. Only
/// when all of them pass are the batches mutated. Returns the consolidated
/// `(batch, quantity)` pairs in first-seen order.
pub fn apply_debits(
    product_id: ProductId,
    batches: &mut [InventoryBatch],
    allocations: &[(BatchId, i64)],
    at: DateTime<Utc>,
) -> DomainResult<Vec<(BatchId, i64)>> {
    if allocations.is_empty() {
        return Err(DomainError::invalid_quantity(0, "debit has no allocations"));
    }

    let mut order: Vec<BatchId> = Vec::new();
    let mut totals: HashMap<BatchId, i64> = HashMap::new();
    for &(batch_id, quantity) in allocations {
        if quantity <= 0 {
            return Err(DomainError::invalid_quantity(
                quantity,
                format!("allocation for batch {batch_id} must be positive"),
            ));
        }
        if !batches
            .iter()
            .any(|b| b.id == batch_id && b.spec.product_id == product_id)
        {
            return Err(DomainError::UnknownBatch {
                product_id,
                batch_id,
            });
        }
        let entry = totals.entry(batch_id).or_insert_with(|| {
            order.push(batch_id);
            0
        });
        // Saturates: an overflowing total exceeds any batch anyway.
        *entry = entry.saturating_add(quantity);
    }

    for batch_id in &order {
        let requested = totals[batch_id];
        if let Some(batch) = batches.iter().find(|b| b.id == *batch_id) {
            let available = if batch.active { batch.quantity } else { 0 };
            if requested > available {
                return Err(DomainError::InsufficientStock {
                    product_id,
                    batch_id: Some(*batch_id),
                    requested,
                    available,
                });
            }
        }
    }

    let mut applied = Vec::with_capacity(order.len());
    for batch_id in order {
        let quantity = totals[&batch_id];
        if let Some(batch) = batches.iter_mut().find(|b| b.id == batch_id) {
            batch.debit(quantity, at)?;
            applied.push((batch_id, quantity));
        }
    }
    Ok(applied)
}
