//! First-expired-first-out allocation.
//!
//! Planning is pure: it reads a set of batches and returns which ones to draw
//! from. Nothing is reserved. The plan only takes effect when it is committed
//! through a debit, which re-checks every batch under the store's lock.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use rxledger_core::money::{line_amount, sum_money};
use rxledger_core::{BatchId, DomainError, DomainResult, ProductId};

use crate::batch::InventoryBatch;

/// One batch's share of an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub batch_id: BatchId,
    pub quantity: i64,
    pub cost_price: Decimal,
    pub selling_price: Decimal,
    pub expiry_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub product_id: ProductId,
    pub lines: Vec<AllocationLine>,
}

impl AllocationPlan {
    pub fn total_quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    /// Σ quantity × cost price of the batches drawn from.
    pub fn cost_basis(&self) -> DomainResult<Decimal> {
        let amounts = self
            .lines
            .iter()
            .map(|l| line_amount(l.cost_price, l.quantity))
            .collect::<DomainResult<Vec<_>>>()?;
        sum_money(amounts)
    }

    /// Σ quantity × selling price of the batches drawn from.
    pub fn revenue_at_batch_prices(&self) -> DomainResult<Decimal> {
        let amounts = self
            .lines
            .iter()
            .map(|l| line_amount(l.selling_price, l.quantity))
            .collect::<DomainResult<Vec<_>>>()?;
        sum_money(amounts)
    }

    /// `(batch, quantity)` pairs suitable for a debit.
    pub fn debits(&self) -> Vec<(BatchId, i64)> {
        self.lines.iter().map(|l| (l.batch_id, l.quantity)).collect()
    }
}

/// Plan a FEFO draw of `requested` units of `product_id` from `batches`.
///
/// Only active, non-empty batches of the product are considered, earliest
/// expiry first (ties broken by creation time, then batch number). Each batch
/// is consumed fully before the next. Fails with `InsufficientStock` when the
/// candidates hold fewer than `requested` units; no partial plan is returned.
pub fn plan_fefo(
    product_id: ProductId,
    batches: &[InventoryBatch],
    requested: i64,
) -> DomainResult<AllocationPlan> {
    if requested <= 0 {
        return Err(DomainError::invalid_quantity(
            requested,
            "requested quantity must be positive",
        ));
    }

    let mut candidates: Vec<&InventoryBatch> = batches
        .iter()
        .filter(|b| b.product_id() == product_id && b.is_allocatable())
        .collect();

    let available = candidates
        .iter()
        .fold(0i64, |acc, b| acc.saturating_add(b.quantity()));
    if available < requested {
        return Err(DomainError::InsufficientStock {
            product_id,
            batch_id: None,
            requested,
            available,
        });
    }

    candidates.sort_by(|a, b| {
        a.expiry_date()
            .cmp(&b.expiry_date())
            .then_with(|| a.created_at().cmp(&b.created_at()))
            .then_with(|| a.batch_number().cmp(b.batch_number()))
    });

    let mut remaining = requested;
    let mut lines = Vec::new();
    for batch in candidates {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(batch.quantity());
        lines.push(AllocationLine {
            batch_id: batch.id_typed(),
            quantity: take,
            cost_price: batch.cost_price(),
            selling_price: batch.selling_price(),
            expiry_date: batch.expiry_date(),
        });
        remaining -= take;
    }

    Ok(AllocationPlan { product_id, lines })
}
