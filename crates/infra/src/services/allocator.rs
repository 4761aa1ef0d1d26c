//! Stock allocation and checkout.
//!
//! `allocate` is advisory: it plans against the last committed batches and
//! reserves nothing. `commit` and `checkout` debit under the transaction's
//! batch locks, so a stale plan fails with `InsufficientStock` instead of
//! overdrawing.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use rxledger_core::money::{line_amount, percent_of, sum_money};
use rxledger_core::{BatchId, DomainError, DomainResult, OperationContext, ProductId, SaleId};
use rxledger_inventory::{
    AllocationLine, AllocationPlan, MovementReason, MovementReference, StockMovement, plan_fefo,
};
use rxledger_products::Product;

use crate::retry::with_retry;
use crate::store::{LedgerStore, LedgerTx};

use super::batch_store::debit_in_tx;
use super::catalog::require_product;
use super::{ServiceSettings, Shared, finish};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutLine {
    pub product_id: ProductId,
    pub quantity: i64,
    /// Overrides the batches' selling prices for revenue.
    #[serde(default)]
    pub unit_price: Option<Decimal>,
}

impl CheckoutLine {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
            unit_price: None,
        }
    }

    pub fn at_price(mut self, unit_price: Decimal) -> Self {
        self.unit_price = Some(unit_price);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Generated when absent.
    #[serde(default)]
    pub sale_id: Option<SaleId>,
    pub lines: Vec<CheckoutLine>,
}

/// What one checkout line consumed and earned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub product_id: ProductId,
    pub quantity: i64,
    pub allocations: Vec<AllocationLine>,
    pub cost_basis: Decimal,
    pub revenue: Decimal,
    pub tax: Decimal,
    pub profit: Decimal,
}

impl Settlement {
    /// Price a FEFO plan for `product`.
    pub fn price(
        product: &Product,
        plan: AllocationPlan,
        unit_price: Option<Decimal>,
    ) -> DomainResult<Self> {
        let quantity = plan.total_quantity();
        let revenue = match unit_price {
            Some(price) if price < Decimal::ZERO => {
                return Err(DomainError::validation(format!(
                    "unit price cannot be negative, got {price}"
                )));
            }
            Some(price) => line_amount(price, quantity)?,
            None => plan.revenue_at_batch_prices()?,
        };
        let cost_basis = plan.cost_basis()?;
        let profit = revenue
            .checked_sub(cost_basis)
            .ok_or_else(|| DomainError::validation("profit is out of range"))?;
        Ok(Self {
            product_id: plan.product_id,
            quantity,
            cost_basis,
            revenue,
            tax: percent_of(revenue, product.tax_rate)?,
            profit,
            allocations: plan.lines,
        })
    }

    /// `(batch, quantity)` pairs for returning the whole line to stock.
    pub fn returnable(&self) -> Vec<(BatchId, i64)> {
        self.allocations
            .iter()
            .map(|a| (a.batch_id, a.quantity))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkout {
    pub sale_id: SaleId,
    pub lines: Vec<Settlement>,
}

impl Checkout {
    pub fn total_revenue(&self) -> DomainResult<Decimal> {
        sum_money(self.lines.iter().map(|l| l.revenue))
    }

    pub fn total_tax(&self) -> DomainResult<Decimal> {
        sum_money(self.lines.iter().map(|l| l.tax))
    }

    pub fn total_cost(&self) -> DomainResult<Decimal> {
        sum_money(self.lines.iter().map(|l| l.cost_basis))
    }

    pub fn total_profit(&self) -> DomainResult<Decimal> {
        sum_money(self.lines.iter().map(|l| l.profit))
    }
}

/// Earliest-expiry-first allocation over the batch store.
#[derive(Debug)]
pub struct StockAllocator<S> {
    shared: Shared<S>,
}

impl<S> Clone for StockAllocator<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: LedgerStore> StockAllocator<S> {
    pub fn new(store: Arc<S>, settings: Arc<ServiceSettings>) -> Self {
        Self {
            shared: Shared::new(store, settings),
        }
    }

    pub(crate) fn from_shared(shared: Shared<S>) -> Self {
        Self { shared }
    }

    /// Plan a FEFO draw without touching stock.
    pub async fn allocate(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        quantity: i64,
    ) -> DomainResult<AllocationPlan> {
        if self
            .shared
            .store
            .get_product(ctx.tenant_id, product_id)
            .await?
            .is_none()
        {
            return Err(DomainError::not_found("product", product_id));
        }
        let batches = self
            .shared
            .store
            .list_batches(ctx.tenant_id, Some(product_id))
            .await?;
        plan_fefo(product_id, &batches, quantity)
    }

    /// Debit a previously computed plan as a sale.
    #[instrument(
        skip(self, ctx, plan),
        fields(tenant_id = %ctx.tenant_id, product_id = %plan.product_id, quantity = plan.total_quantity()),
        err
    )]
    pub async fn commit(
        &self,
        ctx: &OperationContext,
        plan: &AllocationPlan,
        sale_id: Option<SaleId>,
    ) -> DomainResult<Vec<StockMovement>> {
        with_retry(&self.shared.settings.retry, "allocator.commit", || {
            self.try_commit(ctx, plan, sale_id)
        })
        .await
    }

    async fn try_commit(
        &self,
        ctx: &OperationContext,
        plan: &AllocationPlan,
        sale_id: Option<SaleId>,
    ) -> DomainResult<Vec<StockMovement>> {
        self.shared
            .timed("allocator.commit", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = debit_in_tx(
                    tx.as_mut(),
                    ctx,
                    plan.product_id,
                    &plan.debits(),
                    MovementReason::Sale,
                    sale_id.map(MovementReference::Sale),
                )
                .await;
                finish(tx, result).await
            })
            .await
    }

    /// Sell several products at once: every line is planned against locked
    /// batches and debited, all lines commit or none do.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id, lines = request.lines.len()), err)]
    pub async fn checkout(
        &self,
        ctx: &OperationContext,
        request: CheckoutRequest,
    ) -> DomainResult<Checkout> {
        let sale_id = request.sale_id.unwrap_or_else(SaleId::new);
        let checkout = with_retry(&self.shared.settings.retry, "allocator.checkout", || {
            self.try_checkout(ctx, sale_id, &request.lines)
        })
        .await?;
        info!(
            sale_id = %checkout.sale_id,
            revenue = %checkout.total_revenue()?,
            cost = %checkout.total_cost()?,
            "checkout settled"
        );
        Ok(checkout)
    }

    async fn try_checkout(
        &self,
        ctx: &OperationContext,
        sale_id: SaleId,
        lines: &[CheckoutLine],
    ) -> DomainResult<Checkout> {
        self.shared
            .timed("allocator.checkout", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = checkout_in_tx(tx.as_mut(), ctx, sale_id, lines).await;
                finish(tx, result).await
            })
            .await
    }
}

async fn checkout_in_tx(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    sale_id: SaleId,
    lines: &[CheckoutLine],
) -> DomainResult<Checkout> {
    if lines.is_empty() {
        return Err(DomainError::validation("checkout has no lines"));
    }

    let mut settlements = Vec::with_capacity(lines.len());
    for line in lines {
        let product = require_product(tx, line.product_id).await?;
        if !product.is_sellable() {
            return Err(DomainError::validation(format!(
                "product {} is inactive",
                product.id
            )));
        }
        let batches = tx.lock_batches(line.product_id).await?;
        let plan = plan_fefo(line.product_id, &batches, line.quantity)?;
        debit_in_tx(
            tx,
            ctx,
            line.product_id,
            &plan.debits(),
            MovementReason::Sale,
            Some(MovementReference::Sale(sale_id)),
        )
        .await?;
        settlements.push(Settlement::price(&product, plan, line.unit_price)?);
    }

    let checkout = Checkout {
        sale_id,
        lines: settlements,
    };
    // Totals must fit before the debits commit.
    checkout.total_revenue()?;
    checkout.total_tax()?;
    checkout.total_cost()?;
    checkout.total_profit()?;
    Ok(checkout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;
    use rxledger_core::TenantId;
    use rxledger_products::PricingPolicy;

    fn product(tax_rate: Decimal) -> Product {
        Product {
            id: ProductId::new(),
            tenant_id: TenantId::new(),
            name: "Salbutamol inhaler".to_string(),
            manufacturer: None,
            category: None,
            tax_rate,
            low_stock_threshold: 5,
            pricing: PricingPolicy::default(),
            active: true,
            created_at: Utc::now(),
        }
    }

    fn line(quantity: i64, cost: Decimal, selling: Decimal) -> AllocationLine {
        AllocationLine {
            batch_id: BatchId::new(),
            quantity,
            cost_price: cost,
            selling_price: selling,
            expiry_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
        }
    }

    #[test]
    fn settlement_uses_batch_prices_by_default() {
        let product = product(dec!(10));
        let plan = AllocationPlan {
            product_id: product.id,
            lines: vec![line(20, dec!(2.00), dec!(3.00)), line(10, dec!(3.00), dec!(4.50))],
        };
        let s = Settlement::price(&product, plan, None).unwrap();
        assert_eq!(s.quantity, 30);
        assert_eq!(s.cost_basis, dec!(70.00));
        assert_eq!(s.revenue, dec!(105.00));
        assert_eq!(s.tax, dec!(10.50));
        assert_eq!(s.profit, dec!(35.00));
        assert_eq!(s.returnable().len(), 2);
    }

    #[test]
    fn unit_price_override_replaces_revenue() {
        let product = product(Decimal::ZERO);
        let plan = AllocationPlan {
            product_id: product.id,
            lines: vec![line(4, dec!(2.50), dec!(3.00))],
        };
        let s = Settlement::price(&product, plan.clone(), Some(dec!(2.00))).unwrap();
        assert_eq!(s.revenue, dec!(8.00));
        assert_eq!(s.profit, dec!(-2.00));

        assert!(matches!(
            Settlement::price(&product, plan, Some(dec!(-1))),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn settlement_that_does_not_fit_is_a_validation_error() {
        let product = product(dec!(10));
        let plan = AllocationPlan {
            product_id: product.id,
            lines: vec![line(i64::MAX, Decimal::MAX, Decimal::MAX)],
        };
        assert!(matches!(
            Settlement::price(&product, plan, None),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn checkout_totals_report_overflow() {
        let product = product(Decimal::ZERO);
        let plan = AllocationPlan {
            product_id: product.id,
            lines: vec![line(1, Decimal::ZERO, Decimal::MAX)],
        };
        let settled = Settlement::price(&product, plan, None).unwrap();
        let checkout = Checkout {
            sale_id: SaleId::new(),
            lines: vec![settled.clone(), settled],
        };
        assert!(checkout.total_revenue().is_err());
        assert!(checkout.total_cost().is_ok());
    }
}
