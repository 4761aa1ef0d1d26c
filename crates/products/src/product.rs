use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use rxledger_core::money::round_money;
use rxledger_core::{DomainError, DomainResult, Entity, ProductId, TenantId};

/// How a selling price is derived when a receipt does not name one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    /// Markup over unit cost, in percent (e.g. `25` means cost × 1.25).
    pub markup_percent: Decimal,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            markup_percent: Decimal::ZERO,
        }
    }
}

impl PricingPolicy {
    pub fn selling_price(&self, unit_cost: Decimal) -> DomainResult<Decimal> {
        Decimal::ONE_HUNDRED
            .checked_add(self.markup_percent)
            .and_then(|factor| unit_cost.checked_mul(factor))
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .map(round_money)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "selling price for cost {unit_cost} is out of range"
                ))
            })
    }
}

/// Catalog entry referenced by inventory batches.
///
/// Products are soft-deleted via `active`; a product is never removed while
/// batches reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub tenant_id: TenantId,
    pub name: String,
    pub manufacturer: Option<String>,
    pub category: Option<String>,
    /// Sales tax rate in percent.
    pub tax_rate: Decimal,
    /// Units on hand below which the product is reported as low stock.
    pub low_stock_threshold: i64,
    pub pricing: PricingPolicy,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Product {
    /// Check if product can be sold or ordered.
    pub fn is_sellable(&self) -> bool {
        self.active
    }

    pub fn is_below_threshold(&self, on_hand: i64, threshold_override: Option<i64>) -> bool {
        on_hand < threshold_override.unwrap_or(self.low_stock_threshold)
    }
}

impl Entity for Product {
    type Id = ProductId;

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

/// Organization-wide defaults for products created on the ledger's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDefaults {
    pub tax_rate: Decimal,
    pub low_stock_threshold: i64,
    pub markup_percent: Decimal,
}

impl Default for CatalogDefaults {
    fn default() -> Self {
        Self {
            tax_rate: Decimal::ZERO,
            low_stock_threshold: 10,
            markup_percent: Decimal::ZERO,
        }
    }
}

/// Data for a product that does not exist yet ("create if missing").
///
/// Purchase-order items may carry this instead of a product id; it is turned
/// into a concrete product once, when the order is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProductRequest {
    pub name: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tax_rate: Option<Decimal>,
    #[serde(default)]
    pub low_stock_threshold: Option<i64>,
    #[serde(default)]
    pub markup_percent: Option<Decimal>,
}

impl NewProductRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manufacturer: None,
            category: None,
            tax_rate: None,
            low_stock_threshold: None,
            markup_percent: None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("product name cannot be empty"));
        }
        if let Some(rate) = self.tax_rate {
            if rate < Decimal::ZERO || rate > Decimal::ONE_HUNDRED {
                return Err(DomainError::validation(format!(
                    "tax rate must be between 0 and 100, got {rate}"
                )));
            }
        }
        if let Some(threshold) = self.low_stock_threshold {
            if threshold < 0 {
                return Err(DomainError::validation("low-stock threshold cannot be negative"));
            }
        }
        if let Some(markup) = self.markup_percent {
            if markup < Decimal::ZERO {
                return Err(DomainError::validation("markup cannot be negative"));
            }
        }
        Ok(())
    }

    /// Materialize the product, filling gaps from `defaults`.
    pub fn into_product(
        self,
        id: ProductId,
        tenant_id: TenantId,
        defaults: &CatalogDefaults,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Product> {
        self.validate()?;
        Ok(Product {
            id,
            tenant_id,
            name: self.name.trim().to_string(),
            manufacturer: self.manufacturer,
            category: self.category,
            tax_rate: self.tax_rate.unwrap_or(defaults.tax_rate),
            low_stock_threshold: self.low_stock_threshold.unwrap_or(defaults.low_stock_threshold),
            pricing: PricingPolicy {
                markup_percent: self.markup_percent.unwrap_or(defaults.markup_percent),
            },
            active: true,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn into_product_fills_defaults() {
        let defaults = CatalogDefaults {
            tax_rate: dec!(5),
            low_stock_threshold: 20,
            markup_percent: dec!(30),
        };
        let product = NewProductRequest::named("  Paracetamol 500mg ")
            .into_product(ProductId::new(), TenantId::new(), &defaults, test_time())
            .unwrap();

        assert_eq!(product.name, "Paracetamol 500mg");
        assert_eq!(product.tax_rate, dec!(5));
        assert_eq!(product.low_stock_threshold, 20);
        assert_eq!(product.pricing.markup_percent, dec!(30));
        assert!(product.active);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let mut req = NewProductRequest::named("Amoxicillin 250mg");
        req.tax_rate = Some(dec!(12));
        req.low_stock_threshold = Some(3);
        let product = req
            .into_product(ProductId::new(), TenantId::new(), &CatalogDefaults::default(), test_time())
            .unwrap();
        assert_eq!(product.tax_rate, dec!(12));
        assert_eq!(product.low_stock_threshold, 3);
    }

    #[test]
    fn rejects_blank_name_and_out_of_range_tax() {
        let err = NewProductRequest::named("   ").validate().unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let mut req = NewProductRequest::named("Ibuprofen");
        req.tax_rate = Some(dec!(101));
        assert!(matches!(req.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn selling_price_applies_markup() {
        let policy = PricingPolicy {
            markup_percent: dec!(25),
        };
        assert_eq!(policy.selling_price(dec!(4.00)).unwrap(), dec!(5.00));
        assert_eq!(PricingPolicy::default().selling_price(dec!(3.33)).unwrap(), dec!(3.33));
        assert!(policy.selling_price(Decimal::MAX).is_err());
    }

    #[test]
    fn threshold_override_wins() {
        let product = NewProductRequest::named("Cetirizine")
            .into_product(ProductId::new(), TenantId::new(), &CatalogDefaults::default(), test_time())
            .unwrap();
        assert!(product.is_below_threshold(9, None));
        assert!(!product.is_below_threshold(10, None));
        assert!(product.is_below_threshold(10, Some(50)));
    }

    #[cfg(test)]
    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 512,
                ..ProptestConfig::default()
            })]

            /// Property: a non-negative markup never prices below cost.
            #[test]
            fn selling_price_never_below_cost(
                cost_cents in 0i64..10_000_000i64,
                markup in 0i64..500i64
            ) {
                let cost = Decimal::new(cost_cents, 2);
                let policy = PricingPolicy { markup_percent: Decimal::from(markup) };
                prop_assert!(policy.selling_price(cost).unwrap() >= cost);
            }
        }
    }
}
