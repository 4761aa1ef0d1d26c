use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use rxledger_core::money::{line_amount, percent_of, round_money, sum_money};
use rxledger_core::{DomainError, DomainResult, ProductId};
use rxledger_products::NewProductRequest;

/// Item product reference as it arrives from the caller.
///
/// Exactly one of the two fields is expected; see [`ItemProductInput::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemProductInput {
    #[serde(default)]
    pub product_id: Option<ProductId>,
    #[serde(default)]
    pub new_product: Option<NewProductRequest>,
}

/// Product an order item refers to, before the catalog has been consulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemProduct {
    Existing { product_id: ProductId },
    New { request: NewProductRequest },
}

impl ItemProductInput {
    /// An explicit product id wins over creation data.
    pub fn resolve(self) -> DomainResult<ItemProduct> {
        match (self.product_id, self.new_product) {
            (Some(product_id), _) => Ok(ItemProduct::Existing { product_id }),
            (None, Some(request)) => Ok(ItemProduct::New { request }),
            (None, None) => Err(DomainError::invalid_item(
                "item needs a product id or new product details",
            )),
        }
    }
}

impl From<ProductId> for ItemProductInput {
    fn from(product_id: ProductId) -> Self {
        Self {
            product_id: Some(product_id),
            new_product: None,
        }
    }
}

impl From<NewProductRequest> for ItemProductInput {
    fn from(request: NewProductRequest) -> Self {
        Self {
            product_id: None,
            new_product: Some(request),
        }
    }
}

/// One requested order line, product still unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemInput {
    #[serde(flatten)]
    pub product: ItemProductInput,
    pub quantity: i64,
    pub unit_cost: Decimal,
    #[serde(default)]
    pub selling_price: Option<Decimal>,
}

impl OrderItemInput {
    pub fn new(product: impl Into<ItemProductInput>, quantity: i64, unit_cost: Decimal) -> Self {
        Self {
            product: product.into(),
            quantity,
            unit_cost,
            selling_price: None,
        }
    }

    pub fn with_selling_price(mut self, price: Decimal) -> Self {
        self.selling_price = Some(price);
        self
    }

    /// Check the numeric fields; product resolution happens separately.
    pub fn validate(&self) -> DomainResult<()> {
        validate_line_numbers(self.quantity, self.unit_cost, self.selling_price)
    }
}

/// An order line whose product has been resolved to a catalog id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedItem {
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub selling_price: Option<Decimal>,
}

fn validate_line_numbers(
    quantity: i64,
    unit_cost: Decimal,
    selling_price: Option<Decimal>,
) -> DomainResult<()> {
    if quantity <= 0 {
        return Err(DomainError::invalid_item(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    if unit_cost < Decimal::ZERO {
        return Err(DomainError::invalid_item(format!(
            "unit cost cannot be negative, got {unit_cost}"
        )));
    }
    if selling_price.is_some_and(|p| p < Decimal::ZERO) {
        return Err(DomainError::invalid_item("selling price cannot be negative"));
    }
    Ok(())
}

/// Stored purchase order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderItem {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub selling_price: Option<Decimal>,
    pub received_quantity: i64,
}

impl PurchaseOrderItem {
    pub fn outstanding(&self) -> i64 {
        self.quantity - self.received_quantity
    }

    pub fn is_complete(&self) -> bool {
        self.received_quantity >= self.quantity
    }

    pub fn line_total(&self) -> DomainResult<Decimal> {
        line_amount(self.unit_cost, self.quantity)
    }
}

/// Number resolved items 1..n as fresh, unreceived lines.
pub fn number_items(items: &[ResolvedItem]) -> DomainResult<Vec<PurchaseOrderItem>> {
    if items.is_empty() {
        return Err(DomainError::invalid_item("purchase order needs at least one item"));
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            validate_line_numbers(item.quantity, item.unit_cost, item.selling_price)?;
            Ok(PurchaseOrderItem {
                line_no: i as u32 + 1,
                product_id: item.product_id,
                quantity: item.quantity,
                unit_cost: item.unit_cost,
                selling_price: item.selling_price,
                received_quantity: 0,
            })
        })
        .collect()
}

/// Order money summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub tax_percent: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

impl OrderTotals {
    /// `subtotal = Σ quantity × unit cost`, `tax = subtotal × percent / 100`,
    /// `total = subtotal + tax - discount`.
    pub fn compute(
        items: &[PurchaseOrderItem],
        tax_percent: Decimal,
        discount: Decimal,
    ) -> DomainResult<Self> {
        if tax_percent < Decimal::ZERO {
            return Err(DomainError::validation("tax percent cannot be negative"));
        }
        if discount < Decimal::ZERO {
            return Err(DomainError::validation("discount cannot be negative"));
        }
        let lines = items
            .iter()
            .map(PurchaseOrderItem::line_total)
            .collect::<DomainResult<Vec<_>>>()?;
        let subtotal = sum_money(lines)?;
        let tax = percent_of(subtotal, tax_percent)?;
        let gross = sum_money([subtotal, tax])?;
        let discount = round_money(discount);
        if discount > gross {
            return Err(DomainError::validation(format!(
                "discount {discount} exceeds order amount {gross}"
            )));
        }
        Ok(Self {
            subtotal,
            tax_percent,
            tax,
            discount,
            total: gross - discount,
        })
    }
}
