use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use rxledger_core::{
    Aggregate, AggregateRoot, DomainError, ProductId, PurchaseOrderId, SupplierId, TenantId,
    UserId,
};
use rxledger_events::Event;

use crate::item::{OrderTotals, PurchaseOrderItem, ResolvedItem, number_items};

/// Purchase order status lifecycle.
///
/// `pending → ordered → partially_received → received`, with `cancelled`
/// reachable from `pending` and `ordered`. `received` and `cancelled` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Pending,
    Ordered,
    PartiallyReceived,
    Received,
    Cancelled,
}

impl PurchaseOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseOrderStatus::Pending => "pending",
            PurchaseOrderStatus::Ordered => "ordered",
            PurchaseOrderStatus::PartiallyReceived => "partially_received",
            PurchaseOrderStatus::Received => "received",
            PurchaseOrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(PurchaseOrderStatus::Pending),
            "ordered" => Ok(PurchaseOrderStatus::Ordered),
            "partially_received" => Ok(PurchaseOrderStatus::PartiallyReceived),
            "received" => Ok(PurchaseOrderStatus::Received),
            "cancelled" => Ok(PurchaseOrderStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown purchase order status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Received | PurchaseOrderStatus::Cancelled
        )
    }
}

impl core::fmt::Display for PurchaseOrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: PurchaseOrder.
///
/// Stored as a snapshot of this struct next to its event history; the two
/// must agree (`version` equals the number of events).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    tenant_id: Option<TenantId>,
    supplier_id: Option<SupplierId>,
    status: PurchaseOrderStatus,
    items: Vec<PurchaseOrderItem>,
    totals: OrderTotals,
    expected_delivery: Option<NaiveDate>,
    completed_at: Option<DateTime<Utc>>,
    created_by: Option<UserId>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            tenant_id: None,
            supplier_id: None,
            status: PurchaseOrderStatus::Pending,
            items: Vec::new(),
            totals: OrderTotals {
                subtotal: Decimal::ZERO,
                tax_percent: Decimal::ZERO,
                tax: Decimal::ZERO,
                discount: Decimal::ZERO,
                total: Decimal::ZERO,
            },
            expected_delivery: None,
            completed_at: None,
            created_by: None,
            created_at: None,
            updated_at: None,
            version: 0,
            created: false,
        }
    }

    /// Rebuild state by applying a stored event history in order.
    pub fn rehydrate<'a>(
        id: PurchaseOrderId,
        events: impl IntoIterator<Item = &'a PurchaseOrderEvent>,
    ) -> Self {
        let mut order = Self::empty(id);
        for event in events {
            order.apply(event);
        }
        order
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.supplier_id
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn items(&self) -> &[PurchaseOrderItem] {
        &self.items
    }

    pub fn item(&self, line_no: u32) -> Option<&PurchaseOrderItem> {
        self.items.iter().find(|i| i.line_no == line_no)
    }

    pub fn totals(&self) -> &OrderTotals {
        &self.totals
    }

    pub fn expected_delivery(&self) -> Option<NaiveDate> {
        self.expected_delivery
    }

    /// Set when the last outstanding unit is received.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn total_ordered(&self) -> i64 {
        self.items
            .iter()
            .fold(0i64, |acc, i| acc.saturating_add(i.quantity))
    }

    pub fn total_received(&self) -> i64 {
        self.items
            .iter()
            .fold(0i64, |acc, i| acc.saturating_add(i.received_quantity))
    }

    pub fn is_fully_received(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(PurchaseOrderItem::is_complete)
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Header fields shared by create and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTerms {
    pub supplier_id: Option<SupplierId>,
    pub tax_percent: Decimal,
    pub discount: Decimal,
    pub expected_delivery: Option<NaiveDate>,
}

/// Command: CreatePurchaseOrder. Items are already resolved to catalog ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchaseOrder {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub items: Vec<ResolvedItem>,
    pub terms: OrderTerms,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdatePurchaseOrder (only while pending). Replaces all items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePurchaseOrder {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub items: Vec<ResolvedItem>,
    pub terms: OrderTerms,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkOrdered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOrdered {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// One delivered line in a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub line_no: u32,
    pub quantity: i64,
    pub expiry_date: NaiveDate,
    #[serde(default)]
    pub batch_number: Option<String>,
    #[serde(default)]
    pub selling_price: Option<Decimal>,
}

impl ReceiptLine {
    pub fn new(line_no: u32, quantity: i64, expiry_date: NaiveDate) -> Self {
        Self {
            line_no,
            quantity,
            expiry_date,
            batch_number: None,
            selling_price: None,
        }
    }

    pub fn with_batch_number(mut self, batch_number: impl Into<String>) -> Self {
        self.batch_number = Some(batch_number.into());
        self
    }

    pub fn with_selling_price(mut self, price: Decimal) -> Self {
        self.selling_price = Some(price);
        self
    }
}

/// Command: ReceiveGoods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveGoods {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub lines: Vec<ReceiptLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreatePurchaseOrder(CreatePurchaseOrder),
    UpdatePurchaseOrder(UpdatePurchaseOrder),
    MarkOrdered(MarkOrdered),
    ReceiveGoods(ReceiveGoods),
    Cancel(Cancel),
}

/// Event: PurchaseOrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCreated {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub supplier_id: Option<SupplierId>,
    pub items: Vec<PurchaseOrderItem>,
    pub totals: OrderTotals,
    pub expected_delivery: Option<NaiveDate>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderUpdated {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub supplier_id: Option<SupplierId>,
    pub items: Vec<PurchaseOrderItem>,
    pub totals: OrderTotals,
    pub expected_delivery: Option<NaiveDate>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderMarkedOrdered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderMarkedOrdered {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// A receipt line after validation, with everything needed to credit stock.
///
/// `selling_price` is `None` when neither the receipt nor the order item
/// named one; the receiving service then derives it from the product's
/// pricing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub selling_price: Option<Decimal>,
    pub batch_number: String,
    pub expiry_date: NaiveDate,
}

/// Event: GoodsReceived.
///
/// Carries the product, lot and cost information the receiving service
/// credits to inventory in the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsReceived {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub supplier_id: Option<SupplierId>,
    pub lines: Vec<ReceivedLine>,
    /// Every line is complete after this receipt.
    pub completed: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCancelled {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    PurchaseOrderCreated(PurchaseOrderCreated),
    PurchaseOrderUpdated(PurchaseOrderUpdated),
    PurchaseOrderMarkedOrdered(PurchaseOrderMarkedOrdered),
    GoodsReceived(GoodsReceived),
    PurchaseOrderCancelled(PurchaseOrderCancelled),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(_) => "purchasing.order.created",
            PurchaseOrderEvent::PurchaseOrderUpdated(_) => "purchasing.order.updated",
            PurchaseOrderEvent::PurchaseOrderMarkedOrdered(_) => "purchasing.order.ordered",
            PurchaseOrderEvent::GoodsReceived(_) => "purchasing.order.goods_received",
            PurchaseOrderEvent::PurchaseOrderCancelled(_) => "purchasing.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderUpdated(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderMarkedOrdered(e) => e.occurred_at,
            PurchaseOrderEvent::GoodsReceived(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => {
                self.id = e.order_id;
                self.tenant_id = Some(e.tenant_id);
                self.supplier_id = e.supplier_id;
                self.status = PurchaseOrderStatus::Pending;
                self.items = e.items.clone();
                self.totals = e.totals;
                self.expected_delivery = e.expected_delivery;
                self.created_by = Some(e.created_by);
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            PurchaseOrderEvent::PurchaseOrderUpdated(e) => {
                self.supplier_id = e.supplier_id;
                self.items = e.items.clone();
                self.totals = e.totals;
                self.expected_delivery = e.expected_delivery;
            }
            PurchaseOrderEvent::PurchaseOrderMarkedOrdered(_) => {
                self.status = PurchaseOrderStatus::Ordered;
            }
            PurchaseOrderEvent::GoodsReceived(e) => {
                for line in &e.lines {
                    if let Some(item) = self.items.iter_mut().find(|i| i.line_no == line.line_no) {
                        item.received_quantity += line.quantity;
                    }
                }
                if e.completed {
                    self.status = PurchaseOrderStatus::Received;
                    self.completed_at = Some(e.occurred_at);
                } else {
                    self.status = PurchaseOrderStatus::PartiallyReceived;
                }
            }
            PurchaseOrderEvent::PurchaseOrderCancelled(_) => {
                self.status = PurchaseOrderStatus::Cancelled;
            }
        }

        self.updated_at = Some(event.occurred_at());
        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreatePurchaseOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::UpdatePurchaseOrder(cmd) => self.handle_update(cmd),
            PurchaseOrderCommand::MarkOrdered(cmd) => self.handle_mark_ordered(cmd),
            PurchaseOrderCommand::ReceiveGoods(cmd) => self.handle_receive(cmd),
            PurchaseOrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl PurchaseOrder {
    fn ensure_exists(&self, tenant_id: TenantId, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        if !self.created || self.id != order_id {
            return Err(DomainError::not_found("purchase order", order_id));
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::TenantIsolation(format!(
                "purchase order {order_id} belongs to another tenant"
            )));
        }
        Ok(())
    }

    fn transition_error(&self, action: &'static str) -> DomainError {
        DomainError::InvalidTransition {
            order_id: self.id,
            from: self.status.as_str().to_string(),
            action,
        }
    }

    fn handle_create(
        &self,
        cmd: &CreatePurchaseOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict(format!(
                "purchase order {} already exists",
                cmd.order_id
            )));
        }

        let items = number_items(&cmd.items)?;
        let totals = OrderTotals::compute(&items, cmd.terms.tax_percent, cmd.terms.discount)?;

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCreated(
            PurchaseOrderCreated {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                supplier_id: cmd.terms.supplier_id,
                items,
                totals,
                expected_delivery: cmd.terms.expected_delivery,
                created_by: cmd.actor,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_update(
        &self,
        cmd: &UpdatePurchaseOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        if self.status != PurchaseOrderStatus::Pending {
            return Err(self.transition_error("update"));
        }

        let items = number_items(&cmd.items)?;
        let totals = OrderTotals::compute(&items, cmd.terms.tax_percent, cmd.terms.discount)?;

        Ok(vec![PurchaseOrderEvent::PurchaseOrderUpdated(
            PurchaseOrderUpdated {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                supplier_id: cmd.terms.supplier_id,
                items,
                totals,
                expected_delivery: cmd.terms.expected_delivery,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_mark_ordered(
        &self,
        cmd: &MarkOrdered,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        if self.status != PurchaseOrderStatus::Pending {
            return Err(self.transition_error("mark as ordered"));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderMarkedOrdered(
            PurchaseOrderMarkedOrdered {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_receive(
        &self,
        cmd: &ReceiveGoods,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        let from_pending = match self.status {
            PurchaseOrderStatus::Pending => true,
            PurchaseOrderStatus::Ordered | PurchaseOrderStatus::PartiallyReceived => false,
            PurchaseOrderStatus::Received | PurchaseOrderStatus::Cancelled => {
                return Err(self.transition_error("receive"));
            }
        };

        if cmd.lines.is_empty() {
            return Err(DomainError::validation("receipt has no lines"));
        }

        // Running received quantity per line, so a receipt naming the same
        // line twice is checked against the sum.
        let mut received: Vec<i64> = self.items.iter().map(|i| i.received_quantity).collect();
        let mut lines = Vec::with_capacity(cmd.lines.len());

        for line in &cmd.lines {
            if line.quantity <= 0 {
                return Err(DomainError::invalid_quantity(
                    line.quantity,
                    format!("receipt quantity for line {} must be positive", line.line_no),
                ));
            }
            let Some(idx) = self.items.iter().position(|i| i.line_no == line.line_no) else {
                return Err(DomainError::invalid_item(format!(
                    "purchase order {} has no line {}",
                    self.id, line.line_no
                )));
            };
            let item = &self.items[idx];
            received[idx] = match received[idx].checked_add(line.quantity) {
                Some(total) if total <= item.quantity => total,
                _ => {
                    return Err(DomainError::OverReceipt {
                        order_id: self.id,
                        line_no: item.line_no,
                        ordered: item.quantity,
                        already_received: received[idx],
                        attempted: line.quantity,
                    });
                }
            };

            let batch_number = match line.batch_number.as_deref().map(str::trim) {
                Some(n) if !n.is_empty() => n.to_string(),
                _ => default_batch_number(self.id, item.line_no, line.expiry_date),
            };
            lines.push(ReceivedLine {
                line_no: item.line_no,
                product_id: item.product_id,
                quantity: line.quantity,
                unit_cost: item.unit_cost,
                selling_price: line.selling_price.or(item.selling_price),
                batch_number,
                expiry_date: line.expiry_date,
            });
        }

        let completed = self
            .items
            .iter()
            .zip(&received)
            .all(|(item, r)| *r >= item.quantity);
        if from_pending && !completed {
            return Err(self.transition_error("partially receive"));
        }

        Ok(vec![PurchaseOrderEvent::GoodsReceived(GoodsReceived {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            supplier_id: self.supplier_id,
            lines,
            completed,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &Cancel) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        if !matches!(
            self.status,
            PurchaseOrderStatus::Pending | PurchaseOrderStatus::Ordered
        ) {
            return Err(self.transition_error("cancel"));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCancelled(
            PurchaseOrderCancelled {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}

/// Synthetic lot key used when a receipt does not carry the supplier's batch number.
///
/// The expiry is part of the key: deliveries of one line with different dates
/// are different lots.
pub fn default_batch_number(
    order_id: PurchaseOrderId,
    line_no: u32,
    expiry: NaiveDate,
) -> String {
    format!("{order_id}-{line_no}-{}", expiry.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use rxledger_events::execute;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn expiry() -> NaiveDate {
        test_time().date_naive() + Duration::days(365)
    }

    fn terms() -> OrderTerms {
        OrderTerms {
            supplier_id: Some(SupplierId::new()),
            tax_percent: dec!(10),
            discount: Decimal::ZERO,
            expected_delivery: None,
        }
    }

    fn item(quantity: i64, unit_cost: Decimal) -> ResolvedItem {
        ResolvedItem {
            product_id: ProductId::new(),
            quantity,
            unit_cost,
            selling_price: None,
        }
    }

    fn run(order: &mut PurchaseOrder, cmd: PurchaseOrderCommand) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        execute(order, &cmd)
    }

    fn created(tenant_id: TenantId, items: Vec<ResolvedItem>) -> PurchaseOrder {
        let order_id = PurchaseOrderId::new();
        let mut order = PurchaseOrder::empty(order_id);
        run(
            &mut order,
            PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                tenant_id,
                order_id,
                items,
                terms: terms(),
                actor: UserId::new(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        order
    }

    fn mark_ordered(order: &mut PurchaseOrder, tenant_id: TenantId) -> Vec<PurchaseOrderEvent> {
        let order_id = order.id_typed();
        run(
            order,
            PurchaseOrderCommand::MarkOrdered(MarkOrdered {
                tenant_id,
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap()
    }

    fn receive(
        order: &mut PurchaseOrder,
        tenant_id: TenantId,
        lines: Vec<ReceiptLine>,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        let order_id = order.id_typed();
        run(
            order,
            PurchaseOrderCommand::ReceiveGoods(ReceiveGoods {
                tenant_id,
                order_id,
                lines,
                occurred_at: test_time(),
            }),
        )
    }

    fn cancel(order: &mut PurchaseOrder, tenant_id: TenantId) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        let order_id = order.id_typed();
        run(
            order,
            PurchaseOrderCommand::Cancel(Cancel {
                tenant_id,
                order_id,
                reason: None,
                occurred_at: test_time(),
            }),
        )
    }

    #[test]
    fn create_computes_totals_and_starts_pending() {
        let tenant_id = TenantId::new();
        let order = created(tenant_id, vec![item(100, dec!(5.00))]);

        assert_eq!(order.status(), PurchaseOrderStatus::Pending);
        assert_eq!(order.totals().subtotal, dec!(500.00));
        assert_eq!(order.totals().tax, dec!(50.00));
        assert_eq!(order.totals().total, dec!(550.00));
        assert_eq!(order.items()[0].line_no, 1);
        assert_eq!(order.version(), 1);
    }

    #[test]
    fn create_twice_is_a_conflict() {
        let tenant_id = TenantId::new();
        let order = created(tenant_id, vec![item(1, dec!(1))]);
        let err = order
            .handle(&PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                tenant_id,
                order_id: order.id_typed(),
                items: vec![item(1, dec!(1))],
                terms: terms(),
                actor: UserId::new(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn full_receipt_after_ordering_completes_the_order() {
        let tenant_id = TenantId::new();
        let mut order = created(tenant_id, vec![item(100, dec!(5.00))]);
        mark_ordered(&mut order, tenant_id);

        let events = receive(&mut order, tenant_id, vec![ReceiptLine::new(1, 100, expiry())]).unwrap();
        match &events[0] {
            PurchaseOrderEvent::GoodsReceived(e) => {
                assert!(e.completed);
                assert_eq!(e.lines[0].unit_cost, dec!(5.00));
                assert_eq!(
                    e.lines[0].batch_number,
                    default_batch_number(order.id_typed(), 1, expiry())
                );
            }
            other => panic!("expected GoodsReceived, got {other:?}"),
        }
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
        assert!(order.completed_at().is_some());
        assert_eq!(order.total_received(), order.total_ordered());
    }

    #[test]
    fn partial_then_final_receipt() {
        let tenant_id = TenantId::new();
        let mut order = created(tenant_id, vec![item(100, dec!(5.00))]);
        mark_ordered(&mut order, tenant_id);

        receive(&mut order, tenant_id, vec![ReceiptLine::new(1, 60, expiry())]).unwrap();
        assert_eq!(order.status(), PurchaseOrderStatus::PartiallyReceived);
        assert!(order.completed_at().is_none());

        receive(&mut order, tenant_id, vec![ReceiptLine::new(1, 40, expiry())]).unwrap();
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
        assert_eq!(order.items()[0].received_quantity, 100);

        let err = receive(&mut order, tenant_id, vec![ReceiptLine::new(1, 1, expiry())]).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { action: "receive", .. }));
    }

    #[test]
    fn over_receipt_reports_line_numbers() {
        let tenant_id = TenantId::new();
        let mut order = created(tenant_id, vec![item(10, dec!(1.00))]);
        mark_ordered(&mut order, tenant_id);
        receive(&mut order, tenant_id, vec![ReceiptLine::new(1, 7, expiry())]).unwrap();

        let err = receive(
            &mut order,
            tenant_id,
            vec![ReceiptLine::new(1, 2, expiry()), ReceiptLine::new(1, 2, expiry())],
        )
        .unwrap_err();
        assert_eq!(
            err,
            DomainError::OverReceipt {
                order_id: order.id_typed(),
                line_no: 1,
                ordered: 10,
                already_received: 9,
                attempted: 2,
            }
        );
        assert_eq!(order.items()[0].received_quantity, 7);
    }

    #[test]
    fn huge_receipt_quantity_is_an_over_receipt() {
        let tenant_id = TenantId::new();
        let mut order = created(tenant_id, vec![item(10, dec!(1.00))]);
        mark_ordered(&mut order, tenant_id);
        receive(&mut order, tenant_id, vec![ReceiptLine::new(1, 3, expiry())]).unwrap();

        let err = receive(&mut order, tenant_id, vec![ReceiptLine::new(1, i64::MAX, expiry())])
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::OverReceipt { already_received: 3, attempted: i64::MAX, .. }
        ));
        assert_eq!(order.items()[0].received_quantity, 3);
    }

    #[test]
    fn unknown_line_and_bad_quantity_are_rejected() {
        let tenant_id = TenantId::new();
        let mut order = created(tenant_id, vec![item(10, dec!(1.00))]);
        mark_ordered(&mut order, tenant_id);

        assert!(matches!(
            receive(&mut order, tenant_id, vec![ReceiptLine::new(2, 1, expiry())]),
            Err(DomainError::InvalidItem(_))
        ));
        assert!(matches!(
            receive(&mut order, tenant_id, vec![ReceiptLine::new(1, 0, expiry())]),
            Err(DomainError::InvalidQuantity { .. })
        ));
        assert_eq!(order.version(), 2);
    }

    #[test]
    fn pending_order_can_only_be_received_in_full() {
        let tenant_id = TenantId::new();
        let mut order = created(tenant_id, vec![item(10, dec!(1.00)), item(5, dec!(2.00))]);

        let err = receive(&mut order, tenant_id, vec![ReceiptLine::new(1, 10, expiry())]).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        assert_eq!(order.status(), PurchaseOrderStatus::Pending);

        receive(
            &mut order,
            tenant_id,
            vec![ReceiptLine::new(1, 10, expiry()), ReceiptLine::new(2, 5, expiry())],
        )
        .unwrap();
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
    }

    #[test]
    fn cancelling_twice_is_an_invalid_transition() {
        let tenant_id = TenantId::new();
        let mut order = created(tenant_id, vec![item(10, dec!(1.00))]);
        mark_ordered(&mut order, tenant_id);

        cancel(&mut order, tenant_id).unwrap();
        assert_eq!(order.status(), PurchaseOrderStatus::Cancelled);
        let version = order.version();

        let err = cancel(&mut order, tenant_id).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                order_id: order.id_typed(),
                from: "cancelled".into(),
                action: "cancel",
            }
        );
        assert_eq!(order.version(), version);
    }

    #[test]
    fn partially_received_order_cannot_be_cancelled() {
        let tenant_id = TenantId::new();
        let mut order = created(tenant_id, vec![item(10, dec!(1.00))]);
        mark_ordered(&mut order, tenant_id);
        receive(&mut order, tenant_id, vec![ReceiptLine::new(1, 3, expiry())]).unwrap();

        assert!(matches!(
            cancel(&mut order, tenant_id),
            Err(DomainError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn update_only_while_pending() {
        let tenant_id = TenantId::new();
        let mut order = created(tenant_id, vec![item(10, dec!(1.00))]);
        let order_id = order.id_typed();
        let update = |items| {
            PurchaseOrderCommand::UpdatePurchaseOrder(UpdatePurchaseOrder {
                tenant_id,
                order_id,
                items,
                terms: terms(),
                occurred_at: test_time(),
            })
        };

        run(&mut order, update(vec![item(4, dec!(2.50)), item(1, dec!(1.00))])).unwrap();
        assert_eq!(order.items().len(), 2);
        assert_eq!(order.totals().subtotal, dec!(11.00));
        assert_eq!(order.totals().total, dec!(12.10));

        mark_ordered(&mut order, tenant_id);
        assert!(matches!(
            run(&mut order, update(vec![item(1, dec!(1.00))])),
            Err(DomainError::InvalidTransition { action: "update", .. })
        ));
    }

    #[test]
    fn other_tenant_cannot_touch_the_order() {
        let tenant_id = TenantId::new();
        let mut order = created(tenant_id, vec![item(10, dec!(1.00))]);
        assert!(matches!(
            cancel(&mut order, TenantId::new()),
            Err(DomainError::TenantIsolation(_))
        ));
    }

    #[test]
    fn receipt_prefers_explicit_batch_number_and_price() {
        let tenant_id = TenantId::new();
        let mut order = created(
            tenant_id,
            vec![ResolvedItem {
                selling_price: Some(dec!(9.99)),
                ..item(10, dec!(1.00))
            }],
        );
        mark_ordered(&mut order, tenant_id);

        let events = receive(
            &mut order,
            tenant_id,
            vec![
                ReceiptLine::new(1, 4, expiry()).with_batch_number("LOT-77"),
                ReceiptLine::new(1, 1, expiry()).with_selling_price(dec!(12.00)),
            ],
        )
        .unwrap();
        let PurchaseOrderEvent::GoodsReceived(e) = &events[0] else {
            panic!("expected GoodsReceived");
        };
        assert_eq!(e.lines[0].batch_number, "LOT-77");
        assert_eq!(e.lines[0].selling_price, Some(dec!(9.99)));
        assert_eq!(e.lines[1].selling_price, Some(dec!(12.00)));
    }

    #[test]
    fn rehydrate_matches_live_state() {
        let tenant_id = TenantId::new();
        let order_id = PurchaseOrderId::new();
        let mut order = PurchaseOrder::empty(order_id);
        let mut history = run(
            &mut order,
            PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                tenant_id,
                order_id,
                items: vec![item(5, dec!(1.00))],
                terms: terms(),
                actor: UserId::new(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        history.extend(mark_ordered(&mut order, tenant_id));
        history.extend(receive(&mut order, tenant_id, vec![ReceiptLine::new(1, 2, expiry())]).unwrap());

        assert_eq!(PurchaseOrder::rehydrate(order_id, &history), order);
    }

    #[test]
    fn status_names_round_trip() {
        for status in [
            PurchaseOrderStatus::Pending,
            PurchaseOrderStatus::Ordered,
            PurchaseOrderStatus::PartiallyReceived,
            PurchaseOrderStatus::Received,
            PurchaseOrderStatus::Cancelled,
        ] {
            assert_eq!(PurchaseOrderStatus::parse(status.as_str()).unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(status.as_str().to_string())
            );
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: received never exceeds ordered, and the order is
        /// `received` exactly when every line is complete.
        #[test]
        fn received_never_exceeds_ordered(
            ordered in prop::collection::vec(1i64..50, 1..4),
            attempts in prop::collection::vec((0usize..4, 1i64..30), 0..20)
        ) {
            let tenant_id = TenantId::new();
            let mut order = created(
                tenant_id,
                ordered.iter().map(|q| item(*q, dec!(1.00))).collect(),
            );
            mark_ordered(&mut order, tenant_id);

            for (idx, qty) in attempts {
                let line_no = (idx % ordered.len()) as u32 + 1;
                let _ = receive(&mut order, tenant_id, vec![ReceiptLine::new(line_no, qty, expiry())]);

                for i in order.items() {
                    prop_assert!(i.received_quantity <= i.quantity);
                }
                prop_assert!(order.total_received() <= order.total_ordered());
                prop_assert_eq!(
                    order.status() == PurchaseOrderStatus::Received,
                    order.total_received() == order.total_ordered()
                );
            }
        }
    }
}
