use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rxledger_core::{
    BatchId, DomainError, DomainResult, OperationContext, ProductId, PurchaseOrderId, SaleId,
    TenantId, UserId,
};

/// Why a batch quantity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementReason {
    PurchaseReceive,
    Sale,
    Return,
    Adjustment,
}

impl MovementReason {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementReason::PurchaseReceive => "purchase_receive",
            MovementReason::Sale => "sale",
            MovementReason::Return => "return",
            MovementReason::Adjustment => "adjustment",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "purchase_receive" => Ok(MovementReason::PurchaseReceive),
            "sale" => Ok(MovementReason::Sale),
            "return" => Ok(MovementReason::Return),
            "adjustment" => Ok(MovementReason::Adjustment),
            other => Err(DomainError::validation(format!("unknown movement reason '{other}'"))),
        }
    }

    /// Sign rule: receipts and returns add stock, sales remove it,
    /// adjustments go either way.
    fn check_delta(self, delta: i64) -> DomainResult<()> {
        let ok = match self {
            MovementReason::PurchaseReceive | MovementReason::Return => delta > 0,
            MovementReason::Sale => delta < 0,
            MovementReason::Adjustment => delta != 0,
        };
        if ok {
            Ok(())
        } else {
            Err(DomainError::invalid_quantity(
                delta,
                format!("delta sign not allowed for {} movement", self.as_str()),
            ))
        }
    }
}

/// Document that caused a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MovementReference {
    PurchaseOrder(PurchaseOrderId),
    Sale(SaleId),
}

/// Append-only audit record of one quantity change to one batch.
///
/// `sequence` is assigned by the store when the movement is written and is
/// strictly increasing in commit order within a tenant; it is `0` until then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub movement_id: Uuid,
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub batch_id: BatchId,
    pub delta: i64,
    pub reason: MovementReason,
    pub reference: Option<MovementReference>,
    pub note: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
    pub sequence: u64,
}

impl StockMovement {
    pub fn new(
        ctx: &OperationContext,
        product_id: ProductId,
        batch_id: BatchId,
        delta: i64,
        reason: MovementReason,
        reference: Option<MovementReference>,
    ) -> DomainResult<Self> {
        reason.check_delta(delta)?;
        Ok(Self {
            movement_id: Uuid::now_v7(),
            tenant_id: ctx.tenant_id,
            product_id,
            batch_id,
            delta,
            reason,
            reference,
            note: None,
            actor: ctx.actor,
            occurred_at: ctx.occurred_at,
            sequence: 0,
        })
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Replay movements into per-batch quantities.
///
/// Movements are applied in `sequence` order regardless of input order.
pub fn replay<'a>(movements: impl IntoIterator<Item = &'a StockMovement>) -> BTreeMap<BatchId, i64> {
    let mut sorted: Vec<&StockMovement> = movements.into_iter().collect();
    sorted.sort_by_key(|m| m.sequence);

    let mut quantities = BTreeMap::new();
    for m in sorted {
        *quantities.entry(m.batch_id).or_insert(0) += m.delta;
    }
    quantities
}

/// Signed sum of a product's movements.
pub fn replay_product<'a>(
    movements: impl IntoIterator<Item = &'a StockMovement>,
    product_id: ProductId,
) -> i64 {
    movements
        .into_iter()
        .filter(|m| m.product_id == product_id)
        .map(|m| m.delta)
        .sum()
}
