//! Domain error model.

use chrono::NaiveDate;
use thiserror::Error;

use crate::id::{BatchId, ProductId, PurchaseOrderId};

/// Result type used across the ledger.
pub type DomainResult<T> = Result<T, DomainError>;

/// Ledger error.
///
/// Every variant is a recoverable, typed outcome for the caller. Only
/// `TransactionConflict` is retried internally (see `rxledger_infra::retry`);
/// everything else is surfaced as-is with enough detail to render a precise
/// message (offending id, requested vs. available quantity).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A quantity was zero/negative where a positive amount is required.
    #[error("invalid quantity {quantity}: {reason}")]
    InvalidQuantity { quantity: i64, reason: String },

    /// A new batch was credited with an expiry date already in the past.
    #[error("expiry date {expiry} is before {today}")]
    InvalidExpiry { expiry: NaiveDate, today: NaiveDate },

    /// A batch id does not exist or belongs to a different product.
    #[error("batch {batch_id} does not belong to product {product_id}")]
    UnknownBatch {
        product_id: ProductId,
        batch_id: BatchId,
    },

    /// Not enough stock to satisfy a debit or allocation.
    ///
    /// `batch_id` is set when a single named batch was overdrawn; it is `None`
    /// when the shortfall is across all of the product's batches.
    #[error(
        "insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        batch_id: Option<BatchId>,
        requested: i64,
        available: i64,
    },

    /// A receipt line would push an item's received quantity past what was ordered.
    #[error(
        "over-receipt on line {line_no} of purchase order {order_id}: ordered {ordered}, already received {already_received}, attempted {attempted}"
    )]
    OverReceipt {
        order_id: PurchaseOrderId,
        line_no: u32,
        ordered: i64,
        already_received: i64,
        attempted: i64,
    },

    /// The purchase order's current status does not allow the requested action.
    #[error("cannot {action} purchase order {order_id} in status {from}")]
    InvalidTransition {
        order_id: PurchaseOrderId,
        from: String,
        action: &'static str,
    },

    /// A purchase order item is malformed or references an unusable product.
    #[error("invalid purchase order item: {0}")]
    InvalidItem(String),

    /// A referenced record does not exist in the caller's organization scope.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Serialization failure under concurrent access; the caller may retry.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A uniqueness rule was violated (e.g. duplicate batch number on import).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A record from another organization scope was addressed.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// The transaction did not finish within the configured timeout and was rolled back.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    /// The backing store failed for a reason unrelated to the request.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_item(msg: impl Into<String>) -> Self {
        Self::InvalidItem(msg.into())
    }

    pub fn invalid_quantity(quantity: i64, reason: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            quantity,
            reason: reason.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transaction_conflict(msg: impl Into<String>) -> Self {
        Self::TransactionConflict(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl core::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the failure is transient and the whole operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransactionConflict(_))
    }

    /// Units missing for an `InsufficientStock` failure.
    pub fn shortfall(&self) -> Option<i64> {
        match self {
            Self::InsufficientStock {
                requested,
                available,
                ..
            } => Some(requested - available),
            _ => None,
        }
    }
}
