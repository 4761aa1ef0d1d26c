//! `rxledger-core`: domain foundation building blocks.
//!
//! Identifiers, the error taxonomy, caller context and money helpers shared
//! by every ledger crate. No infrastructure concerns.

pub mod aggregate;
pub mod context;
pub mod entity;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use context::OperationContext;
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{BatchId, ProductId, PurchaseOrderId, SaleId, SupplierId, TenantId, UserId};
