//! Batch-level stock for the pharmacy ledger.
//!
//! Deterministic domain logic only: lots and their quantities, the movement
//! audit trail and FEFO allocation planning. Persistence and locking live in
//! `rxledger-infra`.

pub mod allocator;
pub mod batch;
pub mod movement;

pub use allocator::{AllocationLine, AllocationPlan, plan_fefo};
pub use batch::{BatchSpec, InventoryBatch, apply_debits};
pub use movement::{MovementReason, MovementReference, StockMovement, replay, replay_product};
