//! Purchasing domain module (purchase orders as a state machine).
//!
//! This crate contains business rules for purchase orders, implemented purely as
//! deterministic domain logic (no IO, no storage). Product resolution and the
//! batch credits that follow a receipt are done by `rxledger-infra`.

pub mod item;
pub mod order;

pub use item::{
    ItemProduct, ItemProductInput, OrderItemInput, OrderTotals, PurchaseOrderItem, ResolvedItem,
};
pub use order::{
    Cancel, CreatePurchaseOrder, GoodsReceived, MarkOrdered, OrderTerms, PurchaseOrder,
    PurchaseOrderCancelled, PurchaseOrderCommand, PurchaseOrderCreated, PurchaseOrderEvent,
    PurchaseOrderMarkedOrdered, PurchaseOrderStatus, PurchaseOrderUpdated, ReceiptLine,
    ReceiveGoods, ReceivedLine, UpdatePurchaseOrder, default_batch_number,
};
