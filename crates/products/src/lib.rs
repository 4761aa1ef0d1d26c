//! Product catalog master data as seen by the ledger.
//!
//! Catalog maintenance is done elsewhere; this crate carries the product
//! record, its pricing policy and the create-if-missing request used by
//! purchase orders.

pub mod product;

pub use product::{CatalogDefaults, NewProductRequest, PricingPolicy, Product};
