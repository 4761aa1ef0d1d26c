//! Product catalog service.
//!
//! Products are read-mostly. Writes happen through registration, deactivation
//! and the create-if-missing path used by purchase-order creation.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use rxledger_core::{DomainError, DomainResult, OperationContext, ProductId};
use rxledger_products::{CatalogDefaults, NewProductRequest, Product};
use rxledger_purchasing::ItemProduct;

use crate::retry::with_retry;
use crate::store::{LedgerStore, LedgerTx};

use super::{ServiceSettings, Shared, finish};

/// Product master data.
#[derive(Debug)]
pub struct ProductCatalog<S> {
    shared: Shared<S>,
}

impl<S> Clone for ProductCatalog<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: LedgerStore> ProductCatalog<S> {
    pub fn new(store: Arc<S>, settings: Arc<ServiceSettings>) -> Self {
        Self {
            shared: Shared::new(store, settings),
        }
    }

    pub(crate) fn from_shared(shared: Shared<S>) -> Self {
        Self { shared }
    }

    pub async fn get(&self, ctx: &OperationContext, product_id: ProductId) -> DomainResult<Product> {
        self.shared
            .store
            .get_product(ctx.tenant_id, product_id)
            .await?
            .ok_or_else(|| DomainError::not_found("product", product_id))
    }

    pub async fn list(&self, ctx: &OperationContext) -> DomainResult<Vec<Product>> {
        let mut products = self.shared.store.list_products(ctx.tenant_id).await?;
        products.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(products)
    }

    /// Add a product. A name already in the catalog (any case) is a `Conflict`.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id, name = %request.name), err)]
    pub async fn register(
        &self,
        ctx: &OperationContext,
        request: NewProductRequest,
    ) -> DomainResult<Product> {
        with_retry(&self.shared.settings.retry, "catalog.register", || {
            self.try_register(ctx, &request)
        })
        .await
    }

    async fn try_register(
        &self,
        ctx: &OperationContext,
        request: &NewProductRequest,
    ) -> DomainResult<Product> {
        self.shared
            .timed("catalog.register", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result: DomainResult<Product> = async {
                    if let Some(existing) = tx.product_by_name(&request.name).await? {
                        return Err(DomainError::conflict(format!(
                            "product '{}' already exists as {}",
                            existing.name, existing.id
                        )));
                    }
                    let defaults = &self.shared.settings.catalog_defaults;
                    create_product(tx.as_mut(), ctx, defaults, request.clone()).await
                }
                .await;
                finish(tx, result).await
            })
            .await
    }

    /// Soft-delete. Batches keep referencing the product; it stops being
    /// orderable and sellable.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn deactivate(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
    ) -> DomainResult<Product> {
        with_retry(&self.shared.settings.retry, "catalog.deactivate", || {
            self.try_deactivate(ctx, product_id)
        })
        .await
    }

    async fn try_deactivate(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
    ) -> DomainResult<Product> {
        self.shared
            .timed("catalog.deactivate", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result: DomainResult<Product> = async {
                    let mut product = require_product(tx.as_mut(), product_id).await?;
                    if product.active {
                        product.active = false;
                        tx.update_product(&product).await?;
                        info!(product_id = %product_id, "product deactivated");
                    }
                    Ok(product)
                }
                .await;
                finish(tx, result).await
            })
            .await
    }

    /// Return the active product with this name, registering it if absent.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id, name = %request.name), err)]
    pub async fn find_or_create(
        &self,
        ctx: &OperationContext,
        request: NewProductRequest,
    ) -> DomainResult<Product> {
        with_retry(&self.shared.settings.retry, "catalog.find_or_create", || {
            self.try_find_or_create(ctx, &request)
        })
        .await
    }

    async fn try_find_or_create(
        &self,
        ctx: &OperationContext,
        request: &NewProductRequest,
    ) -> DomainResult<Product> {
        self.shared
            .timed("catalog.find_or_create", async {
                let mut tx = self.shared.begin(ctx.tenant_id).await?;
                let result = resolve_item_product(
                    tx.as_mut(),
                    ctx,
                    &self.shared.settings.catalog_defaults,
                    ItemProduct::New {
                        request: request.clone(),
                    },
                )
                .await;
                let result = match result {
                    Ok(product_id) => require_product(tx.as_mut(), product_id).await,
                    Err(err) => Err(err),
                };
                finish(tx, result).await
            })
            .await
    }
}

/// Load a product inside a transaction, or `NotFound`.
pub(crate) async fn require_product(
    tx: &mut dyn LedgerTx,
    product_id: ProductId,
) -> DomainResult<Product> {
    tx.product(product_id)
        .await?
        .ok_or_else(|| DomainError::not_found("product", product_id))
}

async fn create_product(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    defaults: &CatalogDefaults,
    request: NewProductRequest,
) -> DomainResult<Product> {
    let product = request.into_product(ProductId::new(), ctx.tenant_id, defaults, ctx.occurred_at)?;
    tx.insert_product(&product).await?;
    info!(product_id = %product.id, name = %product.name, "product registered");
    Ok(product)
}

/// Turn an order item's product reference into a concrete, usable product id.
///
/// An existing product must be present and active. A new-product request
/// reuses an active product of the same name (case-insensitive), is rejected
/// if that name belongs to an inactive product, and otherwise registers the
/// product with `defaults` filling the gaps. Rejections are `InvalidItem`.
pub(crate) async fn resolve_item_product(
    tx: &mut dyn LedgerTx,
    ctx: &OperationContext,
    defaults: &CatalogDefaults,
    product: ItemProduct,
) -> DomainResult<ProductId> {
    match product {
        ItemProduct::Existing { product_id } => match tx.product(product_id).await? {
            Some(p) if p.active => Ok(product_id),
            Some(_) => Err(DomainError::invalid_item(format!(
                "product {product_id} is inactive"
            ))),
            None => Err(DomainError::invalid_item(format!(
                "product {product_id} does not exist"
            ))),
        },
        ItemProduct::New { request } => {
            request
                .validate()
                .map_err(|e| DomainError::invalid_item(e.to_string()))?;
            match tx.product_by_name(&request.name).await? {
                Some(p) if p.active => {
                    debug!(product_id = %p.id, "reusing product with matching name");
                    Ok(p.id)
                }
                Some(p) => Err(DomainError::invalid_item(format!(
                    "product '{}' exists but is inactive",
                    p.name
                ))),
                None => Ok(create_product(tx, ctx, defaults, request).await?.id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedgerStore;
    use rust_decimal_macros::dec;
    use rxledger_core::{TenantId, UserId};

    fn catalog() -> ProductCatalog<InMemoryLedgerStore> {
        let settings = ServiceSettings {
            catalog_defaults: CatalogDefaults {
                tax_rate: dec!(5),
                low_stock_threshold: 25,
                markup_percent: dec!(20),
            },
            ..ServiceSettings::default()
        };
        ProductCatalog::new(Arc::new(InMemoryLedgerStore::new()), Arc::new(settings))
    }

    fn ctx() -> OperationContext {
        OperationContext::now(TenantId::new(), UserId::new())
    }

    #[tokio::test]
    async fn register_applies_defaults_and_rejects_duplicate_names() {
        let catalog = catalog();
        let ctx = ctx();

        let product = catalog
            .register(&ctx, NewProductRequest::named("Cetirizine 10mg"))
            .await
            .unwrap();
        assert_eq!(product.tax_rate, dec!(5));
        assert_eq!(product.low_stock_threshold, 25);
        assert_eq!(catalog.get(&ctx, product.id).await.unwrap(), product);

        let err = catalog
            .register(&ctx, NewProductRequest::named("CETIRIZINE 10MG"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn find_or_create_reuses_active_and_refuses_inactive() {
        let catalog = catalog();
        let ctx = ctx();

        let first = catalog
            .find_or_create(&ctx, NewProductRequest::named("Loratadine"))
            .await
            .unwrap();
        let again = catalog
            .find_or_create(&ctx, NewProductRequest::named("loratadine"))
            .await
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(catalog.list(&ctx).await.unwrap().len(), 1);

        let deactivated = catalog.deactivate(&ctx, first.id).await.unwrap();
        assert!(!deactivated.active);
        let err = catalog
            .find_or_create(&ctx, NewProductRequest::named("Loratadine"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidItem(_)));
    }

    #[tokio::test]
    async fn products_are_tenant_scoped() {
        let catalog = catalog();
        let ctx = ctx();
        let product = catalog
            .register(&ctx, NewProductRequest::named("Omeprazole"))
            .await
            .unwrap();

        let other = OperationContext::now(TenantId::new(), ctx.actor);
        assert!(matches!(
            catalog.get(&other, product.id).await,
            Err(DomainError::NotFound { entity: "product", .. })
        ));
    }
}
