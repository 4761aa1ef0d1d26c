//! Postgres-backed ledger store.
//!
//! Schema lives in `crates/infra/migrations/`. Every query carries `tenant_id`
//! in its WHERE clause.
//!
//! ## Locking
//!
//! Write transactions lock the rows they read with `SELECT … FOR UPDATE` and
//! run under `SET LOCAL statement_timeout`. Movement sequence numbers come
//! from a per-tenant counter row that is incremented inside the transaction,
//! so they are handed out in commit order.
//!
//! ## Error Mapping
//!
//! | PostgreSQL code | StoreError | Scenario |
//! |-----------------|------------|----------|
//! | `40001` | `Conflict` | serialization failure |
//! | `40P01` | `Conflict` | deadlock detected |
//! | `55P03` / `57014` | `Conflict` | lock not available / statement timeout |
//! | `23505` | `Conflict` | insert raced a concurrent insert of the same product name or batch number |
//! | `23505` | `Duplicate` | any other unique violation (order id) |
//! | other | `Database` | everything else |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use rxledger_core::{
    AggregateRoot, BatchId, Entity, ExpectedVersion, ProductId, PurchaseOrderId, SaleId,
    SupplierId, TenantId, UserId,
};
use rxledger_events::RecordedEvent;
use rxledger_inventory::{
    BatchSpec, InventoryBatch, MovementReason, MovementReference, StockMovement,
};
use rxledger_products::{PricingPolicy, Product};
use rxledger_purchasing::PurchaseOrder;

use super::{LedgerSnapshot, LedgerStore, LedgerTx, StoreError, ensure_tenant};

/// Postgres-backed ledger store.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    /// Connect a pool with `max_connections` connections.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        statement_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, statement_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn begin(&self, tenant_id: TenantId) -> Result<Box<dyn LedgerTx>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // SET does not take bind parameters.
        let timeout_ms = self.statement_timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_statement_timeout", e))?;

        Ok(Box::new(PgLedgerTx { tenant_id, tx }))
    }

    async fn get_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
    ) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE tenant_id = $1 AND product_id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn list_products(&self, tenant_id: TenantId) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE tenant_id = $1 ORDER BY name"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_products", e))?;
        rows.iter().map(product_from_row).collect()
    }

    async fn list_batches(
        &self,
        tenant_id: TenantId,
        product_id: Option<ProductId>,
    ) -> Result<Vec<InventoryBatch>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM inventory_batches
             WHERE tenant_id = $1 AND ($2::uuid IS NULL OR product_id = $2)
             ORDER BY expiry_date, created_at"
        ))
        .bind(tenant_id.as_uuid())
        .bind(product_id.map(Uuid::from))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_batches", e))?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn list_movements(&self, tenant_id: TenantId) -> Result<Vec<StockMovement>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE tenant_id = $1 ORDER BY sequence"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_movements", e))?;
        rows.iter().map(movement_from_row).collect()
    }

    async fn get_order(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        let row = sqlx::query(
            "SELECT state FROM purchase_orders WHERE tenant_id = $1 AND order_id = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_order", e))?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn order_history(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, tenant_id, order_id, sequence_number, event_type,
                   event_version, occurred_at, actor, payload
            FROM order_events
            WHERE tenant_id = $1 AND order_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("order_history", e))?;
        rows.iter().map(event_from_row).collect()
    }
}

struct PgLedgerTx {
    tenant_id: TenantId,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    async fn product(&mut self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products
             WHERE tenant_id = $1 AND product_id = $2 FOR SHARE"
        ))
        .bind(self.tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn product_by_name(&mut self, name: &str) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products
             WHERE tenant_id = $1 AND lower(name) = lower($2)
             ORDER BY created_at LIMIT 1 FOR SHARE"
        ))
        .bind(self.tenant_id.as_uuid())
        .bind(name.trim())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("product_by_name", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn insert_product(&mut self, product: &Product) -> Result<(), StoreError> {
        ensure_tenant(self.tenant_id, product.tenant_id, "product")?;
        sqlx::query(
            r#"
            INSERT INTO products (
                tenant_id, product_id, name, manufacturer, category, tax_rate,
                low_stock_threshold, markup_percent, active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(product.id.as_uuid())
        .bind(&product.name)
        .bind(&product.manufacturer)
        .bind(&product.category)
        .bind(product.tax_rate)
        .bind(product.low_stock_threshold)
        .bind(product.pricing.markup_percent)
        .bind(product.active)
        .bind(product.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_insert_error("insert_product", e))?;
        Ok(())
    }

    async fn update_product(&mut self, product: &Product) -> Result<(), StoreError> {
        ensure_tenant(self.tenant_id, product.tenant_id, "product")?;
        sqlx::query(
            r#"
            UPDATE products
            SET name = $3, manufacturer = $4, category = $5, tax_rate = $6,
                low_stock_threshold = $7, markup_percent = $8, active = $9
            WHERE tenant_id = $1 AND product_id = $2
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(product.id.as_uuid())
        .bind(&product.name)
        .bind(&product.manufacturer)
        .bind(&product.category)
        .bind(product.tax_rate)
        .bind(product.low_stock_threshold)
        .bind(product.pricing.markup_percent)
        .bind(product.active)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_product", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn lock_batches(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<InventoryBatch>, StoreError> {
        // Fixed lock order (batch id) across transactions keeps deadlocks rare.
        let rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM inventory_batches
             WHERE tenant_id = $1 AND product_id = $2
             ORDER BY batch_id FOR UPDATE"
        ))
        .bind(self.tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_batches", e))?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn lock_batch(&mut self, batch_id: BatchId) -> Result<Option<InventoryBatch>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM inventory_batches
             WHERE tenant_id = $1 AND batch_id = $2 FOR UPDATE"
        ))
        .bind(self.tenant_id.as_uuid())
        .bind(batch_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_batch", e))?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn lock_batch_by_number(
        &mut self,
        product_id: ProductId,
        batch_number: &str,
    ) -> Result<Option<InventoryBatch>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM inventory_batches
             WHERE tenant_id = $1 AND product_id = $2 AND batch_number = $3 FOR UPDATE"
        ))
        .bind(self.tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(batch_number)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_batch_by_number", e))?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn insert_batch(&mut self, batch: &InventoryBatch) -> Result<(), StoreError> {
        ensure_tenant(self.tenant_id, batch.tenant_id(), "batch")?;
        sqlx::query(
            r#"
            INSERT INTO inventory_batches (
                tenant_id, batch_id, product_id, batch_number, expiry_date, quantity,
                cost_price, selling_price, supplier_id, active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(batch.id_typed().as_uuid())
        .bind(batch.product_id().as_uuid())
        .bind(batch.batch_number())
        .bind(batch.expiry_date())
        .bind(batch.quantity())
        .bind(batch.cost_price())
        .bind(batch.selling_price())
        .bind(batch.supplier_id().map(Uuid::from))
        .bind(batch.is_active())
        .bind(batch.created_at())
        .bind(batch.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_insert_error("insert_batch", e))?;
        Ok(())
    }

    async fn update_batch(&mut self, batch: &InventoryBatch) -> Result<(), StoreError> {
        ensure_tenant(self.tenant_id, batch.tenant_id(), "batch")?;
        sqlx::query(
            r#"
            UPDATE inventory_batches
            SET quantity = $3, active = $4, updated_at = $5
            WHERE tenant_id = $1 AND batch_id = $2
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(batch.id_typed().as_uuid())
        .bind(batch.quantity())
        .bind(batch.is_active())
        .bind(batch.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_batch", e))?;
        Ok(())
    }

    async fn append_movement(
        &mut self,
        mut movement: StockMovement,
    ) -> Result<StockMovement, StoreError> {
        ensure_tenant(self.tenant_id, movement.tenant_id, "movement")?;

        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_sequences (tenant_id, last_sequence)
            VALUES ($1, 1)
            ON CONFLICT (tenant_id)
            DO UPDATE SET last_sequence = ledger_sequences.last_sequence + 1
            RETURNING last_sequence
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("next_sequence", e))?;
        movement.sequence = sequence as u64;

        let (reference_kind, reference_id) = match movement.reference {
            Some(MovementReference::PurchaseOrder(id)) => (Some("purchase_order"), Some(Uuid::from(id))),
            Some(MovementReference::Sale(id)) => (Some("sale"), Some(Uuid::from(id))),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO stock_movements (
                tenant_id, sequence, movement_id, product_id, batch_id, delta, reason,
                reference_kind, reference_id, note, actor, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(self.tenant_id.as_uuid())
        .bind(sequence)
        .bind(movement.movement_id)
        .bind(movement.product_id.as_uuid())
        .bind(movement.batch_id.as_uuid())
        .bind(movement.delta)
        .bind(movement.reason.as_str())
        .bind(reference_kind)
        .bind(reference_id)
        .bind(&movement.note)
        .bind(movement.actor.as_uuid())
        .bind(movement.occurred_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_movement", e))?;

        Ok(movement)
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant_id), err)]
    async fn ledger_snapshot(&mut self) -> Result<LedgerSnapshot, StoreError> {
        // Every movement append upserts the counter row, so holding it blocks
        // writers that have not committed yet and keeps the two reads aligned.
        sqlx::query(
            "INSERT INTO ledger_sequences (tenant_id, last_sequence) VALUES ($1, 0)
             ON CONFLICT (tenant_id) DO NOTHING",
        )
        .bind(self.tenant_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("ledger_snapshot", e))?;
        sqlx::query("SELECT last_sequence FROM ledger_sequences WHERE tenant_id = $1 FOR UPDATE")
            .bind(self.tenant_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("ledger_snapshot", e))?;

        let batch_rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM inventory_batches WHERE tenant_id = $1 ORDER BY batch_id"
        ))
        .bind(self.tenant_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("ledger_snapshot", e))?;
        let movement_rows = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE tenant_id = $1 ORDER BY sequence"
        ))
        .bind(self.tenant_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("ledger_snapshot", e))?;

        Ok(LedgerSnapshot {
            batches: batch_rows.iter().map(batch_from_row).collect::<Result<_, _>>()?,
            movements: movement_rows
                .iter()
                .map(movement_from_row)
                .collect::<Result<_, _>>()?,
        })
    }

    async fn lock_order(
        &mut self,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        let row = sqlx::query(
            "SELECT state FROM purchase_orders WHERE tenant_id = $1 AND order_id = $2 FOR UPDATE",
        )
        .bind(self.tenant_id.as_uuid())
        .bind(order_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_order", e))?;
        row.as_ref().map(order_from_row).transpose()
    }

    #[instrument(
        skip(self, order, events),
        fields(order_id = %order.id_typed(), event_count = events.len()),
        err
    )]
    async fn save_order(
        &mut self,
        order: &PurchaseOrder,
        events: Vec<RecordedEvent>,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        if let Some(tenant_id) = order.tenant_id() {
            ensure_tenant(self.tenant_id, tenant_id, "purchase order")?;
        }
        let state = serde_json::to_value(order)
            .map_err(|e| StoreError::Corrupt(format!("order serialization failed: {e}")))?;
        let version = order.version() as i64;

        let written = match expected {
            ExpectedVersion::New => sqlx::query(
                r#"
                INSERT INTO purchase_orders (
                    tenant_id, order_id, status, supplier_id, total, version, state,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                "#,
            )
            .bind(self.tenant_id.as_uuid())
            .bind(order.id_typed().as_uuid())
            .bind(order.status().as_str())
            .bind(order.supplier_id().map(Uuid::from))
            .bind(order.totals().total)
            .bind(version)
            .bind(&state)
            .bind(order.updated_at().unwrap_or_else(Utc::now))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order", e))?,
            ExpectedVersion::Exact(previous) => sqlx::query(
                r#"
                UPDATE purchase_orders
                SET status = $3, supplier_id = $4, total = $5, version = $6, state = $7,
                    updated_at = $8
                WHERE tenant_id = $1 AND order_id = $2 AND version = $9
                "#,
            )
            .bind(self.tenant_id.as_uuid())
            .bind(order.id_typed().as_uuid())
            .bind(order.status().as_str())
            .bind(order.supplier_id().map(Uuid::from))
            .bind(order.totals().total)
            .bind(version)
            .bind(&state)
            .bind(order.updated_at().unwrap_or_else(Utc::now))
            .bind(previous as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_order", e))?,
        };
        if written.rows_affected() != 1 {
            return Err(StoreError::Conflict(format!(
                "purchase order {}: expected {expected:?}",
                order.id_typed()
            )));
        }

        for event in events {
            ensure_tenant(self.tenant_id, event.tenant_id, "order event")?;
            sqlx::query(
                r#"
                INSERT INTO order_events (
                    event_id, tenant_id, order_id, sequence_number, event_type,
                    event_version, occurred_at, actor, payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(event.event_id)
            .bind(self.tenant_id.as_uuid())
            .bind(event.stream_id)
            .bind(event.sequence_number as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.occurred_at)
            .bind(event.actor.as_uuid())
            .bind(&event.payload)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!(
                        "concurrent append detected: sequence_number {} already exists",
                        event.sequence_number
                    ))
                } else {
                    map_sqlx_error("insert_order_event", e)
                }
            })?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

const PRODUCT_COLUMNS: &str = "product_id, tenant_id, name, manufacturer, category, tax_rate, \
     low_stock_threshold, markup_percent, active, created_at";

const BATCH_COLUMNS: &str = "batch_id, tenant_id, product_id, batch_number, expiry_date, quantity, \
     cost_price, selling_price, supplier_id, active, created_at, updated_at";

const MOVEMENT_COLUMNS: &str = "movement_id, tenant_id, product_id, batch_id, delta, reason, \
     reference_kind, reference_id, note, actor, occurred_at, sequence";

fn corrupt(what: &str, e: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to decode {what} row: {e}"))
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    let decode = || -> Result<Product, sqlx::Error> {
        Ok(Product {
            id: ProductId::from_uuid(row.try_get("product_id")?),
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
            name: row.try_get("name")?,
            manufacturer: row.try_get("manufacturer")?,
            category: row.try_get("category")?,
            tax_rate: row.try_get::<Decimal, _>("tax_rate")?,
            low_stock_threshold: row.try_get("low_stock_threshold")?,
            pricing: PricingPolicy {
                markup_percent: row.try_get("markup_percent")?,
            },
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
        })
    };
    decode().map_err(|e| corrupt("product", e))
}

fn batch_from_row(row: &PgRow) -> Result<InventoryBatch, StoreError> {
    let decode = || -> Result<InventoryBatch, sqlx::Error> {
        let supplier: Option<Uuid> = row.try_get("supplier_id")?;
        let spec = BatchSpec {
            product_id: ProductId::from_uuid(row.try_get("product_id")?),
            batch_number: row.try_get("batch_number")?,
            expiry_date: row.try_get::<NaiveDate, _>("expiry_date")?,
            cost_price: row.try_get("cost_price")?,
            selling_price: row.try_get("selling_price")?,
            supplier_id: supplier.map(SupplierId::from_uuid),
        };
        Ok(InventoryBatch::restore(
            BatchId::from_uuid(row.try_get("batch_id")?),
            TenantId::from_uuid(row.try_get("tenant_id")?),
            spec,
            row.try_get("quantity")?,
            row.try_get("active")?,
            row.try_get::<DateTime<Utc>, _>("created_at")?,
            row.try_get::<DateTime<Utc>, _>("updated_at")?,
        ))
    };
    decode().map_err(|e| corrupt("batch", e))
}

fn movement_from_row(row: &PgRow) -> Result<StockMovement, StoreError> {
    let decode = || -> Result<(StockMovement, String, Option<String>, Option<Uuid>), sqlx::Error> {
        let sequence: i64 = row.try_get("sequence")?;
        let movement = StockMovement {
            movement_id: row.try_get("movement_id")?,
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
            product_id: ProductId::from_uuid(row.try_get("product_id")?),
            batch_id: BatchId::from_uuid(row.try_get("batch_id")?),
            delta: row.try_get("delta")?,
            // Decoded below.
            reason: MovementReason::Adjustment,
            reference: None,
            note: row.try_get("note")?,
            actor: UserId::from_uuid(row.try_get("actor")?),
            occurred_at: row.try_get("occurred_at")?,
            sequence: sequence as u64,
        };
        Ok((
            movement,
            row.try_get("reason")?,
            row.try_get("reference_kind")?,
            row.try_get("reference_id")?,
        ))
    };
    let (mut movement, reason, kind, id) = decode().map_err(|e| corrupt("movement", e))?;

    movement.reason = MovementReason::parse(&reason).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    movement.reference = match (kind.as_deref(), id) {
        (Some("purchase_order"), Some(id)) => {
            Some(MovementReference::PurchaseOrder(PurchaseOrderId::from_uuid(id)))
        }
        (Some("sale"), Some(id)) => Some(MovementReference::Sale(SaleId::from_uuid(id))),
        (None, _) => None,
        (Some(other), _) => {
            return Err(StoreError::Corrupt(format!(
                "unknown movement reference kind '{other}'"
            )));
        }
    };
    Ok(movement)
}

fn order_from_row(row: &PgRow) -> Result<PurchaseOrder, StoreError> {
    let state: serde_json::Value = row.try_get("state").map_err(|e| corrupt("purchase order", e))?;
    serde_json::from_value(state)
        .map_err(|e| StoreError::Corrupt(format!("order state deserialization failed: {e}")))
}

fn event_from_row(row: &PgRow) -> Result<RecordedEvent, StoreError> {
    let decode = || -> Result<RecordedEvent, sqlx::Error> {
        let sequence_number: i64 = row.try_get("sequence_number")?;
        let event_version: i32 = row.try_get("event_version")?;
        Ok(RecordedEvent {
            event_id: row.try_get("event_id")?,
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
            stream_id: row.try_get("order_id")?,
            stream_type: super::ORDER_STREAM_TYPE.to_string(),
            sequence_number: sequence_number as u64,
            event_type: row.try_get("event_type")?,
            event_version: event_version as u32,
            occurred_at: row.try_get("occurred_at")?,
            actor: UserId::from_uuid(row.try_get("actor")?),
            payload: row.try_get("payload")?,
        })
    };
    decode().map_err(|e| corrupt("order event", e))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            classify_database_error(operation, db_err.code().as_deref(), db_err.message(), false)
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Conflict(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}

/// Map errors from inserts that were preceded by a locked existence check.
fn map_insert_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            classify_database_error(operation, db_err.code().as_deref(), db_err.message(), true)
        }
        other => map_sqlx_error(operation, other),
    }
}

fn classify_database_error(
    operation: &str,
    code: Option<&str>,
    message: &str,
    after_existence_check: bool,
) -> StoreError {
    let msg = format!("database error in {operation}: {message}");
    match code {
        Some("40001") | Some("40P01") | Some("55P03") | Some("57014") => StoreError::Conflict(msg),
        // The key was absent when checked, so another transaction inserted it
        // since. A retry re-reads and sees the committed row.
        Some("23505") if after_existence_check => StoreError::Conflict(msg),
        Some("23505") => StoreError::Duplicate(msg),
        _ => StoreError::Database(msg),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    //! Require a migrated database: `DATABASE_URL=postgres://… cargo test -- --ignored`.

    use super::*;
    use chrono::Duration as ChronoDuration;
    use rxledger_core::OperationContext;

    async fn store() -> PostgresLedgerStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PostgresLedgerStore::connect(&url, 4, Duration::from_secs(5))
            .await
            .expect("connect")
    }

    fn batch(tenant_id: TenantId, product_id: ProductId, number: &str) -> InventoryBatch {
        let now = Utc::now();
        InventoryBatch::open(
            BatchId::new(),
            tenant_id,
            BatchSpec {
                product_id,
                batch_number: number.into(),
                expiry_date: now.date_naive() + ChronoDuration::days(30),
                cost_price: Decimal::ONE,
                selling_price: Decimal::TWO,
                supplier_id: None,
            },
            5,
            now.date_naive(),
            now,
        )
        .unwrap()
    }

    fn product(tenant_id: TenantId) -> Product {
        Product {
            id: ProductId::new(),
            tenant_id,
            name: format!("Test product {}", Uuid::now_v7()),
            manufacturer: None,
            category: None,
            tax_rate: Decimal::ZERO,
            low_stock_threshold: 10,
            pricing: PricingPolicy::default(),
            active: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn batch_and_movement_round_trip() {
        let store = store().await;
        let tenant_id = TenantId::new();
        let p = product(tenant_id);
        let b = batch(tenant_id, p.id, "LOT-1");
        let ctx = OperationContext::now(tenant_id, UserId::new());

        let mut tx = store.begin(tenant_id).await.unwrap();
        tx.insert_product(&p).await.unwrap();
        tx.insert_batch(&b).await.unwrap();
        let m = StockMovement::new(&ctx, p.id, b.id_typed(), 5, MovementReason::PurchaseReceive, None)
            .unwrap();
        tx.append_movement(m).await.unwrap();
        tx.commit().await.unwrap();

        let batches = store.list_batches(tenant_id, Some(p.id)).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].quantity(), 5);
        let movements = store.list_movements(tenant_id).await.unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].sequence, 1);
    }

    #[test]
    fn unique_violation_after_existence_check_is_retryable() {
        assert!(matches!(
            classify_database_error("insert_batch", Some("23505"), "dup", true),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            classify_database_error("insert_order", Some("23505"), "dup", false),
            StoreError::Duplicate(_)
        ));
        assert!(matches!(
            classify_database_error("insert_batch", Some("40001"), "serialize", false),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            classify_database_error("insert_batch", Some("23503"), "fk", true),
            StoreError::Database(_)
        ));
        let err: rxledger_core::DomainError =
            classify_database_error("insert_product", Some("23505"), "dup", true).into();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    #[ignore]
    async fn concurrent_first_credit_of_a_lot_is_a_conflict() {
        let store = store().await;
        let tenant_id = TenantId::new();
        let p = product(tenant_id);
        let mut setup = store.begin(tenant_id).await.unwrap();
        setup.insert_product(&p).await.unwrap();
        setup.commit().await.unwrap();

        let mut first = store.begin(tenant_id).await.unwrap();
        let mut second = store.begin(tenant_id).await.unwrap();
        first.insert_batch(&batch(tenant_id, p.id, "LOT-1")).await.unwrap();
        let dup = batch(tenant_id, p.id, "LOT-1");
        // The second insert waits on the first transaction's index entry.
        let (committed, raced) = tokio::join!(
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                first.commit().await
            },
            second.insert_batch(&dup),
        );
        committed.unwrap();
        assert!(matches!(raced, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    #[ignore]
    async fn duplicate_name_in_another_transaction_is_a_conflict() {
        let store = store().await;
        let tenant_id = TenantId::new();
        let p = product(tenant_id);
        let mut tx = store.begin(tenant_id).await.unwrap();
        tx.insert_product(&p).await.unwrap();
        tx.commit().await.unwrap();

        let twin = Product {
            id: ProductId::new(),
            name: p.name.to_uppercase(),
            ..p.clone()
        };
        let mut tx = store.begin(tenant_id).await.unwrap();
        let err = tx.insert_product(&twin).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn duplicate_batch_number_in_one_transaction_is_a_conflict() {
        let store = store().await;
        let tenant_id = TenantId::new();
        let p = product(tenant_id);

        let mut tx = store.begin(tenant_id).await.unwrap();
        tx.insert_product(&p).await.unwrap();
        tx.insert_batch(&batch(tenant_id, p.id, "LOT-1")).await.unwrap();
        let err = tx.insert_batch(&batch(tenant_id, p.id, "LOT-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn rolled_back_transaction_leaves_nothing() {
        let store = store().await;
        let tenant_id = TenantId::new();
        let p = product(tenant_id);

        let mut tx = store.begin(tenant_id).await.unwrap();
        tx.insert_product(&p).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get_product(tenant_id, p.id).await.unwrap().is_none());
    }
}
