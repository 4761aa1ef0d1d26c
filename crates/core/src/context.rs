use chrono::{DateTime, NaiveDate, Utc};

use crate::id::{TenantId, UserId};

/// Caller context for one ledger operation.
///
/// Supplied by the auth/session layer on every call and trusted as-is. All
/// reads and writes are scoped to `tenant_id`; `actor` and `occurred_at` are
/// stamped on every movement and order event the operation produces.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub tenant_id: TenantId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

impl OperationContext {
    pub fn new(tenant_id: TenantId, actor: UserId, occurred_at: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            actor,
            occurred_at,
        }
    }

    /// Context stamped with the current wall-clock time.
    pub fn now(tenant_id: TenantId, actor: UserId) -> Self {
        Self::new(tenant_id, actor, Utc::now())
    }

    /// Business date used for expiry checks.
    pub fn today(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }
}
