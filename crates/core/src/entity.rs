//! Entity trait: identity + continuity across state changes.

use crate::id::TenantId;

/// Entity owned by exactly one organization scope.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    fn tenant_id(&self) -> TenantId;

    /// Soft-delete flag. Inactive entities are retained for audit.
    fn is_active(&self) -> bool;
}
