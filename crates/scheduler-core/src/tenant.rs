//! `TenantRegistry`: enumerates known tenants and hands out per-tenant
//! store handles (spec §2.2).

use crate::entity::EntityStore;
use crate::error::{Result, SchedulerError};
use crate::store::CommandStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An opaque tenant identifier. Construction is validated against an
/// allow-list so that per-tenant credential/table resolution elsewhere in
/// the system (an external collaborator, not this crate's concern) can
/// safely string-concatenate it without injection risk — see spec §9,
/// "Per-tenant credentials resolved by string-concatenated environment
/// keys." Serializes as its plain string form; deserializing re-runs the
/// same validation as `new` via `TryFrom<String>`, so a `Command` loaded
/// from storage can never carry an invalid `tenant_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Accepts ASCII alphanumerics, `-`, and `_`, 1..=128 bytes.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > 128 {
            return Err(SchedulerError::InvalidTenantId(raw));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(SchedulerError::InvalidTenantId(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = SchedulerError;

    fn try_from(raw: String) -> Result<Self> {
        TenantId::new(raw)
    }
}

impl From<TenantId> for String {
    fn from(tenant: TenantId) -> Self {
        tenant.0
    }
}

/// Enumerates known tenants. Iteration order is the order the Worker
/// honors within a single tick (spec §5, "Across tenants, the registry
/// iteration order is respected").
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<TenantId>>;

    /// Hands out the `CommandStore` handle for one tenant.
    fn command_store(&self, tenant: &TenantId) -> Result<Arc<dyn CommandStore>>;

    /// Hands out the `EntityStore` handle for one tenant.
    fn entity_store(&self, tenant: &TenantId) -> Result<Arc<dyn EntityStore>>;
}
