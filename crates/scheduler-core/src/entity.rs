//! `EntityStore`: per-tenant store of user-owned entities that the effect
//! API reads/writes (spec §2.4, §3).

use crate::error::Result;
use crate::tenant::TenantId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct EntityMetadata {
    pub tenant_id: String,
    pub user_id: String,
    pub source: String,
}

/// A user-owned datum manipulated through the effect table. `data` is
/// stored as a serialized blob because the underlying store is
/// schemaless (spec §9); typed access is offered via `*_parsed` helpers
/// in the effect table, not here.
#[derive(Debug, Clone)]
pub struct Entity {
    pub entity_id: String,
    pub entity_type: String,
    pub data_blob: Vec<u8>,
    pub metadata: EntityMetadata,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entity {
    /// Parses `data_blob` as JSON. A malformed blob is reported as
    /// `Ok(None)`, not an error — `/get-objects-parsed` returns
    /// `data = null` rather than failing the whole call (spec §4.5).
    pub fn parsed_data(&self) -> Option<Value> {
        serde_json::from_slice(&self.data_blob).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    pub entity_id: Option<String>,
    pub entity_type: String,
    pub data: Value,
    pub metadata: EntityMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateEntity {
    pub entity_id: String,
    pub entity_type: Option<String>,
    pub data: Value,
}

/// Query options for `find` (spec §4.5, before the in-memory
/// filter/sort/paginate pass of §4.5.1 is applied on top of the result).
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    pub ids: Option<Vec<String>>,
    pub types: Option<Vec<String>>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Upsert by id if `entity.entity_id` is set and already exists,
    /// otherwise create with a fresh id. Clears any soft-delete flag.
    async fn upsert(&self, tenant: &TenantId, entity: NewEntity) -> Result<Entity>;

    /// Requires an existing, non-soft-deleted record.
    async fn update(&self, tenant: &TenantId, update: UpdateEntity) -> Result<Entity>;

    /// Soft-deletes (sets `deleted_at`); returns the entity as it stood
    /// immediately before the delete.
    async fn soft_delete(&self, tenant: &TenantId, entity_id: &str) -> Result<Entity>;

    /// Finds entities by id/type filter, scoped to one tenant.
    /// Soft-deleted rows are excluded by default.
    async fn find(&self, tenant: &TenantId, query: EntityQuery) -> Result<Vec<Entity>>;
}
