//! PostgreSQL implementation of the scheduler's `EntityStore` port.
//!
//! # Database schema
//!
//! ```sql
//! CREATE TABLE entities (
//!     entity_id TEXT NOT NULL,
//!     tenant_id TEXT NOT NULL,
//!     entity_type TEXT NOT NULL,
//!     data JSONB NOT NULL,
//!     user_id TEXT NOT NULL,
//!     source TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     deleted_at TIMESTAMPTZ,
//!     PRIMARY KEY (tenant_id, entity_id)
//! );
//!
//! CREATE INDEX idx_entities_lookup ON entities (tenant_id, entity_type)
//!     WHERE deleted_at IS NULL;
//! ```
//!
//! `data` is stored as opaque JSONB; this crate never interprets it
//! beyond round-tripping bytes, matching the schemaless contract of
//! `scheduler_core::Entity::data_blob`.

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{Entity, EntityMetadata, EntityQuery, EntityStore, NewEntity, SchedulerError, TenantId, UpdateEntity};
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn transient(err: sqlx::Error) -> SchedulerError {
    SchedulerError::transient(err)
}

#[derive(Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_entity(row: &sqlx::postgres::PgRow) -> Result<Entity, SchedulerError> {
    let data: serde_json::Value = row.try_get("data").map_err(transient)?;
    Ok(Entity {
        entity_id: row.try_get("entity_id").map_err(transient)?,
        entity_type: row.try_get("entity_type").map_err(transient)?,
        data_blob: serde_json::to_vec(&data).unwrap_or_default(),
        metadata: EntityMetadata {
            tenant_id: row.try_get("tenant_id").map_err(transient)?,
            user_id: row.try_get("user_id").map_err(transient)?,
            source: row.try_get("source").map_err(transient)?,
        },
        created_at: row.try_get("created_at").map_err(transient)?,
        deleted_at: row.try_get("deleted_at").map_err(transient)?,
    })
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn upsert(&self, tenant: &TenantId, entity: NewEntity) -> scheduler_core::Result<Entity> {
        let entity_id = entity.entity_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let row = sqlx::query(
            r#"
            INSERT INTO entities (entity_id, tenant_id, entity_type, data, user_id, source, created_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NULL)
            ON CONFLICT (tenant_id, entity_id) DO UPDATE
            SET entity_type = EXCLUDED.entity_type,
                data = EXCLUDED.data,
                deleted_at = NULL
            RETURNING *
            "#,
        )
        .bind(&entity_id)
        .bind(tenant.as_str())
        .bind(&entity.entity_type)
        .bind(&entity.data)
        .bind(&entity.metadata.user_id)
        .bind(&entity.metadata.source)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;

        row_to_entity(&row)
    }

    async fn update(&self, tenant: &TenantId, update: UpdateEntity) -> scheduler_core::Result<Entity> {
        let row = sqlx::query(
            r#"
            UPDATE entities
            SET entity_type = COALESCE($3, entity_type),
                data = $4
            WHERE tenant_id = $1 AND entity_id = $2 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(tenant.as_str())
        .bind(&update.entity_id)
        .bind(&update.entity_type)
        .bind(&update.data)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?
        .ok_or_else(|| SchedulerError::NotFound(update.entity_id.clone()))?;

        row_to_entity(&row)
    }

    async fn soft_delete(&self, tenant: &TenantId, entity_id: &str) -> scheduler_core::Result<Entity> {
        let mut tx = self.pool.begin().await.map_err(transient)?;

        let before = sqlx::query("SELECT * FROM entities WHERE tenant_id = $1 AND entity_id = $2 AND deleted_at IS NULL FOR UPDATE")
            .bind(tenant.as_str())
            .bind(entity_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(transient)?
            .ok_or_else(|| SchedulerError::NotFound(entity_id.to_string()))?;

        let snapshot = row_to_entity(&before)?;

        sqlx::query("UPDATE entities SET deleted_at = $3 WHERE tenant_id = $1 AND entity_id = $2")
            .bind(tenant.as_str())
            .bind(entity_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(transient)?;

        tx.commit().await.map_err(transient)?;
        Ok(snapshot)
    }

    async fn find(&self, tenant: &TenantId, query: EntityQuery) -> scheduler_core::Result<Vec<Entity>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM entities
            WHERE tenant_id = $1
              AND deleted_at IS NULL
              AND ($2::text[] IS NULL OR entity_id = ANY($2))
              AND ($3::text[] IS NULL OR entity_type = ANY($3))
            "#,
        )
        .bind(tenant.as_str())
        .bind(query.ids)
        .bind(query.types)
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;

        rows.iter().map(row_to_entity).collect()
    }
}
