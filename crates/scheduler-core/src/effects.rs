//! The effect table — "the DAO operations" (spec §4.5). The only surface
//! a program may use to observe or change persistent state, built fresh
//! per invocation and bound to `(tenant_id, user_id, source, cmd_id)`.

use crate::entity::{Entity, EntityMetadata, EntityQuery, EntityStore, NewEntity, UpdateEntity};
use crate::error::{Result, SchedulerError};
use crate::evaluator::ControlSignal;
use crate::filter::{apply_filter_sort_page, FilterSortPageOptions};
use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

pub struct AddObjectInput {
    pub id: Option<String>,
    pub entity_type: String,
    pub data: Value,
}

pub struct BulkInsertResult {
    pub count: u64,
    pub inserted_ids: Vec<String>,
}

pub struct ParsedEntity {
    pub entity_id: String,
    pub entity_type: String,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Passthrough ports to external integrations (payment, email, SMS,
/// ...). The core treats each as an opaque capability: "may throw, may
/// succeed." Every handle is curried with `tenant_id` by whoever builds
/// the table — the effect table itself never routes across tenants.
#[derive(Default, Clone)]
pub struct PassthroughPorts(HashMap<String, Arc<dyn Any + Send + Sync>>);

impl PassthroughPorts {
    pub fn insert(&mut self, name: impl Into<String>, port: Arc<dyn Any + Send + Sync>) {
        self.0.insert(name.into(), port);
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.0.get(name)?.clone().downcast::<T>().ok()
    }
}

pub struct EffectTable {
    tenant_id: TenantId,
    user_id: String,
    source: String,
    cmd_id: uuid::Uuid,
    store: Arc<dyn EntityStore>,
    entities_touched: AtomicU64,
    logs: Mutex<Vec<(DateTime<Utc>, String)>>,
    control_signal: OnceLock<ControlSignal>,
    passthrough: PassthroughPorts,
}

impl EffectTable {
    pub fn new(
        tenant_id: TenantId,
        user_id: String,
        source: String,
        cmd_id: uuid::Uuid,
        store: Arc<dyn EntityStore>,
        passthrough: PassthroughPorts,
    ) -> Self {
        Self {
            tenant_id,
            user_id,
            source,
            cmd_id,
            store,
            entities_touched: AtomicU64::new(0),
            logs: Mutex::new(Vec::new()),
            control_signal: OnceLock::new(),
            passthrough,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn cmd_id(&self) -> uuid::Uuid {
        self.cmd_id
    }

    pub fn passthrough(&self) -> &PassthroughPorts {
        &self.passthrough
    }

    /// Read by the Worker when the run ends (spec §4.5, "readable by the
    /// Worker when the run ends").
    pub fn touched(&self) -> u64 {
        self.entities_touched.load(Ordering::SeqCst)
    }

    fn metadata(&self) -> EntityMetadata {
        EntityMetadata {
            tenant_id: self.tenant_id.as_str().to_string(),
            user_id: self.user_id.clone(),
            source: self.source.clone(),
        }
    }

    /// `/add-object`
    pub async fn add_object(&self, input: AddObjectInput) -> Result<Entity> {
        if !input.data.is_object() {
            return Err(SchedulerError::ProgramError {
                message: "add-object: data must be an object".into(),
                code: Some("BAD_INPUT".into()),
            });
        }
        let entity = self
            .store
            .upsert(
                &self.tenant_id,
                NewEntity {
                    entity_id: input.id,
                    entity_type: input.entity_type,
                    data: input.data,
                    metadata: self.metadata(),
                },
            )
            .await?;
        self.entities_touched.fetch_add(1, Ordering::SeqCst);
        Ok(entity)
    }

    /// `/add-object-bulk`
    pub async fn add_object_bulk(&self, objects: Vec<AddObjectInput>) -> Result<BulkInsertResult> {
        let mut inserted_ids = Vec::with_capacity(objects.len());
        for obj in objects {
            let entity = self.add_object(obj).await?;
            inserted_ids.push(entity.entity_id);
        }
        Ok(BulkInsertResult {
            count: inserted_ids.len() as u64,
            inserted_ids,
        })
    }

    /// `/update-object`
    pub async fn update_object(
        &self,
        id: String,
        entity_type: Option<String>,
        data: Value,
    ) -> Result<Entity> {
        if !data.is_object() {
            return Err(SchedulerError::ProgramError {
                message: "update-object: data must be an object".into(),
                code: Some("BAD_INPUT".into()),
            });
        }
        let entity = self
            .store
            .update(
                &self.tenant_id,
                UpdateEntity {
                    entity_id: id,
                    entity_type,
                    data,
                },
            )
            .await?;
        self.entities_touched.fetch_add(1, Ordering::SeqCst);
        Ok(entity)
    }

    /// `/del-object`
    pub async fn del_object(&self, id: &str) -> Result<Entity> {
        let entity = self.store.soft_delete(&self.tenant_id, id).await?;
        self.entities_touched.fetch_add(1, Ordering::SeqCst);
        Ok(entity)
    }

    /// `/get-objects-raw`
    pub async fn get_objects_raw(
        &self,
        query: EntityQuery,
        page: FilterSortPageOptions,
    ) -> Result<Vec<Entity>> {
        let found = self.store.find(&self.tenant_id, query).await?;
        Ok(apply_filter_sort_page(found, &page))
    }

    /// `/get-objects-parsed` — same as raw, with `data` deserialized.
    /// A blob that fails to parse yields `data = None` rather than an
    /// error for that row.
    pub async fn get_objects_parsed(
        &self,
        query: EntityQuery,
        page: FilterSortPageOptions,
    ) -> Result<Vec<ParsedEntity>> {
        let entities = self.get_objects_raw(query, page).await?;
        Ok(entities
            .into_iter()
            .map(|e| ParsedEntity {
                entity_id: e.entity_id.clone(),
                entity_type: e.entity_type.clone(),
                data: e.parsed_data(),
                created_at: e.created_at,
                deleted_at: e.deleted_at,
            })
            .collect())
    }

    /// `/log` — non-string values are serialized. Buffered here and
    /// flushed by the Worker into a single `CommandStore::append_logs`
    /// call once the run ends, rather than round-tripping the store on
    /// every call.
    pub async fn log(&self, at: DateTime<Utc>, message: impl Into<LogInput>) {
        let lines = message.into().into_lines();
        let mut logs = self.logs.lock().await;
        for line in lines {
            logs.push((at, line));
        }
    }

    pub async fn drain_logs(&self) -> Vec<(DateTime<Utc>, String)> {
        std::mem::take(&mut *self.logs.lock().await)
    }

    /// `/disable` — raises `COMMAND_DISABLED`. Idempotent: only the
    /// first call wins, matching "raises a control signal that
    /// terminates the program."
    pub fn disable(&self, reason: impl Into<String>) {
        let _ = self
            .control_signal
            .set(ControlSignal::CommandDisabled { reason: reason.into() });
    }

    /// `/set-next-run-at` — raises `NEXT_RUN_SET`.
    pub fn set_next_run_at(&self, instant: DateTime<Utc>, reason: impl Into<String>) {
        let _ = self.control_signal.set(ControlSignal::NextRunSet {
            instant,
            reason: reason.into(),
        });
    }

    pub fn control_signal(&self) -> Option<&ControlSignal> {
        self.control_signal.get()
    }
}

/// Accepts either a single message or an array of messages for `/log`;
/// non-strings are serialized to JSON text.
pub enum LogInput {
    One(String),
    Many(Vec<String>),
}

impl LogInput {
    fn into_lines(self) -> Vec<String> {
        match self {
            LogInput::One(s) => vec![s],
            LogInput::Many(v) => v,
        }
    }
}

impl From<&str> for LogInput {
    fn from(s: &str) -> Self {
        LogInput::One(s.to_string())
    }
}

impl From<String> for LogInput {
    fn from(s: String) -> Self {
        LogInput::One(s)
    }
}

impl From<Value> for LogInput {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => LogInput::One(s),
            Value::Array(items) => LogInput::Many(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            other => LogInput::One(other.to_string()),
        }
    }
}

/// Builds a table bound to `(tenant_id, user_id, source, cmd_id)`
/// (spec §2.8).
pub struct EffectTableBuilder {
    store: Arc<dyn EntityStore>,
    passthrough: PassthroughPorts,
}

impl EffectTableBuilder {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            passthrough: PassthroughPorts::default(),
        }
    }

    pub fn with_passthrough(mut self, passthrough: PassthroughPorts) -> Self {
        self.passthrough = passthrough;
        self
    }

    pub fn build(
        &self,
        tenant_id: TenantId,
        user_id: String,
        source: String,
        cmd_id: uuid::Uuid,
    ) -> EffectTable {
        EffectTable::new(
            tenant_id,
            user_id,
            source,
            cmd_id,
            self.store.clone(),
            self.passthrough.clone(),
        )
    }
}
