//! Persistence boundary: the narrow repository surface the engine needs,
//! with an in-process backend and a PostgreSQL backend.
//!
//! Backend selection mirrors service configuration: memory for local
//! runs and tests, postgres for durable deployments.

use crate::error::ApprovalError;
use crate::events::ApprovalEvent;
use crate::postgres::PostgresStore;
use crate::template::{ApprovalTemplate, CompiledTemplate};
use crate::types::{
    ApprovalEscalation, ApprovalInstance, ApprovalTask, AssignmentSnapshot, InstanceStage,
    InstanceStatus, TaskStatus,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage backend configuration.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Keep all approval records in process memory only.
    Memory,
    /// Persist all records in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Build the configured storage backend.
pub async fn bootstrap_store(
    config: StorageConfig,
) -> Result<Arc<dyn ApprovalStore>, ApprovalError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresStore::connect(&database_url, max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Repository surface for approval records.
///
/// Implementations must enforce two constraints the engine relies on:
/// at most one open instance per `(tenant_id, entity_name, entity_id)`
/// on insert, and compare-and-swap semantics on instance updates.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    // ── Templates ────────────────────────────────────────────────────

    async fn insert_template(&self, template: &ApprovalTemplate) -> Result<(), ApprovalError>;

    async fn find_template(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ApprovalTemplate>, ApprovalError>;

    async fn find_active_template(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<ApprovalTemplate>, ApprovalError>;

    /// Active versions only, ordered by code, with the total count.
    async fn list_active_templates(
        &self,
        tenant_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ApprovalTemplate>, usize), ApprovalError>;

    /// Every version of a code, ascending by version number.
    async fn list_template_versions(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Vec<ApprovalTemplate>, ApprovalError>;

    async fn deactivate_template(&self, tenant_id: &str, id: &str) -> Result<(), ApprovalError>;

    /// Destructive: removes every version of a code. Returns the number
    /// of versions removed.
    async fn delete_templates_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<u64, ApprovalError>;

    async fn store_compiled(
        &self,
        tenant_id: &str,
        id: &str,
        artifact: &CompiledTemplate,
    ) -> Result<(), ApprovalError>;

    // ── Instances ────────────────────────────────────────────────────

    async fn insert_instance(&self, instance: &ApprovalInstance) -> Result<(), ApprovalError>;

    async fn find_instance(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ApprovalInstance>, ApprovalError>;

    /// Compare-and-swap update: fails with `ConcurrencyConflict` unless
    /// the stored version equals `expected_version`.
    async fn update_instance(
        &self,
        instance: &ApprovalInstance,
        expected_version: u64,
    ) -> Result<(), ApprovalError>;

    async fn count_open_instances_for_template(
        &self,
        tenant_id: &str,
        template_id: &str,
    ) -> Result<u64, ApprovalError>;

    // ── Stages ───────────────────────────────────────────────────────

    async fn insert_stage(&self, stage: &InstanceStage) -> Result<(), ApprovalError>;

    async fn update_stage(&self, stage: &InstanceStage) -> Result<(), ApprovalError>;

    /// All stages of an instance, ascending by stage number.
    async fn list_stages(&self, instance_id: &str) -> Result<Vec<InstanceStage>, ApprovalError>;

    // ── Tasks ────────────────────────────────────────────────────────

    async fn insert_task(&self, task: &ApprovalTask) -> Result<(), ApprovalError>;

    async fn find_task(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ApprovalTask>, ApprovalError>;

    async fn update_task(&self, task: &ApprovalTask) -> Result<(), ApprovalError>;

    async fn list_stage_tasks(&self, stage_id: &str) -> Result<Vec<ApprovalTask>, ApprovalError>;

    async fn list_instance_tasks(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ApprovalTask>, ApprovalError>;

    /// All pending tasks for a tenant (timer rehydration scan).
    async fn list_pending_tasks(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<ApprovalTask>, ApprovalError>;

    // ── Snapshots / events / escalations ─────────────────────────────

    async fn insert_snapshot(&self, snapshot: &AssignmentSnapshot) -> Result<(), ApprovalError>;

    async fn find_snapshot_for_task(
        &self,
        task_id: &str,
    ) -> Result<Option<AssignmentSnapshot>, ApprovalError>;

    async fn append_event(&self, event: &ApprovalEvent) -> Result<(), ApprovalError>;

    async fn list_events(&self, instance_id: &str) -> Result<Vec<ApprovalEvent>, ApprovalError>;

    async fn insert_escalation(
        &self,
        escalation: &ApprovalEscalation,
    ) -> Result<(), ApprovalError>;

    async fn list_escalations(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ApprovalEscalation>, ApprovalError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    templates: HashMap<String, ApprovalTemplate>,
    instances: HashMap<String, ApprovalInstance>,
    stages: HashMap<String, InstanceStage>,
    tasks: HashMap<String, ApprovalTask>,
    snapshots: Vec<AssignmentSnapshot>,
    events: Vec<ApprovalEvent>,
    escalations: Vec<ApprovalEscalation>,
}

/// In-process store used for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn insert_template(&self, template: &ApprovalTemplate) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        state
            .templates
            .insert(template.id.clone(), template.clone());
        Ok(())
    }

    async fn find_template(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ApprovalTemplate>, ApprovalError> {
        let state = self.state.read().await;
        Ok(state
            .templates
            .get(id)
            .filter(|t| t.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_active_template(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<ApprovalTemplate>, ApprovalError> {
        let state = self.state.read().await;
        Ok(state
            .templates
            .values()
            .find(|t| t.tenant_id == tenant_id && t.code == code && t.is_active)
            .cloned())
    }

    async fn list_active_templates(
        &self,
        tenant_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ApprovalTemplate>, usize), ApprovalError> {
        let state = self.state.read().await;
        let mut active: Vec<ApprovalTemplate> = state
            .templates
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.code.cmp(&b.code));
        let total = active.len();
        let page = active.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn list_template_versions(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Vec<ApprovalTemplate>, ApprovalError> {
        let state = self.state.read().await;
        let mut versions: Vec<ApprovalTemplate> = state
            .templates
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.code == code)
            .cloned()
            .collect();
        versions.sort_by_key(|t| t.version_no);
        Ok(versions)
    }

    async fn deactivate_template(&self, tenant_id: &str, id: &str) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        match state.templates.get_mut(id) {
            Some(template) if template.tenant_id == tenant_id => {
                template.is_active = false;
                Ok(())
            }
            _ => Err(ApprovalError::TemplateNotFound(id.to_string())),
        }
    }

    async fn delete_templates_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<u64, ApprovalError> {
        let mut state = self.state.write().await;
        let before = state.templates.len();
        state
            .templates
            .retain(|_, t| !(t.tenant_id == tenant_id && t.code == code));
        Ok((before - state.templates.len()) as u64)
    }

    async fn store_compiled(
        &self,
        tenant_id: &str,
        id: &str,
        artifact: &CompiledTemplate,
    ) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        match state.templates.get_mut(id) {
            Some(template) if template.tenant_id == tenant_id => {
                template.compiled_hash = Some(artifact.compiled_hash.clone());
                template.compiled = Some(artifact.clone());
                Ok(())
            }
            _ => Err(ApprovalError::TemplateNotFound(id.to_string())),
        }
    }

    async fn insert_instance(&self, instance: &ApprovalInstance) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        let duplicate = state.instances.values().any(|existing| {
            existing.tenant_id == instance.tenant_id
                && existing.entity_name == instance.entity_name
                && existing.entity_id == instance.entity_id
                && existing.status == InstanceStatus::Open
        });
        if duplicate {
            return Err(ApprovalError::DuplicateInstance {
                entity_name: instance.entity_name.clone(),
                entity_id: instance.entity_id.clone(),
            });
        }
        state.instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn find_instance(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ApprovalInstance>, ApprovalError> {
        let state = self.state.read().await;
        Ok(state
            .instances
            .get(id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned())
    }

    async fn update_instance(
        &self,
        instance: &ApprovalInstance,
        expected_version: u64,
    ) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        let stored = state
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| ApprovalError::InstanceNotFound(instance.id.clone()))?;
        if stored.version != expected_version {
            return Err(ApprovalError::conflict(
                instance.id.clone(),
                expected_version,
                stored.version,
            ));
        }
        *stored = instance.clone();
        Ok(())
    }

    async fn count_open_instances_for_template(
        &self,
        tenant_id: &str,
        template_id: &str,
    ) -> Result<u64, ApprovalError> {
        let state = self.state.read().await;
        Ok(state
            .instances
            .values()
            .filter(|i| {
                i.tenant_id == tenant_id
                    && i.template_id == template_id
                    && i.status == InstanceStatus::Open
            })
            .count() as u64)
    }

    async fn insert_stage(&self, stage: &InstanceStage) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        state.stages.insert(stage.id.clone(), stage.clone());
        Ok(())
    }

    async fn update_stage(&self, stage: &InstanceStage) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        state.stages.insert(stage.id.clone(), stage.clone());
        Ok(())
    }

    async fn list_stages(&self, instance_id: &str) -> Result<Vec<InstanceStage>, ApprovalError> {
        let state = self.state.read().await;
        let mut stages: Vec<InstanceStage> = state
            .stages
            .values()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.stage_no);
        Ok(stages)
    }

    async fn insert_task(&self, task: &ApprovalTask) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn find_task(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ApprovalTask>, ApprovalError> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .get(id)
            .filter(|t| t.tenant_id == tenant_id)
            .cloned())
    }

    async fn update_task(&self, task: &ApprovalTask) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn list_stage_tasks(&self, stage_id: &str) -> Result<Vec<ApprovalTask>, ApprovalError> {
        let state = self.state.read().await;
        let mut tasks: Vec<ApprovalTask> = state
            .tasks
            .values()
            .filter(|t| t.stage_id == stage_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn list_instance_tasks(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ApprovalTask>, ApprovalError> {
        let state = self.state.read().await;
        let mut tasks: Vec<ApprovalTask> = state
            .tasks
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.stage_no, t.created_at));
        Ok(tasks)
    }

    async fn list_pending_tasks(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<ApprovalTask>, ApprovalError> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }

    async fn insert_snapshot(&self, snapshot: &AssignmentSnapshot) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        state.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn find_snapshot_for_task(
        &self,
        task_id: &str,
    ) -> Result<Option<AssignmentSnapshot>, ApprovalError> {
        let state = self.state.read().await;
        Ok(state
            .snapshots
            .iter()
            .find(|s| s.task_id == task_id)
            .cloned())
    }

    async fn append_event(&self, event: &ApprovalEvent) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        state.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, instance_id: &str) -> Result<Vec<ApprovalEvent>, ApprovalError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn insert_escalation(
        &self,
        escalation: &ApprovalEscalation,
    ) -> Result<(), ApprovalError> {
        let mut state = self.state.write().await;
        state.escalations.push(escalation.clone());
        Ok(())
    }

    async fn list_escalations(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ApprovalEscalation>, ApprovalError> {
        let state = self.state.read().await;
        Ok(state
            .escalations
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect())
    }
}
