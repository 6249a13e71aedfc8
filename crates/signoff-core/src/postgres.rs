//! PostgreSQL backend for the approval store.
//!
//! Schema is owned by the application and created idempotently at
//! bootstrap. Structured fields (stages, rules, contexts, payloads) are
//! persisted as JSONB; the open-instance uniqueness constraint and the
//! instance version CAS live here, at the store boundary.

use crate::error::ApprovalError;
use crate::events::ApprovalEvent;
use crate::storage::ApprovalStore;
use crate::template::{ApprovalTemplate, CompiledTemplate};
use crate::types::{
    ApprovalEscalation, ApprovalInstance, ApprovalTask, AssignmentSnapshot, CancelReason,
    InstanceStage, InstanceStatus, StageStatus, TaskStatus,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, ApprovalError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| ApprovalError::Storage(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), ApprovalError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS approval_templates (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                version_no INT NOT NULL,
                is_active BOOLEAN NOT NULL,
                stages JSONB NOT NULL,
                rules JSONB NOT NULL,
                compiled_hash TEXT NULL,
                compiled JSONB NULL,
                created_by TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_templates_tenant_code ON approval_templates (tenant_id, code)",
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_templates_active ON approval_templates (tenant_id, code) WHERE is_active",
            r#"
            CREATE TABLE IF NOT EXISTS approval_instances (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                entity_name TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                transition_id TEXT NULL,
                template_id TEXT NOT NULL,
                requester TEXT NULL,
                context JSONB NOT NULL,
                status TEXT NOT NULL,
                cancel_reason TEXT NULL,
                on_hold BOOLEAN NOT NULL,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ NULL
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_instances_open_entity ON approval_instances (tenant_id, entity_name, entity_id) WHERE status = 'open'",
            "CREATE INDEX IF NOT EXISTS idx_instances_template ON approval_instances (tenant_id, template_id)",
            r#"
            CREATE TABLE IF NOT EXISTS approval_stages (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                stage_no INT NOT NULL,
                mode TEXT NOT NULL,
                quorum JSONB NULL,
                sla_secs BIGINT NULL,
                status TEXT NOT NULL,
                activated_at TIMESTAMPTZ NULL,
                closed_at TIMESTAMPTZ NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_stages_instance ON approval_stages (instance_id)",
            r#"
            CREATE TABLE IF NOT EXISTS approval_tasks (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                stage_id TEXT NOT NULL,
                stage_no INT NOT NULL,
                approver_id TEXT NOT NULL,
                original_approver_id TEXT NOT NULL,
                status TEXT NOT NULL,
                decided_at TIMESTAMPTZ NULL,
                decided_by TEXT NULL,
                decision_note TEXT NULL,
                due_at TIMESTAMPTZ NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tasks_stage ON approval_tasks (stage_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_pending ON approval_tasks (tenant_id, status)",
            r#"
            CREATE TABLE IF NOT EXISTS approval_snapshots (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                resolved_assignment JSONB NOT NULL,
                resolved_from_rule_id TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_snapshots_task ON approval_snapshots (task_id)",
            r#"
            CREATE TABLE IF NOT EXISTS approval_events (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_events_instance ON approval_events (instance_id, occurred_at)",
            r#"
            CREATE TABLE IF NOT EXISTS approval_escalations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                escalated_to TEXT NULL,
                reason TEXT NULL,
                occurred_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_escalations_instance ON approval_escalations (instance_id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| ApprovalError::Storage(format!("postgres schema create failed: {e}")))?;
        }

        Ok(())
    }
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, ApprovalError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| ApprovalError::Storage(format!("postgres decode {name} failed: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ApprovalError> {
    serde_json::to_value(value).map_err(|e| ApprovalError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ApprovalError> {
    serde_json::from_value(value).map_err(|e| ApprovalError::Serialization(e.to_string()))
}

fn instance_status_to_str(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Open => "open",
        InstanceStatus::Completed => "completed",
        InstanceStatus::Canceled => "canceled",
    }
}

fn parse_instance_status(value: &str) -> Result<InstanceStatus, ApprovalError> {
    match value {
        "open" => Ok(InstanceStatus::Open),
        "completed" => Ok(InstanceStatus::Completed),
        "canceled" => Ok(InstanceStatus::Canceled),
        other => Err(ApprovalError::Storage(format!(
            "unknown instance status '{other}' in postgres"
        ))),
    }
}

fn cancel_reason_to_str(reason: CancelReason) -> &'static str {
    match reason {
        CancelReason::Rejected => "rejected",
        CancelReason::Recalled => "recalled",
        CancelReason::Withdrawn => "withdrawn",
        CancelReason::Administrative => "administrative",
    }
}

fn parse_cancel_reason(value: &str) -> Result<CancelReason, ApprovalError> {
    match value {
        "rejected" => Ok(CancelReason::Rejected),
        "recalled" => Ok(CancelReason::Recalled),
        "withdrawn" => Ok(CancelReason::Withdrawn),
        "administrative" => Ok(CancelReason::Administrative),
        other => Err(ApprovalError::Storage(format!(
            "unknown cancel reason '{other}' in postgres"
        ))),
    }
}

fn stage_status_to_str(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => "pending",
        StageStatus::Open => "open",
        StageStatus::Completed => "completed",
        StageStatus::Canceled => "canceled",
        StageStatus::Skipped => "skipped",
    }
}

fn parse_stage_status(value: &str) -> Result<StageStatus, ApprovalError> {
    match value {
        "pending" => Ok(StageStatus::Pending),
        "open" => Ok(StageStatus::Open),
        "completed" => Ok(StageStatus::Completed),
        "canceled" => Ok(StageStatus::Canceled),
        "skipped" => Ok(StageStatus::Skipped),
        other => Err(ApprovalError::Storage(format!(
            "unknown stage status '{other}' in postgres"
        ))),
    }
}

fn task_status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Approved => "approved",
        TaskStatus::Rejected => "rejected",
        TaskStatus::Canceled => "canceled",
    }
}

fn parse_task_status(value: &str) -> Result<TaskStatus, ApprovalError> {
    match value {
        "pending" => Ok(TaskStatus::Pending),
        "approved" => Ok(TaskStatus::Approved),
        "rejected" => Ok(TaskStatus::Rejected),
        "canceled" => Ok(TaskStatus::Canceled),
        other => Err(ApprovalError::Storage(format!(
            "unknown task status '{other}' in postgres"
        ))),
    }
}

fn stage_mode_to_str(mode: crate::template::StageMode) -> &'static str {
    match mode {
        crate::template::StageMode::Serial => "serial",
        crate::template::StageMode::Parallel => "parallel",
    }
}

fn parse_stage_mode(value: &str) -> Result<crate::template::StageMode, ApprovalError> {
    match value {
        "serial" => Ok(crate::template::StageMode::Serial),
        "parallel" => Ok(crate::template::StageMode::Parallel),
        other => Err(ApprovalError::Storage(format!(
            "unknown stage mode '{other}' in postgres"
        ))),
    }
}

fn decode_template(row: &PgRow) -> Result<ApprovalTemplate, ApprovalError> {
    let version_no: i32 = col(row, "version_no")?;
    let compiled: Option<Value> = col(row, "compiled")?;
    Ok(ApprovalTemplate {
        id: col(row, "id")?,
        tenant_id: col(row, "tenant_id")?,
        code: col(row, "code")?,
        name: col(row, "name")?,
        version_no: version_no
            .try_into()
            .map_err(|_| ApprovalError::Storage("negative template version in storage".to_string()))?,
        is_active: col(row, "is_active")?,
        stages: from_json(col(row, "stages")?)?,
        rules: from_json(col(row, "rules")?)?,
        compiled_hash: col(row, "compiled_hash")?,
        compiled: compiled.map(from_json).transpose()?,
        created_by: col(row, "created_by")?,
        created_at: col(row, "created_at")?,
    })
}

fn decode_instance(row: &PgRow) -> Result<ApprovalInstance, ApprovalError> {
    let status: String = col(row, "status")?;
    let cancel_reason: Option<String> = col(row, "cancel_reason")?;
    let version: i64 = col(row, "version")?;
    Ok(ApprovalInstance {
        id: col(row, "id")?,
        tenant_id: col(row, "tenant_id")?,
        entity_name: col(row, "entity_name")?,
        entity_id: col(row, "entity_id")?,
        transition_id: col(row, "transition_id")?,
        template_id: col(row, "template_id")?,
        requester: col(row, "requester")?,
        context: col(row, "context")?,
        status: parse_instance_status(&status)?,
        cancel_reason: cancel_reason
            .as_deref()
            .map(parse_cancel_reason)
            .transpose()?,
        on_hold: col(row, "on_hold")?,
        version: version
            .try_into()
            .map_err(|_| ApprovalError::Storage("negative instance version in storage".to_string()))?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
        completed_at: col(row, "completed_at")?,
    })
}

fn decode_stage(row: &PgRow) -> Result<InstanceStage, ApprovalError> {
    let mode: String = col(row, "mode")?;
    let status: String = col(row, "status")?;
    let stage_no: i32 = col(row, "stage_no")?;
    let quorum: Option<Value> = col(row, "quorum")?;
    let sla_secs: Option<i64> = col(row, "sla_secs")?;
    Ok(InstanceStage {
        id: col(row, "id")?,
        instance_id: col(row, "instance_id")?,
        stage_no: stage_no
            .try_into()
            .map_err(|_| ApprovalError::Storage("negative stage number in storage".to_string()))?,
        mode: parse_stage_mode(&mode)?,
        quorum: quorum.map(from_json).transpose()?,
        sla_secs: sla_secs
            .map(|v| {
                v.try_into().map_err(|_| {
                    ApprovalError::Storage("negative sla window in storage".to_string())
                })
            })
            .transpose()?,
        status: parse_stage_status(&status)?,
        activated_at: col(row, "activated_at")?,
        closed_at: col(row, "closed_at")?,
    })
}

fn decode_task(row: &PgRow) -> Result<ApprovalTask, ApprovalError> {
    let status: String = col(row, "status")?;
    let stage_no: i32 = col(row, "stage_no")?;
    Ok(ApprovalTask {
        id: col(row, "id")?,
        tenant_id: col(row, "tenant_id")?,
        instance_id: col(row, "instance_id")?,
        stage_id: col(row, "stage_id")?,
        stage_no: stage_no
            .try_into()
            .map_err(|_| ApprovalError::Storage("negative stage number in storage".to_string()))?,
        approver_id: col(row, "approver_id")?,
        original_approver_id: col(row, "original_approver_id")?,
        status: parse_task_status(&status)?,
        decided_at: col(row, "decided_at")?,
        decided_by: col(row, "decided_by")?,
        decision_note: col(row, "decision_note")?,
        due_at: col(row, "due_at")?,
        created_at: col(row, "created_at")?,
    })
}

fn decode_snapshot(row: &PgRow) -> Result<AssignmentSnapshot, ApprovalError> {
    Ok(AssignmentSnapshot {
        id: col(row, "id")?,
        task_id: col(row, "task_id")?,
        instance_id: col(row, "instance_id")?,
        resolved_assignment: col(row, "resolved_assignment")?,
        resolved_from_rule_id: col(row, "resolved_from_rule_id")?,
        created_at: col(row, "created_at")?,
    })
}

fn decode_event(row: &PgRow) -> Result<ApprovalEvent, ApprovalError> {
    Ok(ApprovalEvent {
        id: col(row, "id")?,
        tenant_id: col(row, "tenant_id")?,
        instance_id: col(row, "instance_id")?,
        event_type: col(row, "event_type")?,
        payload: col(row, "payload")?,
        occurred_at: col(row, "occurred_at")?,
    })
}

fn decode_escalation(row: &PgRow) -> Result<ApprovalEscalation, ApprovalError> {
    Ok(ApprovalEscalation {
        id: col(row, "id")?,
        tenant_id: col(row, "tenant_id")?,
        instance_id: col(row, "instance_id")?,
        task_id: col(row, "task_id")?,
        escalated_to: col(row, "escalated_to")?,
        reason: col(row, "reason")?,
        occurred_at: col(row, "occurred_at")?,
    })
}

fn storage_err(context: &str) -> impl Fn(sqlx::Error) -> ApprovalError + '_ {
    move |e| ApprovalError::Storage(format!("postgres {context} failed: {e}"))
}

#[async_trait]
impl ApprovalStore for PostgresStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn insert_template(&self, template: &ApprovalTemplate) -> Result<(), ApprovalError> {
        let version_no: i32 = template.version_no.try_into().map_err(|_| {
            ApprovalError::Storage("template version exceeds postgres INT range".to_string())
        })?;
        sqlx::query(
            r#"
            INSERT INTO approval_templates (
                id, tenant_id, code, name, version_no, is_active,
                stages, rules, compiled_hash, compiled, created_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&template.id)
        .bind(&template.tenant_id)
        .bind(&template.code)
        .bind(&template.name)
        .bind(version_no)
        .bind(template.is_active)
        .bind(to_json(&template.stages)?)
        .bind(to_json(&template.rules)?)
        .bind(&template.compiled_hash)
        .bind(template.compiled.as_ref().map(to_json).transpose()?)
        .bind(&template.created_by)
        .bind(template.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("template insert"))?;

        Ok(())
    }

    async fn find_template(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ApprovalTemplate>, ApprovalError> {
        let row = sqlx::query("SELECT * FROM approval_templates WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("template select"))?;

        row.as_ref().map(decode_template).transpose()
    }

    async fn find_active_template(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<ApprovalTemplate>, ApprovalError> {
        let row = sqlx::query(
            "SELECT * FROM approval_templates WHERE tenant_id = $1 AND code = $2 AND is_active",
        )
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("active template select"))?;

        row.as_ref().map(decode_template).transpose()
    }

    async fn list_active_templates(
        &self,
        tenant_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ApprovalTemplate>, usize), ApprovalError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM approval_templates WHERE tenant_id = $1 AND is_active",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err("template count"))?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM approval_templates
            WHERE tenant_id = $1 AND is_active
            ORDER BY code ASC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(tenant_id)
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("template list"))?;

        let templates = rows
            .iter()
            .map(decode_template)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((templates, total as usize))
    }

    async fn list_template_versions(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Vec<ApprovalTemplate>, ApprovalError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM approval_templates
            WHERE tenant_id = $1 AND code = $2
            ORDER BY version_no ASC
            "#,
        )
        .bind(tenant_id)
        .bind(code)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("template versions"))?;

        rows.iter().map(decode_template).collect()
    }

    async fn deactivate_template(&self, tenant_id: &str, id: &str) -> Result<(), ApprovalError> {
        let result = sqlx::query(
            "UPDATE approval_templates SET is_active = FALSE WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err("template deactivate"))?;

        if result.rows_affected() == 0 {
            return Err(ApprovalError::TemplateNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_templates_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<u64, ApprovalError> {
        let result =
            sqlx::query("DELETE FROM approval_templates WHERE tenant_id = $1 AND code = $2")
                .bind(tenant_id)
                .bind(code)
                .execute(&self.pool)
                .await
                .map_err(storage_err("template delete"))?;

        Ok(result.rows_affected())
    }

    async fn store_compiled(
        &self,
        tenant_id: &str,
        id: &str,
        artifact: &CompiledTemplate,
    ) -> Result<(), ApprovalError> {
        let result = sqlx::query(
            r#"
            UPDATE approval_templates
            SET compiled_hash = $3, compiled = $4
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(&artifact.compiled_hash)
        .bind(to_json(artifact)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err("compiled artifact store"))?;

        if result.rows_affected() == 0 {
            return Err(ApprovalError::TemplateNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn insert_instance(&self, instance: &ApprovalInstance) -> Result<(), ApprovalError> {
        let version: i64 = instance.version.try_into().map_err(|_| {
            ApprovalError::Storage("instance version exceeds postgres BIGINT range".to_string())
        })?;
        let result = sqlx::query(
            r#"
            INSERT INTO approval_instances (
                id, tenant_id, entity_name, entity_id, transition_id, template_id,
                requester, context, status, cancel_reason, on_hold, version,
                created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.tenant_id)
        .bind(&instance.entity_name)
        .bind(&instance.entity_id)
        .bind(&instance.transition_id)
        .bind(&instance.template_id)
        .bind(&instance.requester)
        .bind(&instance.context)
        .bind(instance_status_to_str(instance.status))
        .bind(instance.cancel_reason.map(cancel_reason_to_str))
        .bind(instance.on_hold)
        .bind(version)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let unique = e
                    .as_database_error()
                    .map(|db| matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation))
                    .unwrap_or(false);
                if unique {
                    Err(ApprovalError::DuplicateInstance {
                        entity_name: instance.entity_name.clone(),
                        entity_id: instance.entity_id.clone(),
                    })
                } else {
                    Err(ApprovalError::Storage(format!(
                        "postgres instance insert failed: {e}"
                    )))
                }
            }
        }
    }

    async fn find_instance(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ApprovalInstance>, ApprovalError> {
        let row = sqlx::query("SELECT * FROM approval_instances WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("instance select"))?;

        row.as_ref().map(decode_instance).transpose()
    }

    async fn update_instance(
        &self,
        instance: &ApprovalInstance,
        expected_version: u64,
    ) -> Result<(), ApprovalError> {
        let expected: i64 = expected_version.try_into().map_err(|_| {
            ApprovalError::Storage("instance version exceeds postgres BIGINT range".to_string())
        })?;
        let new_version: i64 = instance.version.try_into().map_err(|_| {
            ApprovalError::Storage("instance version exceeds postgres BIGINT range".to_string())
        })?;

        let result = sqlx::query(
            r#"
            UPDATE approval_instances
            SET status = $3, cancel_reason = $4, on_hold = $5, version = $6,
                updated_at = $7, completed_at = $8
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(&instance.id)
        .bind(expected)
        .bind(instance_status_to_str(instance.status))
        .bind(instance.cancel_reason.map(cancel_reason_to_str))
        .bind(instance.on_hold)
        .bind(new_version)
        .bind(instance.updated_at)
        .bind(instance.completed_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("instance update"))?;

        if result.rows_affected() == 0 {
            // Distinguish a concurrent write from a missing row.
            let found: Option<i64> =
                sqlx::query_scalar("SELECT version FROM approval_instances WHERE id = $1")
                    .bind(&instance.id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(storage_err("instance version probe"))?;

            return match found {
                Some(version) => Err(ApprovalError::conflict(
                    instance.id.clone(),
                    expected_version,
                    version as u64,
                )),
                None => Err(ApprovalError::InstanceNotFound(instance.id.clone())),
            };
        }

        Ok(())
    }

    async fn count_open_instances_for_template(
        &self,
        tenant_id: &str,
        template_id: &str,
    ) -> Result<u64, ApprovalError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM approval_instances
            WHERE tenant_id = $1 AND template_id = $2 AND status = 'open'
            "#,
        )
        .bind(tenant_id)
        .bind(template_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err("open instance count"))?;

        Ok(count as u64)
    }

    async fn insert_stage(&self, stage: &InstanceStage) -> Result<(), ApprovalError> {
        sqlx::query(
            r#"
            INSERT INTO approval_stages (
                id, instance_id, stage_no, mode, quorum, sla_secs,
                status, activated_at, closed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&stage.id)
        .bind(&stage.instance_id)
        .bind(stage.stage_no as i32)
        .bind(stage_mode_to_str(stage.mode))
        .bind(stage.quorum.as_ref().map(to_json).transpose()?)
        .bind(stage.sla_secs.map(|v| v as i64))
        .bind(stage_status_to_str(stage.status))
        .bind(stage.activated_at)
        .bind(stage.closed_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("stage insert"))?;

        Ok(())
    }

    async fn update_stage(&self, stage: &InstanceStage) -> Result<(), ApprovalError> {
        sqlx::query(
            r#"
            UPDATE approval_stages
            SET status = $2, activated_at = $3, closed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(&stage.id)
        .bind(stage_status_to_str(stage.status))
        .bind(stage.activated_at)
        .bind(stage.closed_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("stage update"))?;

        Ok(())
    }

    async fn list_stages(&self, instance_id: &str) -> Result<Vec<InstanceStage>, ApprovalError> {
        let rows = sqlx::query(
            "SELECT * FROM approval_stages WHERE instance_id = $1 ORDER BY stage_no ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("stage list"))?;

        rows.iter().map(decode_stage).collect()
    }

    async fn insert_task(&self, task: &ApprovalTask) -> Result<(), ApprovalError> {
        sqlx::query(
            r#"
            INSERT INTO approval_tasks (
                id, tenant_id, instance_id, stage_id, stage_no, approver_id,
                original_approver_id, status, decided_at, decided_by,
                decision_note, due_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&task.id)
        .bind(&task.tenant_id)
        .bind(&task.instance_id)
        .bind(&task.stage_id)
        .bind(task.stage_no as i32)
        .bind(&task.approver_id)
        .bind(&task.original_approver_id)
        .bind(task_status_to_str(task.status))
        .bind(task.decided_at)
        .bind(&task.decided_by)
        .bind(&task.decision_note)
        .bind(task.due_at)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("task insert"))?;

        Ok(())
    }

    async fn find_task(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ApprovalTask>, ApprovalError> {
        let row = sqlx::query("SELECT * FROM approval_tasks WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("task select"))?;

        row.as_ref().map(decode_task).transpose()
    }

    async fn update_task(&self, task: &ApprovalTask) -> Result<(), ApprovalError> {
        sqlx::query(
            r#"
            UPDATE approval_tasks
            SET approver_id = $2, status = $3, decided_at = $4, decided_by = $5,
                decision_note = $6, due_at = $7
            WHERE id = $1
            "#,
        )
        .bind(&task.id)
        .bind(&task.approver_id)
        .bind(task_status_to_str(task.status))
        .bind(task.decided_at)
        .bind(&task.decided_by)
        .bind(&task.decision_note)
        .bind(task.due_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("task update"))?;

        Ok(())
    }

    async fn list_stage_tasks(&self, stage_id: &str) -> Result<Vec<ApprovalTask>, ApprovalError> {
        let rows =
            sqlx::query("SELECT * FROM approval_tasks WHERE stage_id = $1 ORDER BY created_at ASC")
                .bind(stage_id)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err("stage task list"))?;

        rows.iter().map(decode_task).collect()
    }

    async fn list_instance_tasks(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ApprovalTask>, ApprovalError> {
        let rows = sqlx::query(
            "SELECT * FROM approval_tasks WHERE instance_id = $1 ORDER BY stage_no, created_at ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("instance task list"))?;

        rows.iter().map(decode_task).collect()
    }

    async fn list_pending_tasks(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<ApprovalTask>, ApprovalError> {
        let rows = sqlx::query(
            "SELECT * FROM approval_tasks WHERE tenant_id = $1 AND status = 'pending'",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("pending task list"))?;

        rows.iter().map(decode_task).collect()
    }

    async fn insert_snapshot(&self, snapshot: &AssignmentSnapshot) -> Result<(), ApprovalError> {
        sqlx::query(
            r#"
            INSERT INTO approval_snapshots (
                id, task_id, instance_id, resolved_assignment,
                resolved_from_rule_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.task_id)
        .bind(&snapshot.instance_id)
        .bind(&snapshot.resolved_assignment)
        .bind(&snapshot.resolved_from_rule_id)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("snapshot insert"))?;

        Ok(())
    }

    async fn find_snapshot_for_task(
        &self,
        task_id: &str,
    ) -> Result<Option<AssignmentSnapshot>, ApprovalError> {
        let row = sqlx::query(
            "SELECT * FROM approval_snapshots WHERE task_id = $1 ORDER BY created_at ASC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("snapshot select"))?;

        row.as_ref().map(decode_snapshot).transpose()
    }

    async fn append_event(&self, event: &ApprovalEvent) -> Result<(), ApprovalError> {
        sqlx::query(
            r#"
            INSERT INTO approval_events (
                id, tenant_id, instance_id, event_type, payload, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&event.id)
        .bind(&event.tenant_id)
        .bind(&event.instance_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("event append"))?;

        Ok(())
    }

    async fn list_events(&self, instance_id: &str) -> Result<Vec<ApprovalEvent>, ApprovalError> {
        let rows = sqlx::query(
            "SELECT * FROM approval_events WHERE instance_id = $1 ORDER BY occurred_at ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("event list"))?;

        rows.iter().map(decode_event).collect()
    }

    async fn insert_escalation(
        &self,
        escalation: &ApprovalEscalation,
    ) -> Result<(), ApprovalError> {
        sqlx::query(
            r#"
            INSERT INTO approval_escalations (
                id, tenant_id, instance_id, task_id, escalated_to, reason, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&escalation.id)
        .bind(&escalation.tenant_id)
        .bind(&escalation.instance_id)
        .bind(&escalation.task_id)
        .bind(&escalation.escalated_to)
        .bind(&escalation.reason)
        .bind(escalation.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("escalation insert"))?;

        Ok(())
    }

    async fn list_escalations(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ApprovalEscalation>, ApprovalError> {
        let rows = sqlx::query(
            "SELECT * FROM approval_escalations WHERE instance_id = $1 ORDER BY occurred_at ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("escalation list"))?;

        rows.iter().map(decode_escalation).collect()
    }
}
