//! Versioned template store: create, version, compile, diff, and impact
//! analysis over the `ApprovalStore` repository.

use crate::error::ApprovalError;
use crate::lifecycle::{LifecycleManager, TransitionRef};
use crate::storage::ApprovalStore;
use crate::template::{
    compile_template, validate_template, ApprovalTemplate, CompiledTemplate, RoutingRule,
    TemplateStage, ValidationReport,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Author input for a brand new template code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTemplate {
    pub tenant_id: String,
    pub code: String,
    pub name: String,
    pub stages: Vec<TemplateStage>,
    pub rules: Vec<RoutingRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// Author input for a template update. Unset fields are copied from the
/// current active version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<TemplateStage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<RoutingRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// Field-level difference between two template versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDiff {
    pub code: String,
    pub from_version: u32,
    pub to_version: u32,
    pub name_changed: bool,
    pub added_stages: Vec<u32>,
    pub removed_stages: Vec<u32>,
    pub changed_stages: Vec<u32>,
    pub added_rules: Vec<String>,
    pub removed_rules: Vec<String>,
    pub changed_rules: Vec<String>,
    /// Whether the compiled content hash differs between the versions.
    pub hash_changed: bool,
}

/// Which lifecycle transitions and open instances a template change
/// would touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactReport {
    pub code: String,
    pub active_version: u32,
    pub referencing_transitions: Vec<TransitionRef>,
    pub open_instances: u64,
}

/// Append-only versioned template operations.
pub struct TemplateStore {
    store: Arc<dyn ApprovalStore>,
    lifecycle: Arc<dyn LifecycleManager>,
}

impl TemplateStore {
    pub fn new(store: Arc<dyn ApprovalStore>, lifecycle: Arc<dyn LifecycleManager>) -> Self {
        Self { store, lifecycle }
    }

    /// Create version 1 of a new template code.
    pub async fn create(&self, input: NewTemplate) -> Result<ApprovalTemplate, ApprovalError> {
        let mut template = ApprovalTemplate::new(
            input.tenant_id,
            input.code,
            input.name,
            input.stages,
            input.rules,
        );
        template.created_by = input.author;
        self.store.insert_template(&template).await?;
        tracing::info!(
            template_id = %template.id,
            code = %template.code,
            "approval template created"
        );
        Ok(template)
    }

    /// Fetch by id first, then fall back to the active version by code.
    pub async fn get(
        &self,
        tenant_id: &str,
        id_or_code: &str,
    ) -> Result<Option<ApprovalTemplate>, ApprovalError> {
        if let Some(template) = self.store.find_template(tenant_id, id_or_code).await? {
            return Ok(Some(template));
        }
        self.store.find_active_template(tenant_id, id_or_code).await
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ApprovalTemplate>, usize), ApprovalError> {
        self.store
            .list_active_templates(tenant_id, offset, limit)
            .await
    }

    /// Update always creates a new version: the current active version is
    /// deactivated and its stages/rules carried over unless overridden.
    pub async fn update(
        &self,
        tenant_id: &str,
        code: &str,
        update: TemplateUpdate,
    ) -> Result<ApprovalTemplate, ApprovalError> {
        let current = self
            .store
            .find_active_template(tenant_id, code)
            .await?
            .ok_or_else(|| ApprovalError::TemplateNotFound(code.to_string()))?;

        let next = ApprovalTemplate {
            id: Uuid::new_v4().to_string(),
            tenant_id: current.tenant_id.clone(),
            code: current.code.clone(),
            name: update.name.unwrap_or_else(|| current.name.clone()),
            version_no: current.version_no + 1,
            is_active: true,
            stages: update.stages.unwrap_or_else(|| current.stages.clone()),
            rules: update.rules.unwrap_or_else(|| current.rules.clone()),
            compiled_hash: None,
            compiled: None,
            created_by: update.author,
            created_at: Utc::now(),
        };

        self.store.deactivate_template(tenant_id, &current.id).await?;
        self.store.insert_template(&next).await?;
        tracing::info!(
            code = %next.code,
            version_no = next.version_no,
            "approval template version created"
        );
        Ok(next)
    }

    /// Destructive: removes every version of the code.
    pub async fn delete(&self, tenant_id: &str, code: &str) -> Result<u64, ApprovalError> {
        let removed = self.store.delete_templates_by_code(tenant_id, code).await?;
        if removed > 0 {
            tracing::warn!(code, removed, "approval template deleted (all versions)");
        }
        Ok(removed)
    }

    pub async fn validate(
        &self,
        tenant_id: &str,
        id_or_code: &str,
    ) -> Result<ValidationReport, ApprovalError> {
        let template = self
            .get(tenant_id, id_or_code)
            .await?
            .ok_or_else(|| ApprovalError::TemplateNotFound(id_or_code.to_string()))?;
        Ok(validate_template(&template))
    }

    /// Compile and persist the artifact + hash on the template row.
    pub async fn compile(
        &self,
        tenant_id: &str,
        id_or_code: &str,
    ) -> Result<CompiledTemplate, ApprovalError> {
        let template = self
            .get(tenant_id, id_or_code)
            .await?
            .ok_or_else(|| ApprovalError::TemplateNotFound(id_or_code.to_string()))?;

        let artifact = compile_template(&template);
        self.store
            .store_compiled(tenant_id, &template.id, &artifact)
            .await?;
        Ok(artifact)
    }

    pub async fn list_versions(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Vec<ApprovalTemplate>, ApprovalError> {
        self.store.list_template_versions(tenant_id, code).await
    }

    /// Roll back by cloning an old version as a NEW version. The old row
    /// is never reactivated, so version numbers stay monotone.
    pub async fn rollback(
        &self,
        tenant_id: &str,
        code: &str,
        target_version: u32,
    ) -> Result<ApprovalTemplate, ApprovalError> {
        let versions = self.store.list_template_versions(tenant_id, code).await?;
        let target = versions
            .iter()
            .find(|t| t.version_no == target_version)
            .ok_or_else(|| {
                ApprovalError::TemplateNotFound(format!("{code}@v{target_version}"))
            })?
            .clone();

        self.update(
            tenant_id,
            code,
            TemplateUpdate {
                name: Some(target.name),
                stages: Some(target.stages),
                rules: Some(target.rules),
                author: None,
            },
        )
        .await
    }

    /// Structural diff between two versions of a code.
    pub async fn diff(
        &self,
        tenant_id: &str,
        code: &str,
        from_version: u32,
        to_version: u32,
    ) -> Result<TemplateDiff, ApprovalError> {
        let versions = self.store.list_template_versions(tenant_id, code).await?;
        let from = versions
            .iter()
            .find(|t| t.version_no == from_version)
            .ok_or_else(|| ApprovalError::TemplateNotFound(format!("{code}@v{from_version}")))?;
        let to = versions
            .iter()
            .find(|t| t.version_no == to_version)
            .ok_or_else(|| ApprovalError::TemplateNotFound(format!("{code}@v{to_version}")))?;

        let mut added_stages = Vec::new();
        let mut removed_stages = Vec::new();
        let mut changed_stages = Vec::new();
        for stage in &to.stages {
            match from.stages.iter().find(|s| s.stage_no == stage.stage_no) {
                None => added_stages.push(stage.stage_no),
                Some(old) if old != stage => changed_stages.push(stage.stage_no),
                Some(_) => {}
            }
        }
        for stage in &from.stages {
            if !to.stages.iter().any(|s| s.stage_no == stage.stage_no) {
                removed_stages.push(stage.stage_no);
            }
        }

        let mut added_rules = Vec::new();
        let mut removed_rules = Vec::new();
        let mut changed_rules = Vec::new();
        for rule in &to.rules {
            match from.rules.iter().find(|r| r.id == rule.id) {
                None => added_rules.push(rule.id.clone()),
                Some(old) if old != rule => changed_rules.push(rule.id.clone()),
                Some(_) => {}
            }
        }
        for rule in &from.rules {
            if !to.rules.iter().any(|r| r.id == rule.id) {
                removed_rules.push(rule.id.clone());
            }
        }

        let hash_changed =
            compile_template(from).compiled_hash != compile_template(to).compiled_hash;

        Ok(TemplateDiff {
            code: code.to_string(),
            from_version,
            to_version,
            name_changed: from.name != to.name,
            added_stages,
            removed_stages,
            changed_stages,
            added_rules,
            removed_rules,
            changed_rules,
            hash_changed,
        })
    }

    /// Which lifecycle transitions reference this template, plus how many
    /// open instances currently run on it.
    pub async fn impact_analysis(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<ImpactReport, ApprovalError> {
        let active = self
            .store
            .find_active_template(tenant_id, code)
            .await?
            .ok_or_else(|| ApprovalError::TemplateNotFound(code.to_string()))?;

        let referencing_transitions = self
            .lifecycle
            .transitions_referencing(tenant_id, code)
            .await?;
        let open_instances = self
            .store
            .count_open_instances_for_template(tenant_id, &active.id)
            .await?;

        Ok(ImpactReport {
            code: code.to_string(),
            active_version: active.version_no,
            referencing_transitions,
            open_instances,
        })
    }
}
