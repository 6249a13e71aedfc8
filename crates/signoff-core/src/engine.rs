//! The approval engine: one state machine for instance creation, stage
//! progression, and the full decision/action vocabulary.
//!
//! Every mutating action runs inside a per-instance advisory lock and
//! finishes with a compare-and-swap on the instance version, so the two
//! concurrency mechanisms the rest of the system relies on live in one
//! place.

use crate::error::ApprovalError;
use crate::events::{self, ApprovalEvent, ApprovalEventHandler};
use crate::lifecycle::{LifecycleManager, TransitionRequest};
use crate::resolver::{ApproverResolver, Resolution};
use crate::sla::SlaTimerService;
use crate::storage::ApprovalStore;
use crate::template::{ApprovalTemplate, Quorum, QuorumKind, StageMode};
use crate::types::{
    ActionOutcome, ActionRequest, ApprovalAction, ApprovalEscalation, ApprovalInstance,
    ApprovalTask, AssignmentSnapshot, CancelReason, CreateInstanceOutcome, CreateInstanceRequest,
    CreateStatus, Decision, InstanceStage, InstanceStatus, StageOutcome, StageStatus, TaskStatus,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an action waits for the per-instance lock.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Unified approval orchestration engine.
pub struct ApprovalEngine {
    store: Arc<dyn ApprovalStore>,
    resolver: ApproverResolver,
    sla: Arc<SlaTimerService>,
    lifecycle: Arc<dyn LifecycleManager>,
    handlers: RwLock<Vec<Arc<dyn ApprovalEventHandler>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    config: EngineConfig,
}

impl ApprovalEngine {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        resolver: ApproverResolver,
        sla: Arc<SlaTimerService>,
        lifecycle: Arc<dyn LifecycleManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            sla,
            lifecycle,
            handlers: RwLock::new(Vec::new()),
            locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Register an observer for persisted approval events. Handler
    /// failures are logged and never propagate.
    pub async fn register_handler(&self, handler: Arc<dyn ApprovalEventHandler>) {
        self.handlers.write().await.push(handler);
    }

    // ── Instance creation ────────────────────────────────────────────

    /// Create an approval instance from a template.
    ///
    /// Expected failures (missing template, nobody to assign, duplicate
    /// open instance) come back as outcome statuses; unexpected errors
    /// are folded into `Failed` so no error crosses this boundary.
    pub async fn create_instance(&self, request: CreateInstanceRequest) -> CreateInstanceOutcome {
        match self.create_instance_inner(request).await {
            Ok(outcome) => outcome,
            Err(ApprovalError::DuplicateInstance {
                entity_name,
                entity_id,
            }) => CreateInstanceOutcome::failure(
                CreateStatus::DuplicateOpenInstance,
                format!("an open instance already exists for {entity_name}/{entity_id}"),
            ),
            Err(err) => {
                tracing::error!(error = %err, "instance creation failed");
                CreateInstanceOutcome::failure(CreateStatus::Failed, err.to_string())
            }
        }
    }

    async fn create_instance_inner(
        &self,
        request: CreateInstanceRequest,
    ) -> Result<CreateInstanceOutcome, ApprovalError> {
        let Some(template) = self.load_template(&request.tenant_id, &request.template).await?
        else {
            return Ok(CreateInstanceOutcome::failure(
                CreateStatus::TemplateNotFound,
                format!("template '{}' not found", request.template),
            ));
        };
        if template.stages.is_empty() {
            return Ok(CreateInstanceOutcome::failure(
                CreateStatus::TemplateNotFound,
                format!("template '{}' has no stages", template.code),
            ));
        }

        let context = build_context(&request);

        let mut ordered_stages = template.stages.clone();
        ordered_stages.sort_by_key(|s| s.stage_no);

        // The first stage must route to somebody, otherwise the instance
        // would be born with nothing to decide.
        let first_resolution = self
            .resolver
            .resolve(&request.tenant_id, &template.rules, &context)
            .await?;
        if first_resolution.assignees.is_empty() {
            return Ok(CreateInstanceOutcome::failure(
                CreateStatus::NoApproversResolved,
                format!("no approvers could be resolved for template '{}'", template.code),
            ));
        }

        let now = Utc::now();
        let instance = ApprovalInstance {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            entity_name: request.entity_name.clone(),
            entity_id: request.entity_id.clone(),
            transition_id: request.transition_id.clone(),
            template_id: template.id.clone(),
            requester: request.requester.clone(),
            context: context.clone(),
            status: InstanceStatus::Open,
            cancel_reason: None,
            on_hold: false,
            version: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.store.insert_instance(&instance).await?;

        let mut stages = Vec::with_capacity(ordered_stages.len());
        for template_stage in &ordered_stages {
            let stage = InstanceStage {
                id: Uuid::new_v4().to_string(),
                instance_id: instance.id.clone(),
                stage_no: template_stage.stage_no,
                mode: template_stage.mode,
                quorum: template_stage.quorum,
                sla_secs: template_stage.sla_secs,
                status: StageStatus::Pending,
                activated_at: None,
                closed_at: None,
            };
            self.store.insert_stage(&stage).await?;
            stages.push(stage);
        }

        let task_count = self
            .materialize_stage(&instance, &mut stages[0], &first_resolution)
            .await?;

        self.emit(ApprovalEvent::new(
            instance.tenant_id.clone(),
            instance.id.clone(),
            events::INSTANCE_CREATED,
            json!({
                "template_id": template.id,
                "template_code": template.code,
                "entity_name": instance.entity_name,
                "entity_id": instance.entity_id,
            }),
        ))
        .await;

        tracing::info!(
            instance_id = %instance.id,
            template_code = %template.code,
            stage_count = stages.len(),
            task_count,
            "approval instance created"
        );

        Ok(CreateInstanceOutcome {
            status: CreateStatus::Created,
            instance_id: Some(instance.id),
            stage_count: stages.len() as u32,
            task_count: task_count as u32,
            error: None,
        })
    }

    async fn load_template(
        &self,
        tenant_id: &str,
        id_or_code: &str,
    ) -> Result<Option<ApprovalTemplate>, ApprovalError> {
        if let Some(template) = self.store.find_template(tenant_id, id_or_code).await? {
            return Ok(Some(template));
        }
        self.store.find_active_template(tenant_id, id_or_code).await
    }

    /// Open a stage: create one task per resolved assignee, write the
    /// assignment snapshots, and start SLA timers.
    async fn materialize_stage(
        &self,
        instance: &ApprovalInstance,
        stage: &mut InstanceStage,
        resolution: &Resolution,
    ) -> Result<usize, ApprovalError> {
        let now = Utc::now();
        stage.status = StageStatus::Open;
        stage.activated_at = Some(now);
        self.store.update_stage(stage).await?;

        let due_at = stage
            .sla_secs
            .map(|secs| now + ChronoDuration::seconds(secs as i64));

        for assignee in &resolution.assignees {
            let task = ApprovalTask {
                id: Uuid::new_v4().to_string(),
                tenant_id: instance.tenant_id.clone(),
                instance_id: instance.id.clone(),
                stage_id: stage.id.clone(),
                stage_no: stage.stage_no,
                approver_id: assignee.clone(),
                original_approver_id: assignee.clone(),
                status: TaskStatus::Pending,
                decided_at: None,
                decided_by: None,
                decision_note: None,
                due_at,
                created_at: now,
            };
            self.store.insert_task(&task).await?;

            let snapshot = AssignmentSnapshot::new(
                task.id.clone(),
                instance.id.clone(),
                json!({
                    "assignee": assignee,
                    "strategy": resolution.strategy,
                }),
                resolution.rule_id.clone(),
            );
            self.store.insert_snapshot(&snapshot).await?;

            // Timer scheduling is best-effort: a queue outage must not
            // block materialization.
            if let Err(err) = self.sla.schedule_for_task(&task).await {
                tracing::warn!(task_id = %task.id, error = %err, "SLA timer scheduling failed");
            }

            self.emit(ApprovalEvent::new(
                instance.tenant_id.clone(),
                instance.id.clone(),
                events::TASK_CREATED,
                json!({ "task_id": task.id, "approver_id": assignee, "stage_no": stage.stage_no }),
            ))
            .await;
        }

        self.emit(ApprovalEvent::new(
            instance.tenant_id.clone(),
            instance.id.clone(),
            events::STAGE_ACTIVATED,
            json!({ "stage_no": stage.stage_no, "task_count": resolution.assignees.len() }),
        ))
        .await;

        Ok(resolution.assignees.len())
    }

    // ── Action execution ─────────────────────────────────────────────

    /// Execute one action against an instance under the advisory lock.
    pub async fn execute_action(
        &self,
        request: ActionRequest,
    ) -> Result<ActionOutcome, ApprovalError> {
        validate_action_request(&request)?;

        let lock = self.instance_lock(&request.instance_id).await;
        let _guard = tokio::time::timeout(self.config.lock_timeout, lock.lock())
            .await
            .map_err(|_| {
                ApprovalError::LockUnavailable(self.config.lock_timeout.as_millis() as u64)
            })?;

        let mut instance = self
            .store
            .find_instance(&request.tenant_id, &request.instance_id)
            .await?
            .ok_or_else(|| ApprovalError::InstanceNotFound(request.instance_id.clone()))?;

        if let Some(expected) = request.expected_version {
            if expected != instance.version {
                return Err(ApprovalError::conflict(
                    instance.id.clone(),
                    expected,
                    instance.version,
                ));
            }
        }

        if instance.is_terminal() && request.action != ApprovalAction::Comment {
            return Err(ApprovalError::ActionNotAllowed(format!(
                "instance '{}' is no longer open",
                instance.id
            )));
        }

        if instance.on_hold
            && !matches!(
                request.action,
                ApprovalAction::Resume | ApprovalAction::Comment | ApprovalAction::Recall
            )
        {
            return Err(ApprovalError::ActionNotAllowed(format!(
                "instance '{}' is on hold",
                instance.id
            )));
        }

        let previous_version = instance.version;
        let mut task_status = None;
        let mut stage_outcome = None;

        match request.action {
            ApprovalAction::Approve => {
                let task = self.load_owned_pending_task(&request, true).await?;
                let (status, outcome) = self
                    .apply_decision(&mut instance, task, Decision::Approved, &request)
                    .await?;
                task_status = Some(status);
                stage_outcome = Some(outcome);
            }
            ApprovalAction::Reject => {
                let task = self.load_owned_pending_task(&request, true).await?;
                let (status, outcome) = self
                    .apply_decision(&mut instance, task, Decision::Rejected, &request)
                    .await?;
                task_status = Some(status);
                stage_outcome = Some(outcome);
            }
            ApprovalAction::Bypass => {
                // Administrative: no ownership requirement.
                let task = self.load_owned_pending_task(&request, false).await?;
                let decision = request.decision.ok_or_else(|| {
                    ApprovalError::ActionNotAllowed(
                        "action 'bypass' requires an explicit decision".to_string(),
                    )
                })?;
                let (status, outcome) = self
                    .apply_decision(&mut instance, task, decision, &request)
                    .await?;
                task_status = Some(status);
                stage_outcome = Some(outcome);
            }
            ApprovalAction::RequestChanges => {
                let task = self.load_owned_pending_task(&request, true).await?;
                instance.on_hold = true;
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::CHANGES_REQUESTED,
                    json!({
                        "task_id": task.id,
                        "actor": request.actor,
                        "reason": request.reason,
                    }),
                ))
                .await;
                task_status = Some(task.status);
            }
            ApprovalAction::Delegate => {
                let mut task = self.load_owned_pending_task(&request, true).await?;
                let target = required_target(&request)?;
                task.approver_id = target.clone();
                self.store.update_task(&task).await?;
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::TASK_DELEGATED,
                    json!({ "task_id": task.id, "from": request.actor, "to": target }),
                ))
                .await;
                task_status = Some(task.status);
            }
            ApprovalAction::Reassign => {
                let mut task = self.load_owned_pending_task(&request, false).await?;
                let target = required_target(&request)?;
                let previous = task.approver_id.clone();
                task.approver_id = target.clone();
                self.store.update_task(&task).await?;
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::TASK_REASSIGNED,
                    json!({ "task_id": task.id, "from": previous, "to": target, "by": request.actor }),
                ))
                .await;
                task_status = Some(task.status);
            }
            ApprovalAction::Release => {
                let mut task = self.load_owned_pending_task(&request, false).await?;
                if task.approver_id == task.original_approver_id {
                    return Err(ApprovalError::ActionNotAllowed(format!(
                        "task '{}' is not delegated",
                        task.id
                    )));
                }
                let previous = task.approver_id.clone();
                task.approver_id = task.original_approver_id.clone();
                self.store.update_task(&task).await?;
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::TASK_RELEASED,
                    json!({ "task_id": task.id, "from": previous, "to": task.approver_id }),
                ))
                .await;
                task_status = Some(task.status);
            }
            ApprovalAction::Escalate => {
                let mut task = self.load_owned_pending_task(&request, false).await?;
                let target = required_target(&request)?;
                let previous = task.approver_id.clone();
                task.approver_id = target.clone();
                self.store.update_task(&task).await?;

                let escalation = ApprovalEscalation {
                    id: Uuid::new_v4().to_string(),
                    tenant_id: instance.tenant_id.clone(),
                    instance_id: instance.id.clone(),
                    task_id: task.id.clone(),
                    escalated_to: Some(target.clone()),
                    reason: request.reason.clone(),
                    occurred_at: Utc::now(),
                };
                self.store.insert_escalation(&escalation).await?;

                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::TASK_ESCALATED,
                    json!({ "task_id": task.id, "from": previous, "to": target }),
                ))
                .await;
                task_status = Some(task.status);
            }
            ApprovalAction::Withdraw => {
                let mut task = self.load_owned_pending_task(&request, true).await?;
                task.status = TaskStatus::Canceled;
                task.decided_at = Some(Utc::now());
                task.decided_by = Some(request.actor.clone());
                self.store.update_task(&task).await?;
                self.sla.cancel_timers(&task.id);
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::TASK_WITHDRAWN,
                    json!({ "task_id": task.id, "actor": request.actor }),
                ))
                .await;
                task_status = Some(task.status);
                stage_outcome = Some(self.evaluate_stage_cascade(&mut instance, &task).await?);
            }
            ApprovalAction::Hold => {
                instance.on_hold = true;
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::INSTANCE_HELD,
                    json!({ "actor": request.actor, "reason": request.reason }),
                ))
                .await;
            }
            ApprovalAction::Resume => {
                if !instance.on_hold {
                    return Err(ApprovalError::ActionNotAllowed(format!(
                        "instance '{}' is not on hold",
                        instance.id
                    )));
                }
                instance.on_hold = false;
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::INSTANCE_RESUMED,
                    json!({ "actor": request.actor }),
                ))
                .await;
            }
            ApprovalAction::Recall => {
                let requester = instance.requester.clone().unwrap_or_default();
                if requester != request.actor {
                    return Err(ApprovalError::ActionNotAllowed(
                        "only the requester may recall an instance".to_string(),
                    ));
                }
                self.cancel_instance(&mut instance, CancelReason::Recalled)
                    .await?;
            }
            ApprovalAction::Comment => {
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::COMMENT_ADDED,
                    json!({ "actor": request.actor, "note": request.note }),
                ))
                .await;

                // Comments only append to the audit trail; the instance
                // record itself is untouched.
                return Ok(ActionOutcome {
                    instance_id: instance.id,
                    action: request.action,
                    task_status: None,
                    stage_outcome: None,
                    instance_status: instance.status,
                    version: instance.version,
                });
            }
        }

        instance.version += 1;
        instance.updated_at = Utc::now();
        self.store
            .update_instance(&instance, previous_version)
            .await?;

        Ok(ActionOutcome {
            instance_id: instance.id,
            action: request.action,
            task_status,
            stage_outcome,
            instance_status: instance.status,
            version: instance.version,
        })
    }

    async fn load_owned_pending_task(
        &self,
        request: &ActionRequest,
        require_ownership: bool,
    ) -> Result<ApprovalTask, ApprovalError> {
        let task_id = request.task_id.as_deref().ok_or_else(|| {
            ApprovalError::ActionNotAllowed(format!(
                "action '{}' requires a task id",
                request.action.name()
            ))
        })?;

        let task = self
            .store
            .find_task(&request.tenant_id, task_id)
            .await?
            .ok_or_else(|| ApprovalError::TaskNotFound(task_id.to_string()))?;

        if task.instance_id != request.instance_id {
            return Err(ApprovalError::TaskNotFound(task_id.to_string()));
        }
        if !task.is_pending() {
            return Err(ApprovalError::TaskNotPending(task.id.clone()));
        }
        if require_ownership && task.approver_id != request.actor {
            return Err(ApprovalError::ActionNotAllowed(format!(
                "task '{}' is assigned to '{}'",
                task.id, task.approver_id
            )));
        }

        Ok(task)
    }

    /// Record a decision on a task, then re-evaluate its stage and, when
    /// the stage closes, the whole instance.
    async fn apply_decision(
        &self,
        instance: &mut ApprovalInstance,
        mut task: ApprovalTask,
        decision: Decision,
        request: &ActionRequest,
    ) -> Result<(TaskStatus, StageOutcome), ApprovalError> {
        task.status = match decision {
            Decision::Approved => TaskStatus::Approved,
            Decision::Rejected => TaskStatus::Rejected,
        };
        task.decided_at = Some(Utc::now());
        task.decided_by = Some(request.actor.clone());
        task.decision_note = request.note.clone().or_else(|| request.reason.clone());
        self.store.update_task(&task).await?;

        self.sla.cancel_timers(&task.id);

        self.emit(ApprovalEvent::new(
            instance.tenant_id.clone(),
            instance.id.clone(),
            events::TASK_DECIDED,
            json!({
                "task_id": task.id,
                "decision": task.status,
                "decided_by": request.actor,
                "action": request.action.name(),
            }),
        ))
        .await;

        let outcome = self.evaluate_stage_cascade(instance, &task).await?;
        Ok((task.status, outcome))
    }

    /// Re-evaluate the stage a task belongs to and cascade the result.
    async fn evaluate_stage_cascade(
        &self,
        instance: &mut ApprovalInstance,
        task: &ApprovalTask,
    ) -> Result<StageOutcome, ApprovalError> {
        let stages = self.store.list_stages(&instance.id).await?;
        let mut stage = stages
            .iter()
            .find(|s| s.id == task.stage_id)
            .cloned()
            .ok_or_else(|| ApprovalError::Storage(format!("stage '{}' missing", task.stage_id)))?;

        let tasks = self.store.list_stage_tasks(&stage.id).await?;
        let outcome = stage_outcome(stage.mode, stage.quorum, &tasks);

        match outcome {
            StageOutcome::StillOpen => {}
            StageOutcome::Rejected => {
                stage.status = StageStatus::Canceled;
                stage.closed_at = Some(Utc::now());
                self.store.update_stage(&stage).await?;
                self.cancel_stage_tasks(&stage).await?;
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::STAGE_CANCELED,
                    json!({ "stage_no": stage.stage_no }),
                ))
                .await;
                self.cancel_instance(instance, CancelReason::Rejected).await?;
            }
            StageOutcome::Completed => {
                stage.status = StageStatus::Completed;
                stage.closed_at = Some(Utc::now());
                self.store.update_stage(&stage).await?;
                self.cancel_stage_tasks(&stage).await?;
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::STAGE_COMPLETED,
                    json!({ "stage_no": stage.stage_no }),
                ))
                .await;
                self.advance_instance(instance).await?;
            }
        }

        Ok(outcome)
    }

    /// Cancel whatever is still pending in a closed stage so late
    /// decisions and stale timers find a terminal task.
    async fn cancel_stage_tasks(&self, stage: &InstanceStage) -> Result<(), ApprovalError> {
        let tasks = self.store.list_stage_tasks(&stage.id).await?;
        for mut task in tasks {
            if task.is_pending() {
                task.status = TaskStatus::Canceled;
                self.store.update_task(&task).await?;
                self.sla.cancel_timers(&task.id);
            }
        }
        Ok(())
    }

    /// Activate the next pending stage, skipping stages that resolve to
    /// nobody; when none remain, complete the instance.
    async fn advance_instance(
        &self,
        instance: &mut ApprovalInstance,
    ) -> Result<(), ApprovalError> {
        let template = self
            .store
            .find_template(&instance.tenant_id, &instance.template_id)
            .await?
            .ok_or_else(|| ApprovalError::TemplateNotFound(instance.template_id.clone()))?;

        let stages = self.store.list_stages(&instance.id).await?;
        for mut stage in stages {
            if stage.status != StageStatus::Pending {
                continue;
            }

            let resolution = self
                .resolver
                .resolve(&instance.tenant_id, &template.rules, &instance.context)
                .await?;

            if resolution.assignees.is_empty() {
                stage.status = StageStatus::Skipped;
                stage.closed_at = Some(Utc::now());
                self.store.update_stage(&stage).await?;
                self.emit(ApprovalEvent::new(
                    instance.tenant_id.clone(),
                    instance.id.clone(),
                    events::STAGE_SKIPPED,
                    json!({ "stage_no": stage.stage_no }),
                ))
                .await;
                continue;
            }

            self.materialize_stage(instance, &mut stage, &resolution)
                .await?;
            return Ok(());
        }

        self.complete_instance(instance).await
    }

    /// Mark the instance completed (idempotently) and resume the paused
    /// downstream transition.
    async fn complete_instance(
        &self,
        instance: &mut ApprovalInstance,
    ) -> Result<(), ApprovalError> {
        if instance.is_terminal() {
            return Ok(());
        }
        instance.status = InstanceStatus::Completed;
        instance.completed_at = Some(Utc::now());

        self.emit(ApprovalEvent::new(
            instance.tenant_id.clone(),
            instance.id.clone(),
            events::INSTANCE_COMPLETED,
            json!({ "entity_name": instance.entity_name, "entity_id": instance.entity_id }),
        ))
        .await;

        let transition = TransitionRequest {
            tenant_id: instance.tenant_id.clone(),
            entity_name: instance.entity_name.clone(),
            entity_id: instance.entity_id.clone(),
            operation_code: instance
                .transition_id
                .clone()
                .unwrap_or_else(|| "resume".to_string()),
            context: instance.context.clone(),
        };
        if let Err(err) = self.lifecycle.transition(transition).await {
            tracing::warn!(
                instance_id = %instance.id,
                error = %err,
                "lifecycle resume failed after completion"
            );
            self.emit(ApprovalEvent::new(
                instance.tenant_id.clone(),
                instance.id.clone(),
                events::LIFECYCLE_RESUME_FAILED,
                json!({ "error": err.to_string() }),
            ))
            .await;
        }

        tracing::info!(instance_id = %instance.id, "approval instance completed");
        Ok(())
    }

    /// Cancel the instance and everything still open under it. No
    /// further stages activate after this.
    async fn cancel_instance(
        &self,
        instance: &mut ApprovalInstance,
        reason: CancelReason,
    ) -> Result<(), ApprovalError> {
        if instance.is_terminal() {
            return Ok(());
        }
        instance.status = InstanceStatus::Canceled;
        instance.cancel_reason = Some(reason);

        let stages = self.store.list_stages(&instance.id).await?;
        for mut stage in stages {
            if matches!(stage.status, StageStatus::Pending | StageStatus::Open) {
                stage.status = StageStatus::Canceled;
                stage.closed_at = Some(Utc::now());
                self.store.update_stage(&stage).await?;
                self.cancel_stage_tasks(&stage).await?;
            }
        }

        self.emit(ApprovalEvent::new(
            instance.tenant_id.clone(),
            instance.id.clone(),
            events::INSTANCE_CANCELED,
            json!({ "reason": reason }),
        ))
        .await;

        tracing::info!(instance_id = %instance.id, reason = ?reason, "approval instance canceled");
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> Result<Option<ApprovalInstance>, ApprovalError> {
        self.store.find_instance(tenant_id, instance_id).await
    }

    pub async fn instance_stages(
        &self,
        instance_id: &str,
    ) -> Result<Vec<InstanceStage>, ApprovalError> {
        self.store.list_stages(instance_id).await
    }

    pub async fn instance_tasks(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ApprovalTask>, ApprovalError> {
        self.store.list_instance_tasks(instance_id).await
    }

    pub async fn instance_events(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ApprovalEvent>, ApprovalError> {
        self.store.list_events(instance_id).await
    }

    pub fn backend_label(&self) -> &'static str {
        self.store.backend_label()
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn instance_lock(&self, instance_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Persist an event and fan it out. Both halves are best-effort:
    /// the triggering action must not fail because of its audit trail.
    async fn emit(&self, event: ApprovalEvent) {
        if let Err(err) = self.store.append_event(&event).await {
            tracing::warn!(
                event_type = %event.event_type,
                error = %err,
                "approval event append failed"
            );
        }

        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            if let Err(err) = handler.on_event(&event).await {
                tracing::warn!(
                    event_type = %event.event_type,
                    error = %err,
                    "approval event handler failed"
                );
            }
        }
    }
}

fn build_context(request: &CreateInstanceRequest) -> Value {
    let mut context = match &request.context {
        Value::Object(map) => Value::Object(map.clone()),
        Value::Null => json!({}),
        other => json!({ "value": other }),
    };
    if let (Some(requester), Some(map)) = (&request.requester, context.as_object_mut()) {
        map.entry("requester".to_string())
            .or_insert_with(|| json!(requester));
    }
    context
}

fn required_target(request: &ActionRequest) -> Result<String, ApprovalError> {
    request.target.clone().ok_or_else(|| {
        ApprovalError::ActionNotAllowed(format!(
            "action '{}' requires a target principal",
            request.action.name()
        ))
    })
}

fn validate_action_request(request: &ActionRequest) -> Result<(), ApprovalError> {
    let has_reason = request
        .reason
        .as_deref()
        .map(|r| !r.trim().is_empty())
        .unwrap_or(false);

    match request.action {
        ApprovalAction::Reject | ApprovalAction::RequestChanges if !has_reason => {
            Err(ApprovalError::ActionNotAllowed(format!(
                "action '{}' requires a non-empty reason",
                request.action.name()
            )))
        }
        ApprovalAction::Delegate | ApprovalAction::Reassign | ApprovalAction::Escalate
            if request.target.is_none() =>
        {
            Err(ApprovalError::ActionNotAllowed(format!(
                "action '{}' requires a target principal",
                request.action.name()
            )))
        }
        ApprovalAction::Bypass if !has_reason || request.decision.is_none() => {
            Err(ApprovalError::ActionNotAllowed(
                "action 'bypass' requires a reason and an explicit decision".to_string(),
            ))
        }
        _ => Ok(()),
    }
}

/// Stage completion per mode and quorum.
///
/// Serial means all-must-respond, in any order: the stage closes once no
/// task is pending, regardless of decision sequence. Percentage quorums
/// round up and count only non-canceled tasks in the denominator.
pub fn stage_outcome(mode: StageMode, quorum: Option<Quorum>, tasks: &[ApprovalTask]) -> StageOutcome {
    if tasks.iter().any(|t| t.status == TaskStatus::Rejected) {
        return StageOutcome::Rejected;
    }

    let pending = tasks.iter().filter(|t| t.is_pending()).count();
    let approved = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Approved)
        .count();

    let complete = match (mode, quorum) {
        (StageMode::Serial, _) => pending == 0,
        (StageMode::Parallel, Some(q)) => match q.kind {
            QuorumKind::Count => approved >= q.value as usize,
            QuorumKind::Percentage => {
                let total = tasks
                    .iter()
                    .filter(|t| t.status != TaskStatus::Canceled)
                    .count();
                let required = (q.value as usize * total).div_ceil(100);
                approved >= required
            }
        },
        (StageMode::Parallel, None) => pending == 0,
    };

    if complete {
        StageOutcome::Completed
    } else {
        StageOutcome::StillOpen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::directory::DirectoryProvider;
    use crate::queue::{JobQueue, RetryPolicy, TimerJob};
    use crate::storage::MemoryStore;
    use crate::template::{AssignmentTarget, RoutingRule, TemplateStage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NullDirectory;

    #[async_trait]
    impl DirectoryProvider for NullDirectory {
        async fn principals_with_role(
            &self,
            _t: &str,
            _r: &str,
            _u: Option<&str>,
        ) -> Result<Vec<String>, ApprovalError> {
            Ok(Vec::new())
        }
        async fn group_members(&self, _t: &str, _g: &str) -> Result<Vec<String>, ApprovalError> {
            Ok(Vec::new())
        }
        async fn unit_principals(&self, _t: &str, _u: &str) -> Result<Vec<String>, ApprovalError> {
            Ok(Vec::new())
        }
        async fn principal_unit(
            &self,
            _t: &str,
            _p: &str,
        ) -> Result<Option<String>, ApprovalError> {
            Ok(None)
        }
        async fn unit_parent(&self, _t: &str, _u: &str) -> Result<Option<String>, ApprovalError> {
            Ok(None)
        }
        async fn principals_with_metadata(
            &self,
            _t: &str,
            _k: &str,
            _v: &Value,
        ) -> Result<Vec<String>, ApprovalError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct DropQueue;

    #[async_trait]
    impl JobQueue for DropQueue {
        async fn enqueue(
            &self,
            _job: TimerJob,
            _delay: Duration,
            _retry: RetryPolicy,
        ) -> Result<(), ApprovalError> {
            Ok(())
        }
    }

    struct CountingLifecycle {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingLifecycle {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl LifecycleManager for CountingLifecycle {
        async fn transition(&self, _request: TransitionRequest) -> Result<(), ApprovalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ApprovalError::Storage("lifecycle unavailable".to_string()));
            }
            Ok(())
        }

        async fn transitions_referencing(
            &self,
            _tenant_id: &str,
            _code: &str,
        ) -> Result<Vec<crate::lifecycle::TransitionRef>, ApprovalError> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        engine: ApprovalEngine,
        store: Arc<MemoryStore>,
        lifecycle: Arc<CountingLifecycle>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let resolver =
            ApproverResolver::new(Arc::new(NullDirectory), Arc::new(MemoryCache::new()));
        let sla = Arc::new(SlaTimerService::new(store.clone(), Arc::new(DropQueue)));
        let lifecycle = Arc::new(CountingLifecycle::new());
        let engine = ApprovalEngine::new(
            store.clone(),
            resolver,
            sla,
            lifecycle.clone(),
            EngineConfig::default(),
        );
        Harness {
            engine,
            store,
            lifecycle,
        }
    }

    async fn seed_template(harness: &Harness, stages: Vec<TemplateStage>, assignees: Vec<&str>) {
        let template = ApprovalTemplate::new(
            "tenant-a",
            "po-approval",
            "Purchase Approval",
            stages,
            vec![RoutingRule::new(AssignmentTarget::direct(
                assignees.into_iter().map(str::to_string).collect(),
            ))],
        );
        harness.store.insert_template(&template).await.unwrap();
    }

    fn create_request(entity_id: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            tenant_id: "tenant-a".to_string(),
            entity_name: "purchase_order".to_string(),
            entity_id: entity_id.to_string(),
            transition_id: Some("po.submit".to_string()),
            template: "po-approval".to_string(),
            requester: Some("p-requester".to_string()),
            context: json!({ "amount": 900 }),
        }
    }

    async fn pending_task_for(
        harness: &Harness,
        instance_id: &str,
        approver: &str,
    ) -> ApprovalTask {
        harness
            .engine
            .instance_tasks(instance_id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.approver_id == approver && t.is_pending())
            .expect("pending task for approver")
    }

    fn approve(instance_id: &str, task_id: &str, actor: &str) -> ActionRequest {
        ActionRequest::new("tenant-a", instance_id, actor, ApprovalAction::Approve)
            .on_task(task_id)
    }

    #[tokio::test]
    async fn creation_materializes_only_the_first_stage() {
        let h = harness();
        seed_template(
            &h,
            vec![
                TemplateStage::parallel(1).with_sla_secs(3_600),
                TemplateStage::serial(2),
            ],
            vec!["p-1", "p-2"],
        )
        .await;

        let outcome = h.engine.create_instance(create_request("po-1")).await;
        assert_eq!(outcome.status, CreateStatus::Created);
        assert_eq!(outcome.stage_count, 2);
        assert_eq!(outcome.task_count, 2);

        let instance_id = outcome.instance_id.unwrap();
        let stages = h.engine.instance_stages(&instance_id).await.unwrap();
        assert_eq!(stages[0].status, StageStatus::Open);
        assert_eq!(stages[1].status, StageStatus::Pending);

        // Tasks exist only for the open stage, with SLA due dates.
        let tasks = h.engine.instance_tasks(&instance_id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.stage_no == 1 && t.due_at.is_some()));

        // One write-once snapshot per task.
        for task in &tasks {
            let snapshot = h.store.find_snapshot_for_task(&task.id).await.unwrap();
            assert!(snapshot.is_some());
        }
    }

    #[tokio::test]
    async fn creation_fails_for_missing_template() {
        let h = harness();
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        assert_eq!(outcome.status, CreateStatus::TemplateNotFound);
        assert!(outcome.instance_id.is_none());
    }

    #[tokio::test]
    async fn creation_fails_when_no_rule_matches() {
        let h = harness();
        let template = ApprovalTemplate::new(
            "tenant-a",
            "po-approval",
            "Purchase Approval",
            vec![TemplateStage::serial(1)],
            vec![
                RoutingRule::new(AssignmentTarget::direct(vec!["p-1".to_string()]))
                    .with_conditions(crate::condition::ConditionGroup::all(vec![
                        crate::condition::ConditionNode::Rule(crate::condition::ConditionRule {
                            field: "amount".to_string(),
                            op: crate::condition::CompareOp::Gt,
                            value: json!(1_000_000),
                        }),
                    ])),
            ],
        );
        h.store.insert_template(&template).await.unwrap();

        let outcome = h.engine.create_instance(create_request("po-1")).await;
        assert_eq!(outcome.status, CreateStatus::NoApproversResolved);
    }

    #[tokio::test]
    async fn second_open_instance_for_same_entity_is_rejected() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1"]).await;

        let first = h.engine.create_instance(create_request("po-1")).await;
        assert_eq!(first.status, CreateStatus::Created);

        let second = h.engine.create_instance(create_request("po-1")).await;
        assert_eq!(second.status, CreateStatus::DuplicateOpenInstance);
    }

    #[tokio::test]
    async fn count_quorum_completes_at_threshold() {
        let h = harness();
        seed_template(
            &h,
            vec![TemplateStage::parallel(1).with_quorum(Quorum::count(2))],
            vec!["p-1", "p-2", "p-3"],
        )
        .await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        let task = pending_task_for(&h, &instance_id, "p-1").await;
        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();
        assert_eq!(result.stage_outcome, Some(StageOutcome::StillOpen));
        assert_eq!(result.instance_status, InstanceStatus::Open);

        let task = pending_task_for(&h, &instance_id, "p-2").await;
        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-2"))
            .await
            .unwrap();
        assert_eq!(result.stage_outcome, Some(StageOutcome::Completed));
        assert_eq!(result.instance_status, InstanceStatus::Completed);

        // The third task was canceled with the stage, not left dangling.
        let tasks = h.engine.instance_tasks(&instance_id).await.unwrap();
        let third = tasks.iter().find(|t| t.approver_id == "p-3").unwrap();
        assert_eq!(third.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn percentage_quorum_rounds_up() {
        let h = harness();
        seed_template(
            &h,
            vec![TemplateStage::parallel(1).with_quorum(Quorum::percentage(50))],
            vec!["p-1", "p-2", "p-3", "p-4"],
        )
        .await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        let task = pending_task_for(&h, &instance_id, "p-1").await;
        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();
        assert_eq!(result.stage_outcome, Some(StageOutcome::StillOpen));

        let task = pending_task_for(&h, &instance_id, "p-2").await;
        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-2"))
            .await
            .unwrap();
        assert_eq!(result.stage_outcome, Some(StageOutcome::Completed));
    }

    #[tokio::test]
    async fn serial_stage_completes_when_all_respond_in_any_order() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1", "p-2"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        // Second assignee answers first; order within the stage is free.
        let task = pending_task_for(&h, &instance_id, "p-2").await;
        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-2"))
            .await
            .unwrap();
        assert_eq!(result.stage_outcome, Some(StageOutcome::StillOpen));

        let task = pending_task_for(&h, &instance_id, "p-1").await;
        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();
        assert_eq!(result.stage_outcome, Some(StageOutcome::Completed));
        assert_eq!(result.instance_status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn rejection_cancels_stage_and_instance() {
        let h = harness();
        seed_template(
            &h,
            vec![
                TemplateStage::parallel(1).with_quorum(Quorum::count(2)),
                TemplateStage::serial(2),
            ],
            vec!["p-1", "p-2", "p-3"],
        )
        .await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        let task = pending_task_for(&h, &instance_id, "p-1").await;
        h.engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();

        let task = pending_task_for(&h, &instance_id, "p-2").await;
        let result = h
            .engine
            .execute_action(
                ActionRequest::new("tenant-a", &instance_id, "p-2", ApprovalAction::Reject)
                    .on_task(&task.id)
                    .with_reason("budget exceeded"),
            )
            .await
            .unwrap();

        assert_eq!(result.stage_outcome, Some(StageOutcome::Rejected));
        assert_eq!(result.instance_status, InstanceStatus::Canceled);

        let instance = h
            .engine
            .instance("tenant-a", &instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.cancel_reason, Some(CancelReason::Rejected));

        // Stage 2 never activates.
        let stages = h.engine.instance_stages(&instance_id).await.unwrap();
        assert_eq!(stages[1].status, StageStatus::Canceled);

        // No lifecycle resume on rejection.
        assert_eq!(h.lifecycle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_decision_on_same_task_is_rejected() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1", "p-2"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        let task = pending_task_for(&h, &instance_id, "p-1").await;
        h.engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();

        let err = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::TaskNotPending(_)));
    }

    #[tokio::test]
    async fn completed_stage_activates_next_and_completion_resumes_lifecycle() {
        let h = harness();
        seed_template(
            &h,
            vec![TemplateStage::serial(1), TemplateStage::serial(2)],
            vec!["p-1"],
        )
        .await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        let task = pending_task_for(&h, &instance_id, "p-1").await;
        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();
        assert_eq!(result.instance_status, InstanceStatus::Open);

        // Stage 2 is now open with a fresh task.
        let stages = h.engine.instance_stages(&instance_id).await.unwrap();
        assert_eq!(stages[0].status, StageStatus::Completed);
        assert_eq!(stages[1].status, StageStatus::Open);

        let task = pending_task_for(&h, &instance_id, "p-1").await;
        assert_eq!(task.stage_no, 2);
        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();
        assert_eq!(result.instance_status, InstanceStatus::Completed);
        assert_eq!(h.lifecycle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lifecycle_failure_does_not_fail_completion() {
        let h = harness();
        h.lifecycle.fail.store(true, Ordering::SeqCst);
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        let task = pending_task_for(&h, &instance_id, "p-1").await;
        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();
        assert_eq!(result.instance_status, InstanceStatus::Completed);

        let events = h.engine.instance_events(&instance_id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == events::LIFECYCLE_RESUME_FAILED));
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1", "p-2"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        let task = pending_task_for(&h, &instance_id, "p-1").await;
        h.engine
            .execute_action(approve(&instance_id, &task.id, "p-1").with_expected_version(1))
            .await
            .unwrap();

        // A second caller still holding version 1 must conflict.
        let task = pending_task_for(&h, &instance_id, "p-2").await;
        let err = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-2").with_expected_version(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn reject_requires_a_reason() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();
        let task = pending_task_for(&h, &instance_id, "p-1").await;

        let err = h
            .engine
            .execute_action(
                ActionRequest::new("tenant-a", &instance_id, "p-1", ApprovalAction::Reject)
                    .on_task(&task.id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::ActionNotAllowed(_)));
    }

    #[tokio::test]
    async fn bypass_requires_reason_and_decision() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();
        let task = pending_task_for(&h, &instance_id, "p-1").await;

        let err = h
            .engine
            .execute_action(
                ActionRequest::new("tenant-a", &instance_id, "admin-1", ApprovalAction::Bypass)
                    .on_task(&task.id)
                    .with_reason("emergency change"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::ActionNotAllowed(_)));

        let result = h
            .engine
            .execute_action(
                ActionRequest::new("tenant-a", &instance_id, "admin-1", ApprovalAction::Bypass)
                    .on_task(&task.id)
                    .with_reason("emergency change")
                    .with_decision(Decision::Approved),
            )
            .await
            .unwrap();
        assert_eq!(result.task_status, Some(TaskStatus::Approved));
        assert_eq!(result.instance_status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn delegate_reroutes_and_release_restores() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();
        let task = pending_task_for(&h, &instance_id, "p-1").await;

        h.engine
            .execute_action(
                ActionRequest::new("tenant-a", &instance_id, "p-1", ApprovalAction::Delegate)
                    .on_task(&task.id)
                    .with_target("p-deputy"),
            )
            .await
            .unwrap();

        // The original assignee no longer owns the task.
        let err = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::ActionNotAllowed(_)));

        // Release hands it back to the snapshot assignee.
        h.engine
            .execute_action(
                ActionRequest::new("tenant-a", &instance_id, "p-deputy", ApprovalAction::Release)
                    .on_task(&task.id),
            )
            .await
            .unwrap();

        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();
        assert_eq!(result.task_status, Some(TaskStatus::Approved));
    }

    #[tokio::test]
    async fn recall_is_requester_only() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        let err = h
            .engine
            .execute_action(ActionRequest::new(
                "tenant-a",
                &instance_id,
                "p-1",
                ApprovalAction::Recall,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::ActionNotAllowed(_)));

        let result = h
            .engine
            .execute_action(ActionRequest::new(
                "tenant-a",
                &instance_id,
                "p-requester",
                ApprovalAction::Recall,
            ))
            .await
            .unwrap();
        assert_eq!(result.instance_status, InstanceStatus::Canceled);

        let instance = h
            .engine
            .instance("tenant-a", &instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.cancel_reason, Some(CancelReason::Recalled));
    }

    #[tokio::test]
    async fn hold_blocks_decisions_until_resume() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();
        let task = pending_task_for(&h, &instance_id, "p-1").await;

        h.engine
            .execute_action(ActionRequest::new(
                "tenant-a",
                &instance_id,
                "admin-1",
                ApprovalAction::Hold,
            ))
            .await
            .unwrap();

        let err = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::ActionNotAllowed(_)));

        h.engine
            .execute_action(ActionRequest::new(
                "tenant-a",
                &instance_id,
                "admin-1",
                ApprovalAction::Resume,
            ))
            .await
            .unwrap();

        let result = h
            .engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();
        assert_eq!(result.instance_status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn withdraw_cancels_task_and_reevaluates_stage() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1", "p-2"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        let task = pending_task_for(&h, &instance_id, "p-1").await;
        h.engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();

        // The remaining approver withdraws; nobody is pending, so the
        // serial stage closes on the one recorded approval.
        let task = pending_task_for(&h, &instance_id, "p-2").await;
        let result = h
            .engine
            .execute_action(
                ActionRequest::new("tenant-a", &instance_id, "p-2", ApprovalAction::Withdraw)
                    .on_task(&task.id),
            )
            .await
            .unwrap();
        assert_eq!(result.task_status, Some(TaskStatus::Canceled));
        assert_eq!(result.stage_outcome, Some(StageOutcome::Completed));
        assert_eq!(result.instance_status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn comment_appends_event_without_bumping_version() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();

        let result = h
            .engine
            .execute_action(
                ActionRequest::new("tenant-a", &instance_id, "p-1", ApprovalAction::Comment)
                    .with_note("waiting on vendor quote"),
            )
            .await
            .unwrap();
        assert_eq!(result.version, 1);

        let events = h.engine.instance_events(&instance_id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == events::COMMENT_ADDED));
    }

    #[tokio::test]
    async fn actions_on_terminal_instance_are_rejected() {
        let h = harness();
        seed_template(&h, vec![TemplateStage::serial(1)], vec!["p-1"]).await;
        let outcome = h.engine.create_instance(create_request("po-1")).await;
        let instance_id = outcome.instance_id.unwrap();
        let task = pending_task_for(&h, &instance_id, "p-1").await;

        h.engine
            .execute_action(approve(&instance_id, &task.id, "p-1"))
            .await
            .unwrap();

        let err = h
            .engine
            .execute_action(ActionRequest::new(
                "tenant-a",
                &instance_id,
                "admin-1",
                ApprovalAction::Hold,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::ActionNotAllowed(_)));
    }

    mod quorum_math {
        use super::*;
        use chrono::Utc;

        fn task(status: TaskStatus) -> ApprovalTask {
            ApprovalTask {
                id: Uuid::new_v4().to_string(),
                tenant_id: "t".to_string(),
                instance_id: "i".to_string(),
                stage_id: "s".to_string(),
                stage_no: 1,
                approver_id: "p".to_string(),
                original_approver_id: "p".to_string(),
                status,
                decided_at: None,
                decided_by: None,
                decision_note: None,
                due_at: None,
                created_at: Utc::now(),
            }
        }

        #[test]
        fn count_quorum_is_exact() {
            let tasks = vec![
                task(TaskStatus::Approved),
                task(TaskStatus::Pending),
                task(TaskStatus::Pending),
            ];
            assert_eq!(
                stage_outcome(StageMode::Parallel, Some(Quorum::count(2)), &tasks),
                StageOutcome::StillOpen
            );

            let tasks = vec![
                task(TaskStatus::Approved),
                task(TaskStatus::Approved),
                task(TaskStatus::Pending),
            ];
            assert_eq!(
                stage_outcome(StageMode::Parallel, Some(Quorum::count(2)), &tasks),
                StageOutcome::Completed
            );
        }

        #[test]
        fn percentage_quorum_uses_ceiling() {
            // ceil(0.5 * 4) = 2
            let tasks = vec![
                task(TaskStatus::Approved),
                task(TaskStatus::Approved),
                task(TaskStatus::Pending),
                task(TaskStatus::Pending),
            ];
            assert_eq!(
                stage_outcome(StageMode::Parallel, Some(Quorum::percentage(50)), &tasks),
                StageOutcome::Completed
            );

            // ceil(0.5 * 3) = 2: one approval is not enough.
            let tasks = vec![
                task(TaskStatus::Approved),
                task(TaskStatus::Pending),
                task(TaskStatus::Pending),
            ];
            assert_eq!(
                stage_outcome(StageMode::Parallel, Some(Quorum::percentage(50)), &tasks),
                StageOutcome::StillOpen
            );
        }

        #[test]
        fn any_rejection_wins_over_quorum() {
            let tasks = vec![
                task(TaskStatus::Approved),
                task(TaskStatus::Approved),
                task(TaskStatus::Rejected),
            ];
            assert_eq!(
                stage_outcome(StageMode::Parallel, Some(Quorum::count(2)), &tasks),
                StageOutcome::Rejected
            );
        }

        #[test]
        fn unanimous_parallel_waits_for_everyone() {
            let tasks = vec![task(TaskStatus::Approved), task(TaskStatus::Pending)];
            assert_eq!(
                stage_outcome(StageMode::Parallel, None, &tasks),
                StageOutcome::StillOpen
            );

            let tasks = vec![task(TaskStatus::Approved), task(TaskStatus::Approved)];
            assert_eq!(
                stage_outcome(StageMode::Parallel, None, &tasks),
                StageOutcome::Completed
            );
        }
    }
}
