//! Runtime approval records: instances, stages, tasks, snapshots, and the
//! action vocabulary accepted by the engine.

use crate::error::ApprovalError;
use crate::template::{Quorum, StageMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of an approval instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Open,
    Completed,
    Canceled,
}

/// Why a canceled instance was canceled. Distinguishes a rejection
/// cascade from administrative termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Rejected,
    Recalled,
    Withdrawn,
    Administrative,
}

/// One approval instance per triggering business event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: String,
    pub tenant_id: String,
    pub entity_name: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_id: Option<String>,
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    /// Assignment/evaluation context captured at creation time.
    pub context: Value,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    /// Set by `hold`/`request_changes`, cleared by `resume`.
    #[serde(default)]
    pub on_hold: bool,
    /// Optimistic-concurrency counter, incremented on every mutation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ApprovalInstance {
    pub fn is_open(&self) -> bool {
        self.status == InstanceStatus::Open
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

/// Status of an instance-scoped stage.
///
/// `Pending` stages have not been activated yet (stage N+1 activates only
/// when stage N closes); `Skipped` stages activated with no resolvable
/// assignees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Open,
    Completed,
    Canceled,
    Skipped,
}

/// Runtime state of one template stage inside an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStage {
    pub id: String,
    pub instance_id: String,
    pub stage_no: u32,
    pub mode: StageMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<Quorum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_secs: Option<u64>,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

/// Status of an individual approval task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Approved,
    Rejected,
    Canceled,
}

/// One task per resolved assignee per activated stage. Terminal once
/// decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTask {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub stage_id: String,
    pub stage_no: u32,
    /// Principal or group currently responsible for the decision.
    pub approver_id: String,
    /// Assignee resolved at materialization time; `release` restores it
    /// after a delegation.
    pub original_approver_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalTask {
    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}

/// Write-once record of how a task's assignee was resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentSnapshot {
    pub id: String,
    pub task_id: String,
    pub instance_id: String,
    pub resolved_assignment: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_from_rule_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AssignmentSnapshot {
    pub fn new(
        task_id: impl Into<String>,
        instance_id: impl Into<String>,
        resolved_assignment: Value,
        resolved_from_rule_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            instance_id: instance_id.into(),
            resolved_assignment,
            resolved_from_rule_id,
            created_at: Utc::now(),
        }
    }
}

/// Append-only escalation record tied to a task's SLA breach or an
/// explicit `escalate` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEscalation {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Request to create an approval instance from a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub tenant_id: String,
    pub entity_name: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_id: Option<String>,
    /// Template id, or template code resolved against the active version.
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    #[serde(default)]
    pub context: Value,
}

/// Outcome class for instance creation. Expected failures come back as
/// statuses rather than errors so callers can render them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateStatus {
    Created,
    TemplateNotFound,
    NoApproversResolved,
    DuplicateOpenInstance,
    Failed,
}

/// Structured result of `create_instance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceOutcome {
    pub status: CreateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub stage_count: u32,
    pub task_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CreateInstanceOutcome {
    pub fn failure(status: CreateStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            instance_id: None,
            stage_count: 0,
            task_count: 0,
            error: Some(error.into()),
        }
    }
}

/// The full action vocabulary accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
    RequestChanges,
    Delegate,
    Escalate,
    Hold,
    Resume,
    Recall,
    Withdraw,
    Bypass,
    Reassign,
    Comment,
    Release,
}

impl ApprovalAction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::RequestChanges => "request_changes",
            Self::Delegate => "delegate",
            Self::Escalate => "escalate",
            Self::Hold => "hold",
            Self::Resume => "resume",
            Self::Recall => "recall",
            Self::Withdraw => "withdraw",
            Self::Bypass => "bypass",
            Self::Reassign => "reassign",
            Self::Comment => "comment",
            Self::Release => "release",
        }
    }
}

impl FromStr for ApprovalAction {
    type Err = ApprovalError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "request_changes" => Ok(Self::RequestChanges),
            "delegate" => Ok(Self::Delegate),
            "escalate" => Ok(Self::Escalate),
            "hold" => Ok(Self::Hold),
            "resume" => Ok(Self::Resume),
            "recall" => Ok(Self::Recall),
            "withdraw" => Ok(Self::Withdraw),
            "bypass" => Ok(Self::Bypass),
            "reassign" => Ok(Self::Reassign),
            "comment" => Ok(Self::Comment),
            "release" => Ok(Self::Release),
            other => Err(ApprovalError::UnknownAction(other.to_string())),
        }
    }
}

/// Explicit decision carried by a `bypass` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

/// One action submitted against an instance (and usually a task).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub tenant_id: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub actor: String,
    pub action: ApprovalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Delegation/reassignment/escalation target principal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Decision carried by `bypass`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    /// Instance version observed by the caller before acting; a stale
    /// value fails with `ConcurrencyConflict`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

impl ActionRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        instance_id: impl Into<String>,
        actor: impl Into<String>,
        action: ApprovalAction,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            instance_id: instance_id.into(),
            task_id: None,
            actor: actor.into(),
            action,
            reason: None,
            note: None,
            target: None,
            decision: None,
            expected_version: None,
        }
    }

    pub fn on_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Outcome of the stage re-evaluation that follows a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    StillOpen,
    Completed,
    Rejected,
}

/// Result of a successfully executed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub instance_id: String,
    pub action: ApprovalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_outcome: Option<StageOutcome>,
    pub instance_status: InstanceStatus,
    /// Instance version after the action.
    pub version: u64,
}
