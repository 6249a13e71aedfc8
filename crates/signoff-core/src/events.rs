//! Append-only approval event log.
//!
//! Every state transition becomes an additional record; events are never
//! mutated or deleted. Registered handlers receive each event after it is
//! persisted; handler failures are logged and never propagated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const INSTANCE_CREATED: &str = "instance.created";
pub const INSTANCE_COMPLETED: &str = "instance.completed";
pub const INSTANCE_CANCELED: &str = "instance.canceled";
pub const INSTANCE_HELD: &str = "instance.held";
pub const INSTANCE_RESUMED: &str = "instance.resumed";
pub const STAGE_ACTIVATED: &str = "stage.activated";
pub const STAGE_COMPLETED: &str = "stage.completed";
pub const STAGE_CANCELED: &str = "stage.canceled";
pub const STAGE_SKIPPED: &str = "stage.skipped";
pub const TASK_CREATED: &str = "task.created";
pub const TASK_DECIDED: &str = "task.decided";
pub const TASK_DELEGATED: &str = "task.delegated";
pub const TASK_REASSIGNED: &str = "task.reassigned";
pub const TASK_RELEASED: &str = "task.released";
pub const TASK_WITHDRAWN: &str = "task.withdrawn";
pub const TASK_ESCALATED: &str = "task.escalated";
pub const TASK_SLA_REMINDER: &str = "task.sla.reminder";
pub const TASK_SLA_ESCALATED: &str = "task.sla.escalated";
pub const CHANGES_REQUESTED: &str = "instance.changes_requested";
pub const COMMENT_ADDED: &str = "comment.added";
pub const LIFECYCLE_RESUME_FAILED: &str = "lifecycle.resume_failed";

/// One record in the per-instance audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub event_type: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl ApprovalEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        instance_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            instance_id: instance_id.into(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// Observer of persisted approval events.
#[async_trait]
pub trait ApprovalEventHandler: Send + Sync {
    async fn on_event(&self, event: &ApprovalEvent) -> Result<(), crate::error::ApprovalError>;
}
