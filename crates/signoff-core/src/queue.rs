//! Job-queue collaborator for delayed SLA timer jobs.
//!
//! The queue guarantees at-least-once delivery with bounded retries;
//! fired handlers must therefore guard on current task state.

use crate::error::ApprovalError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Kind of SLA timer a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Reminder,
    Escalation,
}

impl TimerKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Reminder => "reminder",
            Self::Escalation => "escalation",
        }
    }
}

/// A delayed timer job tied to one approval task.
///
/// `job_id` is deterministic (`"{task_id}:{kind}"`) so queue-level
/// dedup bounds double-scheduling across rehydration runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerJob {
    pub job_id: String,
    pub kind: TimerKind,
    pub tenant_id: String,
    pub task_id: String,
    pub fire_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl TimerJob {
    pub fn new(
        kind: TimerKind,
        tenant_id: impl Into<String>,
        task_id: impl Into<String>,
        fire_at: DateTime<Utc>,
    ) -> Self {
        let task_id = task_id.into();
        Self {
            job_id: format!("{}:{}", task_id, kind.name()),
            kind,
            tenant_id: tenant_id.into(),
            task_id,
            fire_at,
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Retry policy for enqueued jobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay before retry `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base * 2_u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Delayed-job enqueue surface.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        job: TimerJob,
        delay: Duration,
        retry: RetryPolicy,
    ) -> Result<(), ApprovalError>;
}

/// Consumer side: the SLA service implements this and the queue drives it.
#[async_trait]
pub trait TimerJobHandler: Send + Sync {
    async fn handle(&self, job: &TimerJob) -> Result<(), ApprovalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_deterministic_per_task_and_kind() {
        let fire_at = Utc::now();
        let a = TimerJob::new(TimerKind::Reminder, "t", "task-1", fire_at);
        let b = TimerJob::new(TimerKind::Reminder, "t", "task-1", fire_at);
        assert_eq!(a.job_id, b.job_id);
        assert_eq!(a.job_id, "task-1:reminder");

        let c = TimerJob::new(TimerKind::Escalation, "t", "task-1", fire_at);
        assert_eq!(c.job_id, "task-1:escalation");
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(8));
    }
}
