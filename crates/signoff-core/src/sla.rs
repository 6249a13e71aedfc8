//! SLA timers: delayed reminder/escalation jobs per approval task.
//!
//! Scheduling is an advisory cache over the task table, not a source of
//! truth. The queue cannot revoke delivered jobs, so every fired handler
//! re-reads the task and acts only if it is still pending.

use crate::error::ApprovalError;
use crate::events::{ApprovalEvent, TASK_SLA_ESCALATED, TASK_SLA_REMINDER};
use crate::queue::{JobQueue, RetryPolicy, TimerJob, TimerJobHandler, TimerKind};
use crate::storage::ApprovalStore;
use crate::types::{ApprovalEscalation, ApprovalTask};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Fraction of the remaining SLA window after which the reminder fires.
const REMINDER_FRACTION: f64 = 0.75;

/// Outcome of a rehydration scan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RehydrationSummary {
    pub scanned: usize,
    pub reminders_scheduled: usize,
    pub escalations_scheduled: usize,
}

/// Schedules and processes SLA timer jobs.
pub struct SlaTimerService {
    store: Arc<dyn ApprovalStore>,
    queue: Arc<dyn JobQueue>,
    retry: RetryPolicy,
}

impl SlaTimerService {
    pub fn new(store: Arc<dyn ApprovalStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            retry: RetryPolicy::default(),
        }
    }

    /// Schedule a reminder for a task at `fire_at`. No-op when already
    /// past due.
    pub async fn schedule_reminder(
        &self,
        task: &ApprovalTask,
        fire_at: DateTime<Utc>,
    ) -> Result<(), ApprovalError> {
        self.schedule(task, TimerKind::Reminder, fire_at).await
    }

    /// Schedule an escalation for a task at `fire_at`. No-op when already
    /// past due.
    pub async fn schedule_escalation(
        &self,
        task: &ApprovalTask,
        fire_at: DateTime<Utc>,
    ) -> Result<(), ApprovalError> {
        self.schedule(task, TimerKind::Escalation, fire_at).await
    }

    /// Schedule both timers for a task from its `due_at`: a reminder at
    /// 75% of the remaining window and an escalation at the deadline.
    pub async fn schedule_for_task(&self, task: &ApprovalTask) -> Result<(), ApprovalError> {
        let Some(due_at) = task.due_at else {
            return Ok(());
        };
        let now = Utc::now();
        let remaining = due_at - now;
        if remaining <= ChronoDuration::zero() {
            return Ok(());
        }

        let reminder_offset_secs = (remaining.num_seconds() as f64 * REMINDER_FRACTION) as i64;
        let reminder_at = now + ChronoDuration::seconds(reminder_offset_secs);

        self.schedule_reminder(task, reminder_at).await?;
        self.schedule_escalation(task, due_at).await
    }

    async fn schedule(
        &self,
        task: &ApprovalTask,
        kind: TimerKind,
        fire_at: DateTime<Utc>,
    ) -> Result<(), ApprovalError> {
        let delay = fire_at - Utc::now();
        if delay <= ChronoDuration::zero() {
            tracing::debug!(task_id = %task.id, kind = kind.name(), "timer already past due; skipping");
            return Ok(());
        }

        let job = TimerJob::new(kind, task.tenant_id.clone(), task.id.clone(), fire_at);
        let delay = Duration::from_millis(delay.num_milliseconds().max(0) as u64);
        self.queue.enqueue(job, delay, self.retry).await
    }

    /// The queue has no targeted revoke; this only records intent. The
    /// pending-status guard in the fired handlers carries correctness.
    pub fn cancel_timers(&self, task_id: &str) {
        tracing::debug!(task_id, "timer cancellation requested; relying on fire-time status guard");
    }

    pub async fn process_reminder(&self, job: &TimerJob) -> Result<(), ApprovalError> {
        let Some(task) = self.reload_if_pending(job).await? else {
            return Ok(());
        };

        self.store
            .append_event(&ApprovalEvent::new(
                task.tenant_id.clone(),
                task.instance_id.clone(),
                TASK_SLA_REMINDER,
                serde_json::json!({
                    "task_id": task.id,
                    "approver_id": task.approver_id,
                    "due_at": task.due_at,
                }),
            ))
            .await?;

        tracing::info!(task_id = %task.id, approver_id = %task.approver_id, "SLA reminder fired");
        Ok(())
    }

    pub async fn process_escalation(&self, job: &TimerJob) -> Result<(), ApprovalError> {
        let Some(task) = self.reload_if_pending(job).await? else {
            return Ok(());
        };

        let escalation = ApprovalEscalation {
            id: Uuid::new_v4().to_string(),
            tenant_id: task.tenant_id.clone(),
            instance_id: task.instance_id.clone(),
            task_id: task.id.clone(),
            escalated_to: None,
            reason: Some("sla_deadline_exceeded".to_string()),
            occurred_at: Utc::now(),
        };
        self.store.insert_escalation(&escalation).await?;

        self.store
            .append_event(&ApprovalEvent::new(
                task.tenant_id.clone(),
                task.instance_id.clone(),
                TASK_SLA_ESCALATED,
                serde_json::json!({
                    "task_id": task.id,
                    "approver_id": task.approver_id,
                    "due_at": task.due_at,
                }),
            ))
            .await?;

        tracing::warn!(task_id = %task.id, "SLA deadline exceeded; escalation recorded");
        Ok(())
    }

    /// Reload the task a fired job points at. Stale fires racing a
    /// decision silently no-op here.
    async fn reload_if_pending(
        &self,
        job: &TimerJob,
    ) -> Result<Option<ApprovalTask>, ApprovalError> {
        let task = self.store.find_task(&job.tenant_id, &job.task_id).await?;
        match task {
            Some(task) if task.is_pending() => Ok(Some(task)),
            Some(task) => {
                tracing::debug!(
                    task_id = %task.id,
                    status = ?task.status,
                    kind = job.kind.name(),
                    "stale timer fire ignored"
                );
                Ok(None)
            }
            None => {
                tracing::debug!(task_id = %job.task_id, "timer fired for unknown task; ignoring");
                Ok(None)
            }
        }
    }

    /// Rescan open tasks after a restart and re-derive their timers.
    ///
    /// Only the due date survives a restart, so the reminder is placed at
    /// 75% of the time still remaining. Job ids are deterministic per
    /// task and kind, which lets the queue drop duplicates when
    /// rehydration runs more than once.
    pub async fn rehydrate_pending_timers(
        &self,
        tenant_id: &str,
    ) -> Result<RehydrationSummary, ApprovalError> {
        let pending = self.store.list_pending_tasks(tenant_id).await?;
        let now = Utc::now();
        let mut summary = RehydrationSummary {
            scanned: pending.len(),
            ..Default::default()
        };

        for task in pending {
            let Some(due_at) = task.due_at else {
                continue;
            };
            if due_at <= now {
                continue;
            }

            let remaining = due_at - now;
            let reminder_offset_secs =
                (remaining.num_seconds() as f64 * REMINDER_FRACTION) as i64;
            let reminder_at = now + ChronoDuration::seconds(reminder_offset_secs);

            self.schedule_reminder(&task, reminder_at).await?;
            summary.reminders_scheduled += 1;
            self.schedule_escalation(&task, due_at).await?;
            summary.escalations_scheduled += 1;
        }

        tracing::info!(
            tenant_id,
            scanned = summary.scanned,
            reminders = summary.reminders_scheduled,
            escalations = summary.escalations_scheduled,
            "SLA timers rehydrated"
        );
        Ok(summary)
    }
}

#[async_trait]
impl TimerJobHandler for SlaTimerService {
    async fn handle(&self, job: &TimerJob) -> Result<(), ApprovalError> {
        match job.kind {
            TimerKind::Reminder => self.process_reminder(job).await,
            TimerKind::Escalation => self.process_escalation(job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::template::StageMode;
    use crate::types::{InstanceStage, StageStatus, TaskStatus};
    use tokio::sync::Mutex;

    /// Queue fixture that records enqueued jobs instead of running them.
    #[derive(Default)]
    struct RecordingQueue {
        jobs: Mutex<Vec<(TimerJob, Duration)>>,
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn enqueue(
            &self,
            job: TimerJob,
            delay: Duration,
            _retry: RetryPolicy,
        ) -> Result<(), ApprovalError> {
            self.jobs.lock().await.push((job, delay));
            Ok(())
        }
    }

    fn pending_task(id: &str, due_in_secs: i64) -> ApprovalTask {
        ApprovalTask {
            id: id.to_string(),
            tenant_id: "tenant-a".to_string(),
            instance_id: "inst-1".to_string(),
            stage_id: "stage-1".to_string(),
            stage_no: 1,
            approver_id: "p-1".to_string(),
            original_approver_id: "p-1".to_string(),
            status: TaskStatus::Pending,
            decided_at: None,
            decided_by: None,
            decision_note: None,
            due_at: Some(Utc::now() + ChronoDuration::seconds(due_in_secs)),
            created_at: Utc::now(),
        }
    }

    fn stage() -> InstanceStage {
        InstanceStage {
            id: "stage-1".to_string(),
            instance_id: "inst-1".to_string(),
            stage_no: 1,
            mode: StageMode::Serial,
            quorum: None,
            sla_secs: Some(3_600),
            status: StageStatus::Open,
            activated_at: Some(Utc::now()),
            closed_at: None,
        }
    }

    async fn service_with_task(
        task: &ApprovalTask,
    ) -> (SlaTimerService, Arc<MemoryStore>, Arc<RecordingQueue>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_stage(&stage()).await.unwrap();
        store.insert_task(task).await.unwrap();
        let queue = Arc::new(RecordingQueue::default());
        let service = SlaTimerService::new(store.clone(), queue.clone());
        (service, store, queue)
    }

    #[tokio::test]
    async fn schedules_reminder_and_escalation_from_due_at() {
        let task = pending_task("task-1", 1_000);
        let (service, _store, queue) = service_with_task(&task).await;

        service.schedule_for_task(&task).await.unwrap();

        let jobs = queue.jobs.lock().await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].0.job_id, "task-1:reminder");
        assert_eq!(jobs[1].0.job_id, "task-1:escalation");
        // Reminder lands at roughly 75% of the window.
        assert!(jobs[0].1 < jobs[1].1);
        assert!(jobs[0].1 >= Duration::from_secs(700));
    }

    #[tokio::test]
    async fn past_due_scheduling_is_a_no_op() {
        let task = pending_task("task-1", -10);
        let (service, _store, queue) = service_with_task(&task).await;

        service.schedule_for_task(&task).await.unwrap();
        assert!(queue.jobs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn fired_reminder_for_decided_task_writes_nothing() {
        let mut task = pending_task("task-1", 1_000);
        task.status = TaskStatus::Approved;
        let (service, store, _queue) = service_with_task(&task).await;

        let job = TimerJob::new(
            TimerKind::Reminder,
            "tenant-a",
            "task-1",
            Utc::now(),
        );
        service.process_reminder(&job).await.unwrap();

        assert!(store.list_events("inst-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fired_escalation_for_decided_task_writes_nothing() {
        let mut task = pending_task("task-1", 1_000);
        task.status = TaskStatus::Rejected;
        let (service, store, _queue) = service_with_task(&task).await;

        let job = TimerJob::new(
            TimerKind::Escalation,
            "tenant-a",
            "task-1",
            Utc::now(),
        );
        service.process_escalation(&job).await.unwrap();

        assert!(store.list_escalations("inst-1").await.unwrap().is_empty());
        assert!(store.list_events("inst-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fired_escalation_for_pending_task_records_row_and_event() {
        let task = pending_task("task-1", 1_000);
        let (service, store, _queue) = service_with_task(&task).await;

        let job = TimerJob::new(
            TimerKind::Escalation,
            "tenant-a",
            "task-1",
            Utc::now(),
        );
        service.process_escalation(&job).await.unwrap();

        let escalations = store.list_escalations("inst-1").await.unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].task_id, "task-1");

        let events = store.list_events("inst-1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, TASK_SLA_ESCALATED);
    }

    #[tokio::test]
    async fn rehydration_scans_pending_tasks_with_future_due_dates() {
        let store = Arc::new(MemoryStore::new());
        store.insert_stage(&stage()).await.unwrap();
        store.insert_task(&pending_task("task-live", 1_000)).await.unwrap();
        store.insert_task(&pending_task("task-overdue", -100)).await.unwrap();
        let mut decided = pending_task("task-decided", 1_000);
        decided.status = TaskStatus::Approved;
        store.insert_task(&decided).await.unwrap();

        let queue = Arc::new(RecordingQueue::default());
        let service = SlaTimerService::new(store, queue.clone());

        let summary = service.rehydrate_pending_timers("tenant-a").await.unwrap();
        assert_eq!(summary.scanned, 2); // pending only
        assert_eq!(summary.reminders_scheduled, 1);
        assert_eq!(summary.escalations_scheduled, 1);

        let jobs = queue.jobs.lock().await;
        let ids: Vec<&str> = jobs.iter().map(|(job, _)| job.job_id.as_str()).collect();
        assert!(ids.contains(&"task-live:reminder"));
        assert!(ids.contains(&"task-live:escalation"));
    }
}
