//! Collaborator adapters for the approval engine.
//!
//! Deterministic in-process implementations of the directory, job queue,
//! lifecycle, and cache seams, used by the service wiring and by tests.

#![deny(unsafe_code)]

use async_trait::async_trait;
use serde_json::Value;
use signoff_core::{
    ApprovalError, DirectoryProvider, JobQueue, LifecycleManager, ResolutionCache, RetryPolicy,
    TimerJob, TimerJobHandler, TransitionRef, TransitionRequest,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// In-memory directory fixture with explicit organizational-unit parent
/// pointers. Cycles are representable on purpose; the resolver is the
/// one responsible for guarding against them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    roles: HashMap<String, Vec<String>>,
    groups: HashMap<String, Vec<String>>,
    unit_members: HashMap<String, Vec<String>>,
    principal_units: HashMap<String, String>,
    unit_parents: HashMap<String, String>,
    metadata: HashMap<String, Value>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: impl Into<String>, principals: Vec<&str>) -> Self {
        self.roles.insert(
            role.into(),
            principals.into_iter().map(str::to_string).collect(),
        );
        self
    }

    pub fn with_group(mut self, group: impl Into<String>, members: Vec<&str>) -> Self {
        self.groups.insert(
            group.into(),
            members.into_iter().map(str::to_string).collect(),
        );
        self
    }

    /// Register a unit with an optional parent and its attached members.
    pub fn with_unit(
        mut self,
        unit: impl Into<String>,
        parent: Option<&str>,
        members: Vec<&str>,
    ) -> Self {
        let unit = unit.into();
        if let Some(parent) = parent {
            self.unit_parents.insert(unit.clone(), parent.to_string());
        }
        for member in &members {
            self.principal_units
                .insert((*member).to_string(), unit.clone());
        }
        self.unit_members
            .insert(unit, members.into_iter().map(str::to_string).collect());
        self
    }

    pub fn with_metadata(mut self, principal: impl Into<String>, document: Value) -> Self {
        self.metadata.insert(principal.into(), document);
        self
    }

    /// True when `unit` sits inside the subtree rooted at `root`.
    fn in_subtree(&self, unit: &str, root: &str) -> bool {
        let mut current = unit.to_string();
        let mut seen = HashSet::new();
        loop {
            if current == root {
                return true;
            }
            if !seen.insert(current.clone()) {
                return false;
            }
            match self.unit_parents.get(&current) {
                Some(parent) => current = parent.clone(),
                None => return false,
            }
        }
    }
}

#[async_trait]
impl DirectoryProvider for InMemoryDirectory {
    async fn principals_with_role(
        &self,
        _tenant_id: &str,
        role: &str,
        unit: Option<&str>,
    ) -> Result<Vec<String>, ApprovalError> {
        let holders = self.roles.get(role).cloned().unwrap_or_default();
        match unit {
            None => Ok(holders),
            Some(root) => Ok(holders
                .into_iter()
                .filter(|principal| {
                    self.principal_units
                        .get(principal)
                        .map(|u| self.in_subtree(u, root))
                        .unwrap_or(false)
                })
                .collect()),
        }
    }

    async fn group_members(
        &self,
        _tenant_id: &str,
        group: &str,
    ) -> Result<Vec<String>, ApprovalError> {
        Ok(self.groups.get(group).cloned().unwrap_or_default())
    }

    async fn unit_principals(
        &self,
        _tenant_id: &str,
        unit: &str,
    ) -> Result<Vec<String>, ApprovalError> {
        Ok(self.unit_members.get(unit).cloned().unwrap_or_default())
    }

    async fn principal_unit(
        &self,
        _tenant_id: &str,
        principal: &str,
    ) -> Result<Option<String>, ApprovalError> {
        Ok(self.principal_units.get(principal).cloned())
    }

    async fn unit_parent(
        &self,
        _tenant_id: &str,
        unit: &str,
    ) -> Result<Option<String>, ApprovalError> {
        Ok(self.unit_parents.get(unit).cloned())
    }

    async fn principals_with_metadata(
        &self,
        _tenant_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<Vec<String>, ApprovalError> {
        let mut matches: Vec<String> = self
            .metadata
            .iter()
            .filter(|(_, document)| match document.get(key) {
                Some(Value::Array(items)) => items.contains(value),
                Some(field) => field == value,
                None => false,
            })
            .map(|(principal, _)| principal.clone())
            .collect();
        matches.sort();
        Ok(matches)
    }
}

/// In-process delayed job queue on top of tokio timers.
///
/// At-least-once semantics with bounded retries and exponential backoff;
/// duplicate job ids are dropped while the original is still queued,
/// which is what keeps timer rehydration from double-firing.
#[derive(Default)]
pub struct TokioJobQueue {
    handler: Arc<RwLock<Option<Arc<dyn TimerJobHandler>>>>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl TokioJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the consumer. Jobs firing before a handler is registered
    /// are dropped with a warning.
    pub async fn register_handler(&self, handler: Arc<dyn TimerJobHandler>) {
        *self.handler.write().await = Some(handler);
    }

    pub async fn active_jobs(&self) -> usize {
        self.active.lock().await.len()
    }
}

#[async_trait]
impl JobQueue for TokioJobQueue {
    async fn enqueue(
        &self,
        job: TimerJob,
        delay: Duration,
        retry: RetryPolicy,
    ) -> Result<(), ApprovalError> {
        {
            let mut active = self.active.lock().await;
            if !active.insert(job.job_id.clone()) {
                tracing::debug!(job_id = %job.job_id, "duplicate timer job dropped");
                return Ok(());
            }
        }

        let handler = self.handler.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let handler = handler.read().await.clone();
            match handler {
                Some(handler) => {
                    for attempt in 1..=retry.attempts.max(1) {
                        match handler.handle(&job).await {
                            Ok(()) => break,
                            Err(err) if attempt < retry.attempts => {
                                tracing::warn!(
                                    job_id = %job.job_id,
                                    attempt,
                                    error = %err,
                                    "timer job failed; retrying"
                                );
                                tokio::time::sleep(retry.backoff_for(attempt)).await;
                            }
                            Err(err) => {
                                tracing::error!(
                                    job_id = %job.job_id,
                                    error = %err,
                                    "timer job exhausted retries"
                                );
                            }
                        }
                    }
                }
                None => {
                    tracing::warn!(job_id = %job.job_id, "timer job fired with no handler registered");
                }
            }

            active.lock().await.remove(&job.job_id);
        });

        Ok(())
    }
}

/// Lifecycle manager that records every resume call; doubles as a no-op
/// for local runs without a host lifecycle module.
#[derive(Default)]
pub struct RecordingLifecycleManager {
    transitions: Mutex<Vec<TransitionRequest>>,
    references: Vec<TransitionRef>,
}

impl RecordingLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference(mut self, reference: TransitionRef) -> Self {
        self.references.push(reference);
        self
    }

    pub async fn recorded(&self) -> Vec<TransitionRequest> {
        self.transitions.lock().await.clone()
    }
}

#[async_trait]
impl LifecycleManager for RecordingLifecycleManager {
    async fn transition(&self, request: TransitionRequest) -> Result<(), ApprovalError> {
        tracing::info!(
            entity_name = %request.entity_name,
            entity_id = %request.entity_id,
            operation_code = %request.operation_code,
            "lifecycle transition resumed"
        );
        self.transitions.lock().await.push(request);
        Ok(())
    }

    async fn transitions_referencing(
        &self,
        _tenant_id: &str,
        _template_code: &str,
    ) -> Result<Vec<TransitionRef>, ApprovalError> {
        Ok(self.references.clone())
    }
}

/// Cache that fails every call, for exercising the cache-bypass paths.
#[derive(Debug, Clone, Default)]
pub struct AlwaysFailCache;

#[async_trait]
impl ResolutionCache for AlwaysFailCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, ApprovalError> {
        Err(ApprovalError::Storage("cache unavailable".to_string()))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), ApprovalError> {
        Err(ApprovalError::Storage("cache unavailable".to_string()))
    }
}
