//! Downstream lifecycle collaborator.
//!
//! On instance completion the engine resumes a paused business-entity
//! transition through this trait. Failures are recorded as audit events
//! and never fail the completing decision.

use crate::error::ApprovalError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A paused business-entity transition to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub tenant_id: String,
    pub entity_name: String,
    pub entity_id: String,
    pub operation_code: String,
    #[serde(default)]
    pub context: Value,
}

/// A lifecycle transition that references an approval template, as
/// reported by impact analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRef {
    pub transition_id: String,
    pub entity_name: String,
    pub operation_code: String,
}

#[async_trait]
pub trait LifecycleManager: Send + Sync {
    /// Resume a paused transition after the guarding approval completed.
    async fn transition(&self, request: TransitionRequest) -> Result<(), ApprovalError>;

    /// Transitions configured to pause on a given approval template code.
    async fn transitions_referencing(
        &self,
        tenant_id: &str,
        template_code: &str,
    ) -> Result<Vec<TransitionRef>, ApprovalError>;
}
