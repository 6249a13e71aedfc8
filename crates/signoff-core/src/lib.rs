//! Approval workflow orchestration core.
//!
//! This crate implements multi-stage, multi-strategy approval routing
//! with quorum-based stage completion, SLA timers that survive restarts,
//! optimistic-lock-protected action execution, and versioned templates
//! with hash-addressed compiled artifacts.

#![deny(unsafe_code)]

pub mod cache;
pub mod condition;
pub mod directory;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod postgres;
pub mod queue;
pub mod resolver;
pub mod sla;
pub mod storage;
pub mod template;
pub mod templates;
pub mod types;

pub use cache::{MemoryCache, ResolutionCache, RESOLUTION_CACHE_TTL_SECS};
pub use condition::{
    evaluate, CompareOp, ConditionGroup, ConditionNode, ConditionRule, GroupOperator,
};
pub use directory::{DirectoryProvider, MAX_HIERARCHY_DEPTH};
pub use engine::{stage_outcome, ApprovalEngine, EngineConfig};
pub use error::ApprovalError;
pub use events::{ApprovalEvent, ApprovalEventHandler};
pub use lifecycle::{LifecycleManager, TransitionRef, TransitionRequest};
pub use postgres::PostgresStore;
pub use queue::{JobQueue, RetryPolicy, TimerJob, TimerJobHandler, TimerKind};
pub use resolver::{ApproverResolver, Resolution};
pub use sla::{RehydrationSummary, SlaTimerService};
pub use storage::{bootstrap_store, ApprovalStore, MemoryStore, StorageConfig};
pub use template::{
    compile_template, validate_template, ApprovalTemplate, AssignStrategy, AssignmentTarget,
    CompiledTemplate, Quorum, QuorumKind, RoutingRule, StageMode, TemplateStage, ValidationIssue,
    ValidationReport,
};
pub use templates::{ImpactReport, NewTemplate, TemplateDiff, TemplateStore, TemplateUpdate};
pub use types::{
    ActionOutcome, ActionRequest, ApprovalAction, ApprovalEscalation, ApprovalInstance,
    ApprovalTask, AssignmentSnapshot, CancelReason, CreateInstanceOutcome, CreateInstanceRequest,
    CreateStatus, Decision, InstanceStage, InstanceStatus, StageOutcome, StageStatus, TaskStatus,
};
