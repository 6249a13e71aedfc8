use thiserror::Error;

/// Approval engine errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task '{0}' is not pending")]
    TaskNotPending(String),

    #[error("Concurrent modification detected on instance '{instance_id}': expected version {expected}, found {found}")]
    ConcurrencyConflict {
        instance_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Could not acquire instance lock within {0}ms")]
    LockUnavailable(u64),

    #[error("Action not allowed: {0}")]
    ActionNotAllowed(String),

    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("An open approval instance already exists for {entity_name}/{entity_id}")]
    DuplicateInstance {
        entity_name: String,
        entity_id: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Job queue error: {0}")]
    Queue(String),
}

impl ApprovalError {
    pub fn conflict(instance_id: impl Into<String>, expected: u64, found: u64) -> Self {
        Self::ConcurrencyConflict {
            instance_id: instance_id.into(),
            expected,
            found,
        }
    }
}
