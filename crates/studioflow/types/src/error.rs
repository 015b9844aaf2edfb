//! Error taxonomy for the automation core
//!
//! Invariant violations (`InvalidTransition`, `UnknownStep`) indicate
//! caller misuse and are never retried. External-collaborator failures
//! (`StepRunnerUnavailable`) are retried per the step's retry policy and
//! then surfaced as a terminal failed execution.

use crate::execution::{ExecutionId, ExecutionStatus};
use crate::kanban::{CardId, StageId};
use crate::template::{StepId, TemplateId};
use crate::validate::ValidationError;

/// Errors produced by the automation core
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid status transition from '{from}' to '{to}'")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("execution '{execution_id}' is terminal ('{status}') and permits no further mutation")]
    AlreadyTerminal {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },

    #[error("step '{0}' is not the next declared step of the template")]
    UnknownStep(StepId),

    #[error("workflow template '{0}' not found")]
    TemplateNotFound(TemplateId),

    #[error("workflow template '{0}' is not active")]
    TemplateInactive(TemplateId),

    #[error("a non-terminal execution of template '{template_id}' already exists for card '{card_id}'")]
    DuplicateExecution {
        card_id: CardId,
        template_id: TemplateId,
    },

    #[error("step runner unavailable: {0}")]
    StepRunnerUnavailable(String),

    #[error("trigger configuration error: {0}")]
    ConfigurationError(String),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(ExecutionId),

    #[error("stage '{0}' not found")]
    StageNotFound(StageId),

    #[error("card '{0}' not found")]
    CardNotFound(CardId),

    #[error("stage '{stage_id}' is at its WIP limit of {limit}")]
    WipLimitReached { stage_id: StageId, limit: u32 },

    #[error("move rejected: {0}")]
    MoveRejected(String),

    #[error("stale write for execution '{0}': stored version is newer")]
    Conflict(ExecutionId),

    #[error("validation failed with {} error(s)", .0.len())]
    ValidationFailed(Vec<ValidationError>),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for automation-core operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = WorkflowError::InvalidTransition {
            from: ExecutionStatus::Completed,
            to: ExecutionStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid status transition from 'completed' to 'running'"
        );

        let err = WorkflowError::DuplicateExecution {
            card_id: CardId::new("card-1"),
            template_id: TemplateId::new("t-1"),
        };
        assert!(err.to_string().contains("card-1"));
        assert!(err.to_string().contains("t-1"));
    }

    #[test]
    fn test_validation_failed_count() {
        let err = WorkflowError::ValidationFailed(vec![
            ValidationError::new("name", "too_short", "name must be at least 3 characters"),
            ValidationError::new("steps", "empty", "at least one step is required"),
        ]);
        assert_eq!(err.to_string(), "validation failed with 2 error(s)");
    }
}
