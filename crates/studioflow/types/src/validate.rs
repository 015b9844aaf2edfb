//! Boundary validation
//!
//! Field-level constraints checked where input enters the system. The
//! state machine and evaluator assume already-validated values; nothing
//! here runs on the hot path.

use crate::error::{WorkflowError, WorkflowResult};
use crate::kanban::{KanbanCard, KanbanStage, TriggerCondition};
use crate::template::WorkflowTemplate;

/// One field-level constraint violation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// The offending field, dotted-path form (`steps[2].name`)
    pub field: String,
    /// Machine-readable code (`too_short`, `empty`, ...)
    pub code: &'static str,
    /// Human-readable message
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.code)
    }
}

fn check_length(
    errors: &mut Vec<ValidationError>,
    field: &str,
    value: &str,
    min: usize,
    max: usize,
) {
    let len = value.chars().count();
    if len < min {
        errors.push(ValidationError::new(
            field,
            "too_short",
            format!("must be at least {} characters", min),
        ));
    } else if len > max {
        errors.push(ValidationError::new(
            field,
            "too_long",
            format!("must be at most {} characters", max),
        ));
    }
}

/// Validate a template at the boundary: name/description lengths, step
/// fields, and structural correctness (unique ids, resolvable branches).
pub fn validate_template(template: &WorkflowTemplate) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    check_length(&mut errors, "name", &template.name, 3, 100);
    if !template.description.is_empty() {
        check_length(&mut errors, "description", &template.description, 0, 1000);
    }

    if template.steps.is_empty() {
        errors.push(ValidationError::new(
            "steps",
            "empty",
            "at least one step is required",
        ));
    }

    for (i, step) in template.steps.iter().enumerate() {
        let path = format!("steps[{}]", i);
        check_length(&mut errors, &format!("{}.name", path), &step.name, 1, 100);
        if !step.description.is_empty() {
            check_length(
                &mut errors,
                &format!("{}.description", path),
                &step.description,
                0,
                500,
            );
        }
        if step.action_type.is_empty() {
            errors.push(ValidationError::new(
                format!("{}.action_type", path),
                "empty",
                "an action type is required",
            ));
        }
        if step.error_handling.retry_policy.max_attempts == 0 {
            errors.push(ValidationError::new(
                format!("{}.error_handling.retry_policy.max_attempts", path),
                "out_of_range",
                "must be at least 1",
            ));
        }
    }

    if let Err(err) = template.validate() {
        errors.push(ValidationError::new("steps", "structure", err.to_string()));
    }

    errors
}

/// Validate a stage at the boundary: name length and trigger-condition
/// well-formedness (ordering operators require a numeric operand).
pub fn validate_stage(stage: &KanbanStage) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    check_length(&mut errors, "name", &stage.name, 1, 50);

    for (i, trigger) in stage.automation_config.workflow_triggers.iter().enumerate() {
        for (j, condition) in trigger.conditions.iter().enumerate() {
            if let TriggerCondition::AttributeChange {
                field_name,
                operator,
                field_value,
            } = condition
            {
                let path = format!("automation_config.workflow_triggers[{}].conditions[{}]", i, j);
                if field_name.is_empty() {
                    errors.push(ValidationError::new(
                        format!("{}.field_name", path),
                        "empty",
                        "a field name is required",
                    ));
                }
                if operator.is_ordering() && field_value.as_number().is_none() {
                    errors.push(ValidationError::new(
                        format!("{}.field_value", path),
                        "not_numeric",
                        format!(
                            "operator '{}' requires a numeric value, got '{}'",
                            operator, field_value
                        ),
                    ));
                }
            }
        }
    }

    errors
}

/// Validate a card at the boundary: title and blocked-reason lengths.
pub fn validate_card(card: &KanbanCard) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    check_length(&mut errors, "title", &card.title, 1, 200);
    if let Some(reason) = &card.blocked_reason {
        check_length(&mut errors, "blocked_reason", reason, 0, 500);
    }

    errors
}

/// Fold a validation error list into a `WorkflowResult`
pub fn ensure_valid(errors: Vec<ValidationError>) -> WorkflowResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::ValidationFailed(errors))
    }
}
