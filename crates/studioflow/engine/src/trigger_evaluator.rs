//! Trigger condition evaluator
//!
//! Decides which templates to fire for a committed card mutation. The
//! evaluator is pure decision logic: it never dispatches, never mutates,
//! and assumes the mutation is already committed: WIP limits and
//! movement rules were enforced upstream by the board.

use studioflow_types::{
    CardMutation, CompareOp, FieldValue, KanbanCard, KanbanStage, TemplateId, TriggerCondition,
    WorkflowError, WorkflowResult,
};

/// Evaluates stage trigger configuration against card snapshots
#[derive(Clone, Copy, Debug, Default)]
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Return the templates to dispatch for a committed mutation.
    ///
    /// Matching conditions each contribute their template independently;
    /// the same template matched more than once in a single call fires
    /// once. Malformed conditions (an ordering operator over non-numeric
    /// operands) are reported at `warn` and skipped, never a crash.
    ///
    /// Blocked cards are evaluated like any other; triggers are not
    /// gated on block status.
    pub fn evaluate(
        &self,
        stage: &KanbanStage,
        card: &KanbanCard,
        mutation: &CardMutation,
    ) -> Vec<TemplateId> {
        if !stage.triggers_enabled() {
            return Vec::new();
        }

        let mut matched: Vec<TemplateId> = Vec::new();
        for trigger in stage.active_triggers() {
            for condition in &trigger.conditions {
                let hit = match (condition, mutation) {
                    (TriggerCondition::StageEntry, CardMutation::StageEntry { .. }) => true,

                    (
                        TriggerCondition::AttributeChange {
                            field_name,
                            operator,
                            field_value,
                        },
                        CardMutation::AttributeChange {
                            field, new_value, ..
                        },
                    ) if field_name == field => {
                        match compare(new_value, *operator, field_value) {
                            Ok(hit) => hit,
                            Err(err) => {
                                tracing::warn!(
                                    stage_id = %stage.id,
                                    template_id = %trigger.template_id,
                                    field = %field_name,
                                    %err,
                                    "Skipping malformed trigger condition"
                                );
                                false
                            }
                        }
                    }

                    _ => false,
                };

                if hit && !matched.contains(&trigger.template_id) {
                    tracing::debug!(
                        stage_id = %stage.id,
                        card_id = %card.id,
                        template_id = %trigger.template_id,
                        "Trigger condition matched"
                    );
                    matched.push(trigger.template_id.clone());
                }
            }
        }

        matched
    }
}

/// Compare a card's new value against a condition's expected value.
///
/// Numeric comparison when both operands parse as numbers; otherwise only
/// equality operators are defined and an ordering operator is a
/// configuration error.
pub fn compare(
    new_value: &FieldValue,
    operator: CompareOp,
    expected: &FieldValue,
) -> WorkflowResult<bool> {
    if let (Some(lhs), Some(rhs)) = (new_value.as_number(), expected.as_number()) {
        return Ok(match operator {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Gte => lhs >= rhs,
            CompareOp::Lte => lhs <= rhs,
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
        });
    }

    if operator.is_ordering() {
        return Err(WorkflowError::ConfigurationError(format!(
            "operator '{}' requires numeric operands, got '{}' and '{}'",
            operator, new_value, expected
        )));
    }

    let equal = new_value == expected;
    Ok(match operator {
        CompareOp::Eq => equal,
        CompareOp::Ne => !equal,
        _ => unreachable!("ordering operators handled above"),
    })
}
