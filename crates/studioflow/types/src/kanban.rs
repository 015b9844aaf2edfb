//! Kanban boards: stages, cards, and the trigger wiring between them
//!
//! Stages carry automation configuration: a list of workflow triggers,
//! each binding a template to one or more conditions. Cards carry the
//! custom fields those conditions are evaluated against.
//!
//! Position invariants: stage positions are unique and contiguous from 0
//! within a board; card positions are unique and contiguous from 0 within
//! `(board_id, stage_id)`. The engine's board module maintains both.

use crate::execution::ExecutionId;
use crate::ids::{BoardId, UserId};
use crate::template::TemplateId;
use crate::value::{FieldMap, FieldValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a kanban stage
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageId(pub String);

impl StageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a kanban card
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CardId(pub String);

impl CardId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for CardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Trigger Conditions ───────────────────────────────────────────────

/// Comparison operator in an attribute-change condition.
///
/// Serialized as the operator symbol (`>`, `<`, `=`, `>=`, `<=`, `!=`),
/// the wire form the platform's stage configuration uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "!=")]
    Ne,
}

impl CompareOp {
    /// Ordering operators require numeric operands
    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::Gt | Self::Lt | Self::Gte | Self::Lte)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Eq => "=",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Ne => "!=",
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A rule that, when matched, dispatches a template.
///
/// Evaluated against the card's post-mutation snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Fires unconditionally on any card entering the stage
    StageEntry,
    /// Fires when the named field's new value satisfies the comparison
    AttributeChange {
        field_name: String,
        operator: CompareOp,
        field_value: FieldValue,
    },
}

/// One trigger entry in a stage's automation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageTrigger {
    /// The template to dispatch when a condition matches
    pub template_id: TemplateId,
    /// Conditions, each evaluated independently
    pub conditions: Vec<TriggerCondition>,
    /// Inactive entries are skipped by the evaluator
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl StageTrigger {
    pub fn new(template_id: TemplateId) -> Self {
        Self {
            template_id,
            conditions: Vec::new(),
            is_active: true,
        }
    }

    pub fn on_stage_entry(mut self) -> Self {
        self.conditions.push(TriggerCondition::StageEntry);
        self
    }

    pub fn on_attribute(
        mut self,
        field_name: impl Into<String>,
        operator: CompareOp,
        field_value: impl Into<FieldValue>,
    ) -> Self {
        self.conditions.push(TriggerCondition::AttributeChange {
            field_name: field_name.into(),
            operator,
            field_value: field_value.into(),
        });
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

// ── Stage ────────────────────────────────────────────────────────────

/// Stage category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Backlog,
    #[default]
    Todo,
    InProgress,
    Review,
    Testing,
    Done,
    Archived,
    Custom,
}

/// Coarse capability flag for a stage's automation.
///
/// The trigger list in [`AutomationConfig`] is consulted only when this is
/// `WorkflowTrigger`; the flag gates the list, it does not replace it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageAutomation {
    #[default]
    None,
    AutoAssign,
    WorkflowTrigger,
    Notification,
    TimeTracking,
}

/// Automation wiring attached to a stage
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AutomationConfig {
    /// Trigger entries evaluated on card mutations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflow_triggers: Vec<StageTrigger>,
    /// Free-form rules for automation kinds this core does not interpret
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub custom_rules: FieldMap,
}

/// Stage rules and policies enforced on card movement
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StageRules {
    /// Cards may not move from this stage back to an earlier one
    #[serde(default)]
    pub prevent_move_back: bool,
    /// Cards entering this stage must have an assignee
    #[serde(default)]
    pub require_assignee: bool,
}

/// A kanban column, optionally carrying trigger conditions
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KanbanStage {
    /// Unique identifier
    pub id: StageId,
    /// The board that owns this stage
    pub board_id: BoardId,
    /// Stage name
    pub name: String,
    /// Stage category
    pub stage_type: StageType,
    /// Position within the board (0-based, unique, contiguous)
    pub position: u32,
    /// Maximum concurrent active cards, when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wip_limit: Option<u32>,
    /// Coarse automation capability flag
    #[serde(default)]
    pub automation: StageAutomation,
    /// Trigger wiring, consulted when `automation` permits
    #[serde(default)]
    pub automation_config: AutomationConfig,
    /// Movement rules
    #[serde(default)]
    pub rules: StageRules,
    /// Who created the stage
    pub created_by: UserId,
    /// When the stage was created
    pub created_at: DateTime<Utc>,
    /// When the stage was last updated
    pub updated_at: DateTime<Utc>,
}

impl KanbanStage {
    pub fn new(name: impl Into<String>, board_id: BoardId, created_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: StageId::generate(),
            board_id,
            name: name.into(),
            stage_type: StageType::default(),
            position: 0,
            wip_limit: None,
            automation: StageAutomation::default(),
            automation_config: AutomationConfig::default(),
            rules: StageRules::default(),
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_stage_type(mut self, stage_type: StageType) -> Self {
        self.stage_type = stage_type;
        self
    }

    pub fn with_wip_limit(mut self, limit: u32) -> Self {
        self.wip_limit = Some(limit);
        self
    }

    pub fn with_trigger(mut self, trigger: StageTrigger) -> Self {
        self.automation = StageAutomation::WorkflowTrigger;
        self.automation_config.workflow_triggers.push(trigger);
        self
    }

    pub fn with_rules(mut self, rules: StageRules) -> Self {
        self.rules = rules;
        self
    }

    /// Whether the trigger list should be consulted at all
    pub fn triggers_enabled(&self) -> bool {
        self.automation == StageAutomation::WorkflowTrigger
    }

    /// Active trigger entries, regardless of the capability flag
    pub fn active_triggers(&self) -> impl Iterator<Item = &StageTrigger> {
        self.automation_config
            .workflow_triggers
            .iter()
            .filter(|t| t.is_active)
    }
}

// ── Card ─────────────────────────────────────────────────────────────

/// Card priority level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CardPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Card visibility status; only `active` cards count against WIP limits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    #[default]
    Active,
    Archived,
    Deleted,
}

/// A work item on a kanban board
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KanbanCard {
    /// Unique identifier
    pub id: CardId,
    /// The board that owns this card
    pub board_id: BoardId,
    /// The stage the card is currently located in
    pub stage_id: StageId,
    /// Card title
    pub title: String,
    /// Priority level
    #[serde(default)]
    pub priority: CardPriority,
    /// Visibility status
    #[serde(default)]
    pub status: CardStatus,
    /// Position within the stage (0-based, unique, contiguous)
    pub position: u32,
    /// Assigned user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<UserId>,
    /// Custom field values evaluated by trigger conditions
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub custom_fields: FieldMap,
    /// Cards this card depends on (graph edges, not ownership)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<CardId>,
    /// Cards that depend on this card
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<CardId>,
    /// Whether the card is blocked. Does not gate trigger evaluation
    #[serde(default)]
    pub is_blocked: bool,
    /// Why the card is blocked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    /// Back-reference to the most recent execution this card fired.
    /// The execution's lifecycle is independent of the card's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_execution_id: Option<ExecutionId>,
    /// Who created the card
    pub created_by: UserId,
    /// When the card was created
    pub created_at: DateTime<Utc>,
    /// When the card was last updated
    pub updated_at: DateTime<Utc>,
}

impl KanbanCard {
    pub fn new(
        title: impl Into<String>,
        board_id: BoardId,
        stage_id: StageId,
        created_by: UserId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CardId::generate(),
            board_id,
            stage_id,
            title: title.into(),
            priority: CardPriority::default(),
            status: CardStatus::default(),
            position: 0,
            assigned_to: None,
            custom_fields: FieldMap::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            is_blocked: false,
            blocked_reason: None,
            workflow_execution_id: None,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: CardPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_assignee(mut self, user: UserId) -> Self {
        self.assigned_to = Some(user);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.custom_fields.insert(name.into(), value.into());
        self
    }

    pub fn blocked(mut self, reason: impl Into<String>) -> Self {
        self.is_blocked = true;
        self.blocked_reason = Some(reason.into());
        self
    }

    /// Look up a custom field value
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.custom_fields.get(name)
    }

    /// Whether this card counts against a stage's WIP limit
    pub fn counts_against_wip(&self) -> bool {
        self.status == CardStatus::Active
    }
}

// ── Card Mutations ───────────────────────────────────────────────────

/// A committed card mutation, handed to the trigger evaluator.
///
/// Produced only after WIP limits and movement rules have been enforced
/// and positions renumbered, so the evaluator sees a consistent
/// post-move snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CardMutation {
    /// The card entered a stage (creation or movement)
    StageEntry {
        /// The source stage; `None` when the card was just created
        from_stage: Option<StageId>,
    },
    /// A custom field changed value
    AttributeChange {
        field: String,
        old_value: Option<FieldValue>,
        new_value: FieldValue,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_stage() -> KanbanStage {
        KanbanStage::new("Review", BoardId::new("board-1"), UserId::new("user-1"))
    }

    fn make_card(stage: &KanbanStage) -> KanbanCard {
        KanbanCard::new(
            "Implement auth",
            stage.board_id.clone(),
            stage.id.clone(),
            UserId::new("user-1"),
        )
    }

    #[test]
    fn test_stage_triggers_gated_by_flag() {
        let stage = make_stage();
        assert!(!stage.triggers_enabled());

        let stage = make_stage()
            .with_trigger(StageTrigger::new(TemplateId::new("t-1")).on_stage_entry());
        assert!(stage.triggers_enabled());
        assert_eq!(stage.active_triggers().count(), 1);
    }

    #[test]
    fn test_inactive_trigger_filtered() {
        let stage = make_stage()
            .with_trigger(StageTrigger::new(TemplateId::new("t-1")).on_stage_entry())
            .with_trigger(
                StageTrigger::new(TemplateId::new("t-2"))
                    .on_stage_entry()
                    .inactive(),
            );
        assert_eq!(stage.automation_config.workflow_triggers.len(), 2);
        assert_eq!(stage.active_triggers().count(), 1);
    }

    #[test]
    fn test_compare_op_wire_form() {
        assert_eq!(serde_json::to_string(&CompareOp::Gt).unwrap(), "\">\"");
        assert_eq!(serde_json::to_string(&CompareOp::Ne).unwrap(), "\"!=\"");
        let op: CompareOp = serde_json::from_str("\">=\"").unwrap();
        assert_eq!(op, CompareOp::Gte);
    }

    #[test]
    fn test_compare_op_ordering() {
        assert!(CompareOp::Gt.is_ordering());
        assert!(CompareOp::Lte.is_ordering());
        assert!(!CompareOp::Eq.is_ordering());
        assert!(!CompareOp::Ne.is_ordering());
    }

    #[test]
    fn test_condition_wire_form() {
        let condition = TriggerCondition::AttributeChange {
            field_name: "budget".into(),
            operator: CompareOp::Gt,
            field_value: FieldValue::from(25000i64),
        };
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "attribute_change");
        assert_eq!(json["field_name"], "budget");
        assert_eq!(json["operator"], ">");
        assert_eq!(json["field_value"], 25000.0);

        let entry: TriggerCondition =
            serde_json::from_str("{\"type\":\"stage_entry\"}").unwrap();
        assert_eq!(entry, TriggerCondition::StageEntry);
    }

    #[test]
    fn test_stage_trigger_defaults_active() {
        let json = "{\"template_id\":\"t-1\",\"conditions\":[{\"type\":\"stage_entry\"}]}";
        let trigger: StageTrigger = serde_json::from_str(json).unwrap();
        assert!(trigger.is_active);
        assert_eq!(trigger.conditions.len(), 1);
    }

    #[test]
    fn test_card_fields() {
        let stage = make_stage();
        let card = make_card(&stage)
            .with_field("budget", 50000i64)
            .with_field("tier", "enterprise");

        assert_eq!(card.field("budget").unwrap().as_number(), Some(50000.0));
        assert_eq!(card.field("tier").unwrap().as_str(), Some("enterprise"));
        assert!(card.field("missing").is_none());
    }

    #[test]
    fn test_blocked_card() {
        let stage = make_stage();
        let card = make_card(&stage).blocked("waiting on legal");
        assert!(card.is_blocked);
        assert_eq!(card.blocked_reason.as_deref(), Some("waiting on legal"));
    }

    #[test]
    fn test_wip_counting() {
        let stage = make_stage();
        let card = make_card(&stage);
        assert!(card.counts_against_wip());

        let mut archived = make_card(&stage);
        archived.status = CardStatus::Archived;
        assert!(!archived.counts_against_wip());
    }

    #[test]
    fn test_stage_round_trip() {
        let stage = make_stage()
            .with_wip_limit(5)
            .with_trigger(
                StageTrigger::new(TemplateId::new("t-1")).on_attribute(
                    "budget",
                    CompareOp::Gt,
                    25000i64,
                ),
            )
            .with_rules(StageRules {
                prevent_move_back: true,
                require_assignee: false,
            });

        let json = serde_json::to_string(&stage).unwrap();
        let back: KanbanStage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, stage.id);
        assert_eq!(back.wip_limit, Some(5));
        assert!(back.rules.prevent_move_back);
        assert_eq!(back.automation, StageAutomation::WorkflowTrigger);
        assert_eq!(back.automation_config.workflow_triggers.len(), 1);
    }
}
