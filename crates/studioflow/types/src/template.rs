//! Workflow templates: reusable automation definitions
//!
//! A template describes what fires a workflow (its trigger) and the ordered
//! steps an execution runs through. Templates are immutable per version;
//! to change one, register a new version. Executions reference templates,
//! they never own them.

use crate::error::{WorkflowError, WorkflowResult};
use crate::ids::{StudioId, UserId};
use crate::value::FieldMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a workflow template
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub String);

impl TemplateId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a step within a template
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Template Status ──────────────────────────────────────────────────

/// Lifecycle status of a template
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    /// Being edited, not dispatchable
    #[default]
    Draft,
    /// Dispatchable
    Active,
    /// Retired, kept for execution history
    Archived,
    /// Superseded by a newer version
    Deprecated,
}

impl TemplateStatus {
    /// Only active templates may be dispatched
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

// ── Trigger ──────────────────────────────────────────────────────────

/// What kind of event fires a template
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fired explicitly by a user
    #[default]
    Manual,
    /// Fired on a schedule (cron config)
    Schedule,
    /// Fired by an inbound webhook
    Webhook,
    /// Fired when a file is uploaded
    FileUpload,
    /// Fired when a kanban card is created
    KanbanCardCreate,
    /// Fired when a kanban card's fields change
    KanbanCardUpdate,
    /// Fired when a kanban card changes stage
    KanbanStageChange,
}

/// Trigger configuration attached to a template
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct WorkflowTrigger {
    /// The event kind that fires this template
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Trigger-specific configuration (cron expression, webhook settings, ...)
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub config: FieldMap,
    /// Trigger-specific filters
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub conditions: FieldMap,
}

impl WorkflowTrigger {
    pub fn new(trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            config: FieldMap::new(),
            conditions: FieldMap::new(),
        }
    }
}

// ── Error Handling & Retry ───────────────────────────────────────────

/// Retry policy for a failing step
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before the step is marked failed
    pub max_attempts: u32,
    /// Base backoff delay override in milliseconds (scheduler default if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: None,
        }
    }
}

/// Per-step error handling configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ErrorHandling {
    /// When true, exhausting retries fails the step but the execution proceeds
    #[serde(default)]
    pub skippable: bool,
    /// Retry policy applied before the step is considered failed
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl ErrorHandling {
    pub fn skippable() -> Self {
        Self {
            skippable: true,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.retry_policy.max_attempts = attempts;
        self
    }
}

// ── Loop Steps ───────────────────────────────────────────────────────

/// Configuration for a loop step iterating over a context list
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Context key holding the list to iterate over
    pub over: String,
    /// When true, iterations run concurrently up to the scheduler fan-out limit
    #[serde(default)]
    pub parallel: bool,
}

// ── Workflow Step ────────────────────────────────────────────────────

/// One step in a template's ordered sequence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Identifier unique within the template
    pub id: StepId,
    /// Action type resolved by the external step runner
    pub action_type: String,
    /// Display name
    pub name: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Configuration passed to the step runner as input
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub config: FieldMap,
    /// Steps to branch to after this one (ids must exist in the template)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<StepId>,
    /// Error handling and retry configuration
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Present when this step is a loop over a context list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, action_type: impl Into<String>) -> Self {
        let id = StepId::new(id);
        Self {
            name: id.0.clone(),
            id,
            action_type: action_type.into(),
            description: String::new(),
            config: FieldMap::new(),
            next_steps: Vec::new(),
            error_handling: ErrorHandling::default(),
            loop_config: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_config(mut self, config: FieldMap) -> Self {
        self.config = config;
        self
    }

    pub fn with_next_step(mut self, id: impl Into<String>) -> Self {
        self.next_steps.push(StepId::new(id));
        self
    }

    pub fn with_error_handling(mut self, handling: ErrorHandling) -> Self {
        self.error_handling = handling;
        self
    }

    pub fn with_loop(mut self, over: impl Into<String>, parallel: bool) -> Self {
        self.loop_config = Some(LoopConfig {
            over: over.into(),
            parallel,
        });
        self
    }

    /// Total attempts allowed for this step
    pub fn max_attempts(&self) -> u32 {
        self.error_handling.retry_policy.max_attempts.max(1)
    }
}

// ── Workflow Template ────────────────────────────────────────────────

/// A reusable, versioned automation definition owned by a studio
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Unique identifier
    pub id: TemplateId,
    /// The studio that owns this template
    pub studio_id: StudioId,
    /// Template name
    pub name: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Lifecycle status; only `active` templates dispatch
    pub status: TemplateStatus,
    /// What fires this template
    pub trigger: WorkflowTrigger,
    /// Ordered steps an execution runs through
    pub steps: Vec<WorkflowStep>,
    /// Parameterization variables available to steps
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub variables: FieldMap,
    /// Categorization tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Whether the template is shareable across studios
    #[serde(default)]
    pub is_public: bool,
    /// Who created the template
    pub created_by: UserId,
    /// When the template was created
    pub created_at: DateTime<Utc>,
    /// When the template was last updated
    pub updated_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>, studio_id: StudioId, created_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: TemplateId::generate(),
            studio_id,
            name: name.into(),
            description: String::new(),
            status: TemplateStatus::Draft,
            trigger: WorkflowTrigger::default(),
            steps: Vec::new(),
            variables: FieldMap::new(),
            tags: Vec::new(),
            is_public: false,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_trigger(mut self, trigger: WorkflowTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_status(mut self, status: TemplateStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn active(mut self) -> Self {
        self.status = TemplateStatus::Active;
        self
    }

    /// Add a step to the end of the sequence
    pub fn add_step(&mut self, step: WorkflowStep) -> WorkflowResult<()> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Get a step by id
    pub fn step(&self, id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Position of a step in the declared order
    pub fn step_index(&self, id: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| &s.id == id)
    }

    /// Number of declared steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Validate structural correctness: at least one step, unique step ids,
    /// resolvable branch targets.
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.steps.is_empty() {
            return Err(WorkflowError::ValidationError(
                "template must declare at least one step".into(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(&step.id) {
                return Err(WorkflowError::ValidationError(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for next in &step.next_steps {
                if !seen.contains(next) {
                    return Err(WorkflowError::UnknownStep(next.clone()));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_template() -> WorkflowTemplate {
        let mut template = WorkflowTemplate::new(
            "Customer Onboarding",
            StudioId::new("studio-1"),
            UserId::new("author-1"),
        )
        .with_description("Automated onboarding for new customers")
        .with_trigger(WorkflowTrigger::new(TriggerType::KanbanStageChange));

        template
            .add_step(WorkflowStep::new("welcome_email", "send_email").with_name("Welcome Email"))
            .unwrap();
        template
            .add_step(WorkflowStep::new("create_folder", "create_drive_folder"))
            .unwrap();
        template
    }

    #[test]
    fn test_create_template() {
        let template = make_template();
        assert_eq!(template.name, "Customer Onboarding");
        assert_eq!(template.status, TemplateStatus::Draft);
        assert_eq!(template.step_count(), 2);
        assert!(!template.status.is_active());
    }

    #[test]
    fn test_activate() {
        let template = make_template().active();
        assert!(template.status.is_active());
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let mut template = make_template();
        let result = template.add_step(WorkflowStep::new("welcome_email", "send_email"));
        assert!(matches!(result, Err(WorkflowError::ValidationError(_))));
    }

    #[test]
    fn test_validate_empty_template() {
        let template = WorkflowTemplate::new(
            "Empty",
            StudioId::new("studio-1"),
            UserId::new("author-1"),
        );
        assert!(matches!(
            template.validate(),
            Err(WorkflowError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validate_unresolvable_branch() {
        let mut template = WorkflowTemplate::new(
            "Branching",
            StudioId::new("studio-1"),
            UserId::new("author-1"),
        );
        template
            .add_step(WorkflowStep::new("a", "noop").with_next_step("missing"))
            .unwrap();

        assert!(matches!(
            template.validate(),
            Err(WorkflowError::UnknownStep(_))
        ));
    }

    #[test]
    fn test_step_lookup() {
        let template = make_template();
        assert!(template.step(&StepId::new("welcome_email")).is_some());
        assert_eq!(template.step_index(&StepId::new("create_folder")), Some(1));
        assert!(template.step(&StepId::new("missing")).is_none());
    }

    #[test]
    fn test_step_max_attempts() {
        let step = WorkflowStep::new("s", "noop");
        assert_eq!(step.max_attempts(), 3);

        let step = WorkflowStep::new("s", "noop")
            .with_error_handling(ErrorHandling::default().with_max_attempts(5));
        assert_eq!(step.max_attempts(), 5);

        // zero attempts is clamped to one
        let step = WorkflowStep::new("s", "noop")
            .with_error_handling(ErrorHandling::default().with_max_attempts(0));
        assert_eq!(step.max_attempts(), 1);
    }

    #[test]
    fn test_loop_step() {
        let step = WorkflowStep::new("fan_out", "http_call").with_loop("recipients", true);
        let config = step.loop_config.as_ref().unwrap();
        assert_eq!(config.over, "recipients");
        assert!(config.parallel);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TemplateStatus::Active).unwrap();
        assert_eq!(json, "\"active\"");
        let json = serde_json::to_string(&TriggerType::KanbanStageChange).unwrap();
        assert_eq!(json, "\"kanban_stage_change\"");
    }

    #[test]
    fn test_template_round_trip() {
        let template = make_template().active();
        let json = serde_json::to_string(&template).unwrap();
        let back: WorkflowTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, template.id);
        assert_eq!(back.step_count(), 2);
        assert_eq!(back.status, TemplateStatus::Active);
    }
}
