//! Workflow executions: one run of a template and its step history
//!
//! An execution's `status` moves only along the legal-transition table in
//! [`ExecutionStatus::legal_transitions`]. The state machine in the engine
//! crate is the sole writer of that field; the types here carry data and
//! answer queries.

use crate::ids::{StudioId, UserId};
use crate::kanban::CardId;
use crate::template::{StepId, TemplateId};
use crate::value::FieldMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifier ───────────────────────────────────────────────────────

/// Unique identifier for a workflow execution
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
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

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Execution Status ─────────────────────────────────────────────────

/// Lifecycle state of a workflow execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created but not yet started
    #[default]
    Pending,
    /// Steps are being executed
    Running,
    /// Suspended; resumable
    Paused,
    /// All steps finished successfully
    Completed,
    /// A step exhausted its retries (or startup failed)
    Failed,
    /// Cancelled by a caller
    Cancelled,
    /// Wall-clock ceiling exceeded while running
    Timeout,
}

impl ExecutionStatus {
    /// The legal-transition table. Terminal states have no outgoing edges.
    pub fn legal_transitions(&self) -> &'static [ExecutionStatus] {
        use ExecutionStatus::*;
        match self {
            Pending => &[Running, Cancelled],
            Running => &[Paused, Completed, Failed, Cancelled, Timeout],
            Paused => &[Running, Cancelled],
            Completed | Failed | Cancelled | Timeout => &[],
        }
    }

    /// Whether `next` is reachable from this status in one transition
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        self.legal_transitions().contains(&next)
    }

    /// Terminal states permit no further mutation
    pub fn is_terminal(&self) -> bool {
        self.legal_transitions().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    /// All states, for exhaustive table checks
    pub fn all() -> [ExecutionStatus; 7] {
        use ExecutionStatus::*;
        [Pending, Running, Paused, Completed, Failed, Cancelled, Timeout]
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Step Execution ───────────────────────────────────────────────────

/// Per-step run status within one execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Declared but not yet started
    #[default]
    Pending,
    /// Handed to the step runner
    Running,
    /// Finished successfully
    Completed,
    /// Exhausted its retries
    Failed,
    /// Bypassed (cancellation, timeout, or conditional logic)
    Skipped,
    /// Failed an attempt; waiting to run again
    Retrying,
}

impl StepStatus {
    /// Terminal per-step states
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Error details recorded on a failed step or execution
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ExecutionErrorInfo {
    /// Human-readable message
    pub message: String,
    /// Machine-readable code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// The step that caused an execution-level failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepId>,
    /// Additional structured detail
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub details: FieldMap,
}

impl ExecutionErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            failed_step: None,
            details: FieldMap::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_failed_step(mut self, step_id: StepId) -> Self {
        self.failed_step = Some(step_id);
        self
    }
}

/// Tracks one step's run within an execution.
///
/// Owned exclusively by its parent [`WorkflowExecution`]; its lifetime is
/// bounded by the parent's.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepExecution {
    /// The template step this record tracks
    pub step_id: StepId,
    /// Current per-step status
    pub status: StepStatus,
    /// When the first attempt started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between start and completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    /// Input handed to the step runner
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub input: FieldMap,
    /// Output produced by the step runner
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub output: FieldMap,
    /// Error recorded on the most recent failed attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionErrorInfo>,
    /// Number of retries performed so far
    #[serde(default)]
    pub retry_count: u32,
    /// Opaque per-step id assigned by the external runner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_execution_id: Option<String>,
}

impl StepExecution {
    pub fn new(step_id: StepId) -> Self {
        Self {
            step_id,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            input: FieldMap::new(),
            output: FieldMap::new(),
            error: None,
            retry_count: 0,
            runner_execution_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the step running and stamp the start of its first attempt
    pub fn begin(&mut self, input: FieldMap) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
            self.input = input;
        }
        self.status = StepStatus::Running;
    }

    /// Mark the step completed with the runner's output
    pub fn succeed(&mut self, output: FieldMap) {
        self.output = output;
        self.error = None;
        self.terminalize(StepStatus::Completed);
    }

    /// Mark the step failed, recording the final error
    pub fn fail(&mut self, error: ExecutionErrorInfo) {
        self.error = Some(error);
        self.terminalize(StepStatus::Failed);
    }

    /// Mark the step skipped (cancellation, timeout, or skippable failure)
    pub fn skip(&mut self) {
        self.terminalize(StepStatus::Skipped);
    }

    /// Record a failed attempt that will be retried
    pub fn retrying(&mut self, error: ExecutionErrorInfo) {
        self.error = Some(error);
        self.retry_count += 1;
        self.status = StepStatus::Retrying;
    }

    /// Stamp completion time and duration alongside a terminal status
    fn terminalize(&mut self, status: StepStatus) {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_seconds = self
            .started_at
            .map(|started| (now - started).num_seconds());
    }
}

// ── Workflow Execution ───────────────────────────────────────────────

/// One instantiation of a template firing.
///
/// Never physically deleted, only terminalized. The engine's state
/// machine owns every `status` write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique identifier
    pub id: ExecutionId,
    /// The template this execution runs
    pub template_id: TemplateId,
    /// The studio this execution belongs to
    pub studio_id: StudioId,
    /// Who (or what) triggered the execution
    pub triggered_by: UserId,
    /// The card whose mutation fired this execution, when trigger-driven
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_id: Option<CardId>,
    /// State-machine-controlled lifecycle status
    pub status: ExecutionStatus,
    /// First entry into `running`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between start and completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    /// Data captured from the trigger that fired this execution
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub trigger_data: FieldMap,
    /// Free-form variables available to steps
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub context: FieldMap,
    /// Per-step history, in the order steps were reached
    #[serde(default)]
    pub step_executions: Vec<StepExecution>,
    /// Overall result payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FieldMap>,
    /// Error payload when the execution failed, timed out or was cancelled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionErrorInfo>,
    /// Opaque run id assigned by the external workflow runner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_run_id: Option<String>,
    /// Optimistic-concurrency version, bumped on every save
    #[serde(default)]
    pub version: u64,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last updated
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(template_id: TemplateId, studio_id: StudioId, triggered_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::generate(),
            template_id,
            studio_id,
            triggered_by,
            card_id: None,
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            trigger_data: FieldMap::new(),
            context: FieldMap::new(),
            step_executions: Vec::new(),
            result: None,
            error: None,
            runner_run_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_card(mut self, card_id: CardId) -> Self {
        self.card_id = Some(card_id);
        self
    }

    pub fn with_trigger_data(mut self, data: FieldMap) -> Self {
        self.trigger_data = data;
        self
    }

    pub fn with_context(mut self, context: FieldMap) -> Self {
        self.context = context;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Find the step record for a step id
    pub fn step(&self, step_id: &StepId) -> Option<&StepExecution> {
        self.step_executions.iter().find(|s| &s.step_id == step_id)
    }

    /// Mutable access to the step record for a step id
    pub fn step_mut(&mut self, step_id: &StepId) -> Option<&mut StepExecution> {
        self.step_executions
            .iter_mut()
            .find(|s| &s.step_id == step_id)
    }

    /// Steps that have reached a terminal per-step status
    pub fn terminal_step_count(&self) -> usize {
        self.step_executions.iter().filter(|s| s.is_terminal()).count()
    }

    /// Seconds since the record was created
    pub fn age_secs(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.created_at)
            .num_seconds()
    }

    /// Seconds since the execution entered `running` (None if never started)
    pub fn running_secs(&self) -> Option<i64> {
        self.started_at
            .map(|started| Utc::now().signed_duration_since(started).num_seconds())
    }
}
