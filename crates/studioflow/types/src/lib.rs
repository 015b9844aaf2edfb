//! Domain types for the Studioflow automation core
//!
//! Studios configure kanban boards whose stages carry automation rules.
//! When a card enters a stage or crosses an attribute threshold, a
//! [`WorkflowTemplate`] fires and produces a [`WorkflowExecution`] whose
//! lifecycle is governed by a bounded state machine.
//!
//! This crate holds the data model only:
//!
//! - [`WorkflowTemplate`] — trigger + ordered steps, owned by a studio
//! - [`WorkflowExecution`] / [`StepExecution`] — one run of a template and
//!   its per-step history
//! - [`ExecutionStatus`] — the lifecycle states and the legal-transition
//!   table
//! - [`KanbanStage`] / [`KanbanCard`] — board structure and the trigger
//!   wiring evaluated on card mutations
//! - [`FieldValue`] — the typed variant value used for custom fields,
//!   trigger data and step configuration
//!
//! Transition enforcement, trigger evaluation and scheduling live in the
//! `studioflow-engine` crate.

#![deny(unsafe_code)]

pub mod error;
pub mod execution;
pub mod ids;
pub mod kanban;
pub mod template;
pub mod validate;
pub mod value;

pub use error::{WorkflowError, WorkflowResult};
pub use execution::{
    ExecutionErrorInfo, ExecutionId, ExecutionStatus, StepExecution, StepStatus, WorkflowExecution,
};
pub use ids::{BoardId, StudioId, UserId};
pub use kanban::{
    AutomationConfig, CardId, CardMutation, CardPriority, CardStatus, CompareOp, KanbanCard,
    KanbanStage, StageAutomation, StageId, StageRules, StageTrigger, StageType, TriggerCondition,
};
pub use template::{
    ErrorHandling, LoopConfig, RetryPolicy, StepId, TemplateId, TemplateStatus, TriggerType,
    WorkflowStep, WorkflowTemplate, WorkflowTrigger,
};
pub use validate::{ensure_valid, validate_card, validate_stage, validate_template, ValidationError};
pub use value::{FieldMap, FieldValue};
