//! Studioflow automation engine
//!
//! Fires workflow templates off kanban card mutations and drives the
//! resulting executions through a bounded state machine. The engine
//! coordinates; the actual work of each step is done by an external
//! step runner it only awaits.
//!
//! # Architecture
//!
//! - [`ExecutionStateMachine`] — enforces the legal-transition table and
//!   aggregates step outcomes into the overall execution status
//! - [`TriggerEvaluator`] — decides which templates a committed card
//!   mutation fires
//! - [`TemplateRegistry`] — validates and versions workflow templates
//! - [`Board`] — stage/card ownership, WIP limits and atomic position
//!   renumbering on card moves
//! - [`ExecutionScheduler`] — dispatches templates, guards against
//!   duplicate in-flight executions per `(card, template)` pair, and runs
//!   each execution as an independent task
//! - [`StepRunner`] / [`ExecutionStore`] — the external collaborators for
//!   step execution and persistence
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use studioflow_engine::{ExecutionScheduler, StaticStepRunner, InMemoryExecutionStore, TriggerContext};
//! use studioflow_types::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let scheduler = Arc::new(ExecutionScheduler::new(
//!     Arc::new(InMemoryExecutionStore::new()),
//!     Arc::new(StaticStepRunner::new()),
//! ));
//!
//! let mut template = WorkflowTemplate::new(
//!     "Customer Onboarding",
//!     StudioId::new("studio-1"),
//!     UserId::new("author"),
//! )
//! .active();
//! template.add_step(WorkflowStep::new("welcome_email", "send_email")).unwrap();
//!
//! let template_id = scheduler.register_template(template).await.unwrap();
//! let execution_id = scheduler
//!     .dispatch(&template_id, TriggerContext::manual(UserId::new("operator")))
//!     .await
//!     .unwrap();
//! scheduler.await_driver(&execution_id).await;
//!
//! let execution = scheduler.execution(&execution_id).await.unwrap();
//! assert_eq!(execution.status, ExecutionStatus::Completed);
//! # }
//! ```

#![deny(unsafe_code)]

pub mod board;
pub mod scheduler;
pub mod state_machine;
pub mod step_runner;
pub mod store;
pub mod template_registry;
pub mod trigger_evaluator;

// Re-export main types
pub use board::Board;
pub use scheduler::{ExecutionScheduler, SchedulerConfig, TriggerContext};
pub use state_machine::{BackoffPolicy, ExecutionStateMachine, StepDisposition, StepOutcome};
pub use step_runner::{StaticStepRunner, StepRunner, StepRunnerError};
pub use store::{ExecutionStore, InMemoryExecutionStore};
pub use template_registry::TemplateRegistry;
pub use trigger_evaluator::TriggerEvaluator;
