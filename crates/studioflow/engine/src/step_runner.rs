//! Step runner: the external execution collaborator
//!
//! The engine never executes actions itself. Each step is handed to a
//! [`StepRunner`], an opaque capability whose success, failure or timeout
//! outcome is the only thing the engine interprets.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use studioflow_types::{ExecutionErrorInfo, FieldMap, StepId, WorkflowStep};

/// Outcome of one step attempt against the external runner
#[derive(Debug, thiserror::Error)]
pub enum StepRunnerError {
    /// The runner executed the step and it failed
    #[error("step failed: {message}")]
    Failed {
        message: String,
        code: Option<String>,
    },

    /// The runner could not be reached at all
    #[error("step runner unreachable: {0}")]
    Unavailable(String),

    /// The runner did not answer within its deadline
    #[error("step timed out after {0} seconds")]
    TimedOut(u64),
}

impl StepRunnerError {
    /// Convert into the error payload recorded on the step execution
    pub fn into_error_info(self) -> ExecutionErrorInfo {
        match self {
            Self::Failed { message, code } => {
                let info = ExecutionErrorInfo::new(message);
                match code {
                    Some(code) => info.with_code(code),
                    None => info.with_code("step_failed"),
                }
            }
            Self::Unavailable(collaborator) => ExecutionErrorInfo::new(format!(
                "step runner unreachable: {}",
                collaborator
            ))
            .with_code("step_runner_unavailable"),
            Self::TimedOut(secs) => {
                ExecutionErrorInfo::new(format!("step timed out after {} seconds", secs))
                    .with_code("step_timed_out")
            }
        }
    }
}

/// Executes one step against the external automation runner.
///
/// Awaiting this call is the engine's only suspension point.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(
        &self,
        step: &WorkflowStep,
        input: &FieldMap,
        context: &FieldMap,
    ) -> Result<FieldMap, StepRunnerError>;
}

// ── Scripted Runner ──────────────────────────────────────────────────

/// A scripted runner for tests and embedding: per-step queues of outcomes,
/// consumed attempt by attempt. Steps without a script succeed with empty
/// output.
#[derive(Default)]
pub struct StaticStepRunner {
    scripts: Mutex<HashMap<StepId, Vec<Result<FieldMap, StepRunnerError>>>>,
}

impl StaticStepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next unscripted attempt of a step
    pub fn script(&self, step_id: StepId, outcome: Result<FieldMap, StepRunnerError>) {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(step_id)
            .or_default()
            .push(outcome);
    }

    /// Queue `count` consecutive failures for a step
    pub fn script_failures(&self, step_id: StepId, count: u32) {
        for _ in 0..count {
            self.script(
                step_id.clone(),
                Err(StepRunnerError::Failed {
                    message: "scripted failure".into(),
                    code: None,
                }),
            );
        }
    }
}

#[async_trait]
impl StepRunner for StaticStepRunner {
    async fn run(
        &self,
        step: &WorkflowStep,
        _input: &FieldMap,
        _context: &FieldMap,
    ) -> Result<FieldMap, StepRunnerError> {
        let mut scripts = self
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match scripts.get_mut(&step.id) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => Ok(FieldMap::new()),
        }
    }
}
