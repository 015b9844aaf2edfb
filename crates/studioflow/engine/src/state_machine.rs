//! Execution state machine: the sole writer of execution status
//!
//! Every status change flows through [`ExecutionStateMachine::transition`],
//! which enforces the legal-transition table. Step outcomes are applied
//! through [`ExecutionStateMachine::apply_step_result`], which owns retry
//! accounting and recomputes the overall status when a step outcome
//! completes or fails the whole execution.
//!
//! All methods are synchronous, fast, in-memory mutations. Callers must
//! hold exclusive access to the execution while invoking them; the
//! scheduler serializes via a per-execution lock.

use std::time::Duration;
use studioflow_types::{
    ExecutionErrorInfo, ExecutionStatus, FieldMap, FieldValue, StepExecution, StepId, StepStatus,
    WorkflowError, WorkflowExecution, WorkflowResult, WorkflowTemplate,
};

// ── Backoff ──────────────────────────────────────────────────────────

/// Exponential backoff parameters for step retries
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Ceiling applied after doubling
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): base × 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap)
    }
}

// ── Step Outcomes ────────────────────────────────────────────────────

/// The outcome of one step attempt, reported by the step driver
#[derive(Clone, Debug)]
pub enum StepOutcome {
    /// The step was handed to the runner
    Started { input: FieldMap },
    /// The runner returned output
    Succeeded { output: FieldMap },
    /// The attempt failed
    Failed { error: ExecutionErrorInfo },
}

/// What the caller should do after applying a step outcome
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepDisposition {
    /// The step is running; await its outcome
    Running,
    /// The step reached a terminal status; continue with the next step
    Advanced,
    /// The attempt failed; retry the step after the delay
    Retry { attempt: u32, delay: Duration },
    /// Every declared step is terminal; the execution completed
    ExecutionCompleted,
    /// The step exhausted its retries; the execution failed
    ExecutionFailed,
}

// ── State Machine ────────────────────────────────────────────────────

/// Enforces the execution lifecycle contract over one [`WorkflowExecution`]
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutionStateMachine {
    backoff: BackoffPolicy,
}

impl ExecutionStateMachine {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    /// Move the execution to `next`, stamping timing fields.
    ///
    /// Fails with `InvalidTransition` for any `(from, to)` pair outside the
    /// legal-transition table, including replaying the current status: the
    /// table has no self-edges, so repeating a non-terminal status is a
    /// rejected no-op rather than a silent success.
    pub fn transition(
        &self,
        execution: &mut WorkflowExecution,
        next: ExecutionStatus,
    ) -> WorkflowResult<()> {
        if !execution.status.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                from: execution.status,
                to: next,
            });
        }

        let now = chrono::Utc::now();
        if next == ExecutionStatus::Running && execution.started_at.is_none() {
            execution.started_at = Some(now);
        }
        if next.is_terminal() {
            execution.completed_at = Some(now);
            execution.duration_seconds = execution
                .started_at
                .map(|started| (now - started).num_seconds());
        }

        tracing::debug!(
            execution_id = %execution.id,
            from = %execution.status,
            to = %next,
            "Execution status transition"
        );

        execution.status = next;
        execution.updated_at = now;
        Ok(())
    }

    /// Apply one step outcome, locating or appending the step record.
    ///
    /// Steps execute in template-declared order: a step id absent from the
    /// execution's history may only be appended when it is the next
    /// declared step; anything else fails with `UnknownStep`. Terminal
    /// executions reject all outcomes and are left unchanged.
    pub fn apply_step_result(
        &self,
        execution: &mut WorkflowExecution,
        template: &WorkflowTemplate,
        step_id: &StepId,
        outcome: StepOutcome,
    ) -> WorkflowResult<StepDisposition> {
        if execution.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal {
                execution_id: execution.id.clone(),
                status: execution.status,
            });
        }

        let step_def = template
            .step(step_id)
            .ok_or_else(|| WorkflowError::UnknownStep(step_id.clone()))?
            .clone();

        if execution.step(step_id).is_none() {
            // Appending is only legal for the next step in declared order.
            let next_index = execution.step_executions.len();
            if template.step_index(step_id) != Some(next_index) {
                return Err(WorkflowError::UnknownStep(step_id.clone()));
            }
            execution
                .step_executions
                .push(StepExecution::new(step_id.clone()));
        }

        let disposition = match outcome {
            StepOutcome::Started { input } => {
                let step = execution
                    .step_mut(step_id)
                    .ok_or_else(|| WorkflowError::UnknownStep(step_id.clone()))?;
                step.begin(input);
                StepDisposition::Running
            }

            StepOutcome::Succeeded { output } => {
                let step = execution
                    .step_mut(step_id)
                    .ok_or_else(|| WorkflowError::UnknownStep(step_id.clone()))?;
                step.succeed(output);
                self.conclude_if_done(execution, template)?
            }

            StepOutcome::Failed { error } => {
                let max_attempts = step_def.max_attempts();
                let backoff = match step_def.error_handling.retry_policy.base_delay_ms {
                    Some(ms) => BackoffPolicy {
                        base: Duration::from_millis(ms),
                        cap: self.backoff.cap,
                    },
                    None => self.backoff,
                };

                let step = execution
                    .step_mut(step_id)
                    .ok_or_else(|| WorkflowError::UnknownStep(step_id.clone()))?;

                if step.retry_count + 1 < max_attempts {
                    step.retrying(error);
                    let attempt = step.retry_count;
                    let delay = backoff.delay_for(attempt);
                    tracing::info!(
                        execution_id = %execution.id,
                        step_id = %step_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Step failed, scheduling retry"
                    );
                    StepDisposition::Retry { attempt, delay }
                } else {
                    step.fail(error.clone());
                    if step_def.error_handling.skippable {
                        tracing::warn!(
                            execution_id = %execution.id,
                            step_id = %step_id,
                            "Skippable step exhausted retries, continuing"
                        );
                        self.conclude_if_done(execution, template)?
                    } else {
                        execution.error = Some(
                            ExecutionErrorInfo::new(error.message.clone())
                                .with_code(error.code.clone().unwrap_or_else(|| "step_failed".into()))
                                .with_failed_step(step_id.clone()),
                        );
                        self.transition(execution, ExecutionStatus::Failed)?;
                        tracing::warn!(
                            execution_id = %execution.id,
                            step_id = %step_id,
                            "Step exhausted retries, execution failed"
                        );
                        StepDisposition::ExecutionFailed
                    }
                }
            }
        };

        execution.updated_at = chrono::Utc::now();
        Ok(disposition)
    }

    /// Cancel the execution, skipping every non-terminal step. Irreversible.
    pub fn cancel(
        &self,
        execution: &mut WorkflowExecution,
        reason: impl Into<String>,
    ) -> WorkflowResult<()> {
        if !execution.status.can_transition_to(ExecutionStatus::Cancelled) {
            return Err(WorkflowError::InvalidTransition {
                from: execution.status,
                to: ExecutionStatus::Cancelled,
            });
        }

        let reason = reason.into();
        for step in &mut execution.step_executions {
            if !step.is_terminal() {
                step.skip();
            }
        }
        execution.error = Some(ExecutionErrorInfo::new(&reason).with_code("cancelled"));
        self.transition(execution, ExecutionStatus::Cancelled)?;

        tracing::info!(execution_id = %execution.id, reason = %reason, "Execution cancelled");
        Ok(())
    }

    /// Apply a timeout detected by the external timer. Valid only from
    /// `running`; pending executions fall under the scheduler's staleness
    /// policy instead.
    pub fn timeout(&self, execution: &mut WorkflowExecution) -> WorkflowResult<()> {
        if execution.status != ExecutionStatus::Running {
            return Err(WorkflowError::InvalidTransition {
                from: execution.status,
                to: ExecutionStatus::Timeout,
            });
        }

        for step in &mut execution.step_executions {
            if !step.is_terminal() {
                step.skip();
            }
        }
        execution.error = Some(
            ExecutionErrorInfo::new("execution exceeded its configured time ceiling")
                .with_code("timeout"),
        );
        self.transition(execution, ExecutionStatus::Timeout)?;

        tracing::warn!(execution_id = %execution.id, "Execution timed out");
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Complete the execution once every declared step is terminal.
    ///
    /// Fatal (non-skippable) failures never reach this point; they fail
    /// the execution at the step that exhausted its retries.
    fn conclude_if_done(
        &self,
        execution: &mut WorkflowExecution,
        template: &WorkflowTemplate,
    ) -> WorkflowResult<StepDisposition> {
        let all_terminal = execution.step_executions.len() == template.step_count()
            && execution.step_executions.iter().all(|s| s.is_terminal());
        if !all_terminal {
            return Ok(StepDisposition::Advanced);
        }

        let mut result = FieldMap::new();
        for step in &execution.step_executions {
            if step.status == StepStatus::Completed {
                result.insert(step.step_id.0.clone(), FieldValue::Map(step.output.clone()));
            }
        }
        execution.result = Some(result);
        self.transition(execution, ExecutionStatus::Completed)?;

        tracing::info!(execution_id = %execution.id, "Execution completed");
        Ok(StepDisposition::ExecutionCompleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studioflow_types::{ErrorHandling, StudioId, UserId, WorkflowStep};

    fn make_template(steps: &[&str]) -> WorkflowTemplate {
        let mut template = WorkflowTemplate::new(
            "Pipeline",
            StudioId::new("studio-1"),
            UserId::new("author-1"),
        )
        .active();
        for id in steps {
            template
                .add_step(WorkflowStep::new(*id, "noop"))
                .unwrap();
        }
        template
    }

    fn make_execution(template: &WorkflowTemplate) -> WorkflowExecution {
        WorkflowExecution::new(
            template.id.clone(),
            template.studio_id.clone(),
            UserId::new("user-1"),
        )
    }

    fn start(sm: &ExecutionStateMachine, execution: &mut WorkflowExecution) {
        sm.transition(execution, ExecutionStatus::Running).unwrap();
    }

    fn run_step_ok(
        sm: &ExecutionStateMachine,
        execution: &mut WorkflowExecution,
        template: &WorkflowTemplate,
        id: &str,
    ) -> StepDisposition {
        let step_id = StepId::new(id);
        sm.apply_step_result(
            execution,
            template,
            &step_id,
            StepOutcome::Started {
                input: FieldMap::new(),
            },
        )
        .unwrap();
        sm.apply_step_result(
            execution,
            template,
            &step_id,
            StepOutcome::Succeeded {
                output: FieldMap::new(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_every_illegal_pair_rejected() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a"]);

        for from in ExecutionStatus::all() {
            for to in ExecutionStatus::all() {
                if from.can_transition_to(to) {
                    continue;
                }
                let mut execution = make_execution(&template);
                execution.status = from;
                let result = sm.transition(&mut execution, to);
                assert!(
                    matches!(result, Err(WorkflowError::InvalidTransition { .. })),
                    "{} -> {} should be rejected",
                    from,
                    to
                );
                assert_eq!(execution.status, from, "status must be unchanged on rejection");
            }
        }
    }

    #[test]
    fn test_replaying_current_status_rejected() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a"]);
        let mut execution = make_execution(&template);
        start(&sm, &mut execution);

        let result = sm.transition(&mut execution, ExecutionStatus::Running);
        assert!(matches!(result, Err(WorkflowError::InvalidTransition { .. })));
        assert_eq!(execution.status, ExecutionStatus::Running);
    }

    #[test]
    fn test_started_at_stamped_once() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a"]);
        let mut execution = make_execution(&template);

        start(&sm, &mut execution);
        let first = execution.started_at;
        assert!(first.is_some());

        sm.transition(&mut execution, ExecutionStatus::Paused).unwrap();
        sm.transition(&mut execution, ExecutionStatus::Running).unwrap();
        assert_eq!(execution.started_at, first);
    }

    #[test]
    fn test_all_steps_succeed_completes_execution() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a", "b", "c"]);
        let mut execution = make_execution(&template);
        start(&sm, &mut execution);

        assert_eq!(
            run_step_ok(&sm, &mut execution, &template, "a"),
            StepDisposition::Advanced
        );
        assert_eq!(
            run_step_ok(&sm, &mut execution, &template, "b"),
            StepDisposition::Advanced
        );
        assert_eq!(
            run_step_ok(&sm, &mut execution, &template, "c"),
            StepDisposition::ExecutionCompleted
        );

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.result.is_some());

        let started = execution.started_at.unwrap();
        let completed = execution.completed_at.unwrap();
        assert_eq!(
            execution.duration_seconds,
            Some((completed - started).num_seconds())
        );
    }

    #[test]
    fn test_terminal_execution_rejects_everything() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a"]);
        let mut execution = make_execution(&template);
        start(&sm, &mut execution);
        run_step_ok(&sm, &mut execution, &template, "a");
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let snapshot = serde_json::to_value(&execution).unwrap();

        for to in ExecutionStatus::all() {
            assert!(sm.transition(&mut execution, to).is_err());
        }
        let result = sm.apply_step_result(
            &mut execution,
            &template,
            &StepId::new("a"),
            StepOutcome::Succeeded {
                output: FieldMap::new(),
            },
        );
        assert!(matches!(result, Err(WorkflowError::AlreadyTerminal { .. })));

        assert_eq!(serde_json::to_value(&execution).unwrap(), snapshot);
    }

    #[test]
    fn test_unknown_step_rejected() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a"]);
        let mut execution = make_execution(&template);
        start(&sm, &mut execution);

        let result = sm.apply_step_result(
            &mut execution,
            &template,
            &StepId::new("ghost"),
            StepOutcome::Started {
                input: FieldMap::new(),
            },
        );
        assert!(matches!(result, Err(WorkflowError::UnknownStep(_))));
    }

    #[test]
    fn test_out_of_order_step_rejected() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a", "b"]);
        let mut execution = make_execution(&template);
        start(&sm, &mut execution);

        // "b" is declared but "a" has not been reached yet
        let result = sm.apply_step_result(
            &mut execution,
            &template,
            &StepId::new("b"),
            StepOutcome::Started {
                input: FieldMap::new(),
            },
        );
        assert!(matches!(result, Err(WorkflowError::UnknownStep(_))));
        assert!(execution.step_executions.is_empty());
    }

    #[test]
    fn test_retry_then_exhaustion_fails_execution() {
        let sm = ExecutionStateMachine::default();
        let mut template = make_template(&[]);
        template
            .add_step(
                WorkflowStep::new("flaky", "http_call")
                    .with_error_handling(ErrorHandling::default().with_max_attempts(2)),
            )
            .unwrap();
        let mut execution = make_execution(&template);
        start(&sm, &mut execution);

        let step_id = StepId::new("flaky");
        sm.apply_step_result(
            &mut execution,
            &template,
            &step_id,
            StepOutcome::Started {
                input: FieldMap::new(),
            },
        )
        .unwrap();

        // first failure retries
        let disposition = sm
            .apply_step_result(
                &mut execution,
                &template,
                &step_id,
                StepOutcome::Failed {
                    error: ExecutionErrorInfo::new("connection refused"),
                },
            )
            .unwrap();
        assert!(matches!(disposition, StepDisposition::Retry { attempt: 1, .. }));
        assert_eq!(
            execution.step(&step_id).unwrap().status,
            StepStatus::Retrying
        );

        // second failure exhausts max_attempts=2
        let disposition = sm
            .apply_step_result(
                &mut execution,
                &template,
                &step_id,
                StepOutcome::Failed {
                    error: ExecutionErrorInfo::new("connection refused"),
                },
            )
            .unwrap();
        assert_eq!(disposition, StepDisposition::ExecutionFailed);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.step(&step_id).unwrap().status,
            StepStatus::Failed
        );
        assert_eq!(
            execution.error.as_ref().unwrap().failed_step,
            Some(step_id)
        );
    }

    #[test]
    fn test_skippable_step_failure_continues() {
        let sm = ExecutionStateMachine::default();
        let mut template = make_template(&[]);
        template
            .add_step(
                WorkflowStep::new("optional", "notify")
                    .with_error_handling(ErrorHandling::skippable().with_max_attempts(1)),
            )
            .unwrap();
        template.add_step(WorkflowStep::new("final", "noop")).unwrap();
        let mut execution = make_execution(&template);
        start(&sm, &mut execution);

        let step_id = StepId::new("optional");
        sm.apply_step_result(
            &mut execution,
            &template,
            &step_id,
            StepOutcome::Started {
                input: FieldMap::new(),
            },
        )
        .unwrap();
        let disposition = sm
            .apply_step_result(
                &mut execution,
                &template,
                &step_id,
                StepOutcome::Failed {
                    error: ExecutionErrorInfo::new("notification service down"),
                },
            )
            .unwrap();
        assert_eq!(disposition, StepDisposition::Advanced);
        assert_eq!(execution.status, ExecutionStatus::Running);

        let disposition = run_step_ok(&sm, &mut execution, &template, "final");
        assert_eq!(disposition, StepDisposition::ExecutionCompleted);
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_cancel_paused_skips_steps() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a", "b"]);
        let mut execution = make_execution(&template);
        start(&sm, &mut execution);

        run_step_ok(&sm, &mut execution, &template, "a");
        sm.apply_step_result(
            &mut execution,
            &template,
            &StepId::new("b"),
            StepOutcome::Started {
                input: FieldMap::new(),
            },
        )
        .unwrap();
        sm.transition(&mut execution, ExecutionStatus::Paused).unwrap();

        sm.cancel(&mut execution, "operator request").unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(
            execution.step(&StepId::new("a")).unwrap().status,
            StepStatus::Completed
        );
        assert_eq!(
            execution.step(&StepId::new("b")).unwrap().status,
            StepStatus::Skipped
        );
        assert_eq!(
            execution.error.as_ref().unwrap().code.as_deref(),
            Some("cancelled")
        );
    }

    #[test]
    fn test_cancel_completed_rejected() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a"]);
        let mut execution = make_execution(&template);
        start(&sm, &mut execution);
        run_step_ok(&sm, &mut execution, &template, "a");

        let result = sm.cancel(&mut execution, "too late");
        assert!(matches!(result, Err(WorkflowError::InvalidTransition { .. })));
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_timeout_only_from_running() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a"]);

        let mut pending = make_execution(&template);
        assert!(matches!(
            sm.timeout(&mut pending),
            Err(WorkflowError::InvalidTransition { .. })
        ));

        let mut running = make_execution(&template);
        start(&sm, &mut running);
        sm.apply_step_result(
            &mut running,
            &template,
            &StepId::new("a"),
            StepOutcome::Started {
                input: FieldMap::new(),
            },
        )
        .unwrap();
        sm.timeout(&mut running).unwrap();
        assert_eq!(running.status, ExecutionStatus::Timeout);
        assert_eq!(
            running.step(&StepId::new("a")).unwrap().status,
            StepStatus::Skipped
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = BackoffPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(8),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn test_per_step_base_delay_override() {
        let sm = ExecutionStateMachine::default();
        let mut template = make_template(&[]);
        let mut handling = ErrorHandling::default().with_max_attempts(3);
        handling.retry_policy.base_delay_ms = Some(50);
        template
            .add_step(WorkflowStep::new("flaky", "http_call").with_error_handling(handling))
            .unwrap();
        let mut execution = make_execution(&template);
        start(&sm, &mut execution);

        let step_id = StepId::new("flaky");
        sm.apply_step_result(
            &mut execution,
            &template,
            &step_id,
            StepOutcome::Started {
                input: FieldMap::new(),
            },
        )
        .unwrap();
        let disposition = sm
            .apply_step_result(
                &mut execution,
                &template,
                &step_id,
                StepOutcome::Failed {
                    error: ExecutionErrorInfo::new("boom"),
                },
            )
            .unwrap();
        assert_eq!(
            disposition,
            StepDisposition::Retry {
                attempt: 1,
                delay: Duration::from_millis(50)
            }
        );
    }

    #[test]
    fn test_round_trip_preserves_resumability() {
        let sm = ExecutionStateMachine::default();
        let template = make_template(&["a", "b"]);

        // run straight through
        let mut direct = make_execution(&template);
        start(&sm, &mut direct);
        run_step_ok(&sm, &mut direct, &template, "a");
        run_step_ok(&sm, &mut direct, &template, "b");

        // run the first step, round-trip through serde, then resume
        let mut interrupted = make_execution(&template);
        start(&sm, &mut interrupted);
        run_step_ok(&sm, &mut interrupted, &template, "a");

        let json = serde_json::to_string(&interrupted).unwrap();
        let mut resumed: WorkflowExecution = serde_json::from_str(&json).unwrap();
        let disposition = run_step_ok(&sm, &mut resumed, &template, "b");

        assert_eq!(disposition, StepDisposition::ExecutionCompleted);
        assert_eq!(resumed.status, direct.status);
        assert_eq!(
            resumed.terminal_step_count(),
            direct.terminal_step_count()
        );
    }
}
