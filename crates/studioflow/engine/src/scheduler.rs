//! Execution scheduler: dispatches templates and drives executions
//!
//! `dispatch` loads the template, creates a pending execution, moves it to
//! `running`, and spawns an independent task that walks the steps through
//! the state machine, awaiting the external step runner between
//! transitions. All execution mutation happens under a per-execution lock,
//! so transitions and step results are applied by one writer at a time.
//!
//! Concurrency guard: at most one non-terminal execution per
//! `(card_id, template_id)` pair. A duplicate dispatch fails with
//! `DuplicateExecution` instead of queuing, which stops automation loops
//! when a card re-enters the same stage.

use crate::state_machine::{BackoffPolicy, ExecutionStateMachine, StepDisposition, StepOutcome};
use crate::step_runner::StepRunner;
use crate::store::ExecutionStore;
use crate::template_registry::TemplateRegistry;
use crate::trigger_evaluator::TriggerEvaluator;
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use studioflow_types::{
    CardId, CardMutation, ExecutionErrorInfo, ExecutionId, ExecutionStatus, FieldMap, FieldValue,
    KanbanCard, KanbanStage, TemplateId, UserId, WorkflowError, WorkflowExecution, WorkflowResult,
    WorkflowStep, WorkflowTemplate,
};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

// ── Configuration ────────────────────────────────────────────────────

/// Engine tunables
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Retry backoff applied when a step's policy has no override
    pub backoff: BackoffPolicy,
    /// Concurrency ceiling for parallel loop iterations
    pub loop_fan_out: usize,
    /// Pending executions older than this are cancelled by the sweep
    pub pending_staleness: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            loop_fan_out: 4,
            pending_staleness: Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_loop_fan_out(mut self, fan_out: usize) -> Self {
        self.loop_fan_out = fan_out.max(1);
        self
    }

    pub fn with_pending_staleness(mut self, staleness: Duration) -> Self {
        self.pending_staleness = staleness;
        self
    }
}

// ── Trigger Context ──────────────────────────────────────────────────

/// What fired a dispatch: who, optionally which card, and trigger payload
#[derive(Clone, Debug)]
pub struct TriggerContext {
    pub triggered_by: UserId,
    pub card_id: Option<CardId>,
    pub trigger_data: FieldMap,
    pub context: FieldMap,
}

impl TriggerContext {
    /// A user-submitted manual execution (no card binding, no duplicate guard)
    pub fn manual(triggered_by: UserId) -> Self {
        Self {
            triggered_by,
            card_id: None,
            trigger_data: FieldMap::new(),
            context: FieldMap::new(),
        }
    }

    /// A card-mutation-driven execution, subject to the duplicate guard
    pub fn for_card(triggered_by: UserId, card_id: CardId) -> Self {
        Self {
            triggered_by,
            card_id: Some(card_id),
            trigger_data: FieldMap::new(),
            context: FieldMap::new(),
        }
    }

    pub fn with_trigger_data(mut self, data: FieldMap) -> Self {
        self.trigger_data = data;
        self
    }

    pub fn with_context(mut self, context: FieldMap) -> Self {
        self.context = context;
        self
    }
}

// ── Scheduler ────────────────────────────────────────────────────────

/// Per-execution synchronization: the write lock and the resume signal
#[derive(Default)]
struct ExecutionGate {
    lock: Mutex<()>,
    resumed: Notify,
}

/// Dispatches templates and owns the lifecycle of their executions
pub struct ExecutionScheduler {
    templates: RwLock<TemplateRegistry>,
    store: Arc<dyn ExecutionStore>,
    runner: Arc<dyn StepRunner>,
    evaluator: TriggerEvaluator,
    state: ExecutionStateMachine,
    config: SchedulerConfig,
    in_flight: Mutex<HashMap<(CardId, TemplateId), ExecutionId>>,
    gates: Mutex<HashMap<ExecutionId, Arc<ExecutionGate>>>,
    tasks: Mutex<HashMap<ExecutionId, JoinHandle<()>>>,
}

impl ExecutionScheduler {
    pub fn new(store: Arc<dyn ExecutionStore>, runner: Arc<dyn StepRunner>) -> Self {
        Self::with_config(store, runner, SchedulerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ExecutionStore>,
        runner: Arc<dyn StepRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            templates: RwLock::new(TemplateRegistry::new()),
            store,
            runner,
            evaluator: TriggerEvaluator::new(),
            state: ExecutionStateMachine::new(config.backoff),
            config,
            in_flight: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    // ── Template Management ──────────────────────────────────────────

    /// Register a template for dispatch
    pub async fn register_template(&self, template: WorkflowTemplate) -> WorkflowResult<TemplateId> {
        self.templates.write().await.register(template)
    }

    /// Look up a template by id
    pub async fn template(&self, id: &TemplateId) -> WorkflowResult<WorkflowTemplate> {
        self.templates.read().await.get(id).cloned()
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Dispatch a template: create the execution, start it, and spawn its
    /// driver task. Returns once the execution is running.
    pub async fn dispatch(
        self: &Arc<Self>,
        template_id: &TemplateId,
        trigger: TriggerContext,
    ) -> WorkflowResult<ExecutionId> {
        let template = self.templates.read().await.get_active(template_id)?.clone();

        let mut context = template.variables.clone();
        context.extend(trigger.context.clone());
        let mut execution = WorkflowExecution::new(
            template.id.clone(),
            template.studio_id.clone(),
            trigger.triggered_by.clone(),
        )
        .with_trigger_data(trigger.trigger_data.clone())
        .with_context(context);
        if let Some(card_id) = &trigger.card_id {
            execution = execution.with_card(card_id.clone());
        }
        let execution_id = execution.id.clone();

        // Reserve the (card, template) slot before anything is persisted,
        // so a concurrent duplicate loses deterministically.
        if let Some(card_id) = &trigger.card_id {
            let key = (card_id.clone(), template.id.clone());
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains_key(&key) {
                return Err(WorkflowError::DuplicateExecution {
                    card_id: card_id.clone(),
                    template_id: template.id.clone(),
                });
            }
            in_flight.insert(key, execution_id.clone());
        }

        let started = async {
            self.store.save(&mut execution).await?;
            self.with_execution(&execution_id, |state, execution| {
                state.transition(execution, ExecutionStatus::Running)
            })
            .await
        }
        .await;
        if let Err(err) = started {
            // free the reservation so the card is not locked out forever
            if let Some(card_id) = &trigger.card_id {
                self.in_flight
                    .lock()
                    .await
                    .remove(&(card_id.clone(), template.id.clone()));
            }
            return Err(err);
        }

        tracing::info!(
            execution_id = %execution_id,
            template_id = %template.id,
            triggered_by = %trigger.triggered_by,
            "Execution dispatched"
        );

        let scheduler = Arc::clone(self);
        let driver_id = execution_id.clone();
        let handle = tokio::spawn(async move { scheduler.drive(template, driver_id).await });
        self.tasks.lock().await.insert(execution_id.clone(), handle);

        Ok(execution_id)
    }

    /// Dispatch a template on behalf of a user, outside any card trigger
    pub async fn dispatch_manual(
        self: &Arc<Self>,
        template_id: &TemplateId,
        triggered_by: UserId,
        trigger_data: FieldMap,
    ) -> WorkflowResult<ExecutionId> {
        self.dispatch(
            template_id,
            TriggerContext::manual(triggered_by).with_trigger_data(trigger_data),
        )
        .await
    }

    /// Evaluate a committed card mutation and dispatch every matched
    /// template. Duplicate-guard rejections are reported per template,
    /// they do not stop the remaining matches.
    pub async fn on_card_mutation(
        self: &Arc<Self>,
        stage: &KanbanStage,
        card: &KanbanCard,
        mutation: &CardMutation,
        triggered_by: UserId,
    ) -> Vec<(TemplateId, WorkflowResult<ExecutionId>)> {
        let matched = self.evaluator.evaluate(stage, card, mutation);
        let mut results = Vec::with_capacity(matched.len());

        for template_id in matched {
            let mut trigger_data = FieldMap::new();
            trigger_data.insert("card_id".into(), FieldValue::from(card.id.0.as_str()));
            trigger_data.insert("board_id".into(), FieldValue::from(card.board_id.0.as_str()));
            trigger_data.insert("stage_id".into(), FieldValue::from(stage.id.0.as_str()));
            if let CardMutation::AttributeChange {
                field, new_value, ..
            } = mutation
            {
                trigger_data.insert("field".into(), FieldValue::from(field.as_str()));
                trigger_data.insert("new_value".into(), new_value.clone());
            }

            let trigger = TriggerContext::for_card(triggered_by.clone(), card.id.clone())
                .with_trigger_data(trigger_data);
            let result = self.dispatch(&template_id, trigger).await;
            if let Err(err) = &result {
                tracing::warn!(
                    template_id = %template_id,
                    card_id = %card.id,
                    %err,
                    "Matched trigger did not dispatch"
                );
            }
            results.push((template_id, result));
        }

        results
    }

    // ── Lifecycle Control ────────────────────────────────────────────

    /// Cancel an execution. Deliverable at any time; a step result arriving
    /// afterwards is discarded by the driver, not applied.
    pub async fn cancel(
        &self,
        execution_id: &ExecutionId,
        reason: impl Into<String>,
    ) -> WorkflowResult<()> {
        let reason = reason.into();
        self.with_execution(execution_id, |state, execution| {
            state.cancel(execution, reason)
        })
        .await?;
        self.release_guard(execution_id).await;
        Ok(())
    }

    /// Apply a timeout detected by the external timer collaborator
    pub async fn timeout(&self, execution_id: &ExecutionId) -> WorkflowResult<()> {
        self.with_execution(execution_id, |state, execution| state.timeout(execution))
            .await?;
        self.release_guard(execution_id).await;
        Ok(())
    }

    /// Pause a running execution; the driver stops before the next step
    pub async fn pause(&self, execution_id: &ExecutionId) -> WorkflowResult<()> {
        self.with_execution(execution_id, |state, execution| {
            state.transition(execution, ExecutionStatus::Paused)
        })
        .await
    }

    /// Resume a paused execution and wake its driver
    pub async fn resume(&self, execution_id: &ExecutionId) -> WorkflowResult<()> {
        self.with_execution(execution_id, |state, execution| {
            state.transition(execution, ExecutionStatus::Running)
        })
        .await?;
        self.gate_for(execution_id).await.resumed.notify_waiters();
        Ok(())
    }

    /// Cancel executions stuck in `pending` beyond the staleness ceiling.
    /// Returns the ids that were swept.
    pub async fn sweep_stale_pending(&self) -> WorkflowResult<Vec<ExecutionId>> {
        let ceiling = self.config.pending_staleness.as_secs() as i64;
        let mut swept = Vec::new();

        for execution in self.store.list_non_terminal().await? {
            if execution.status == ExecutionStatus::Pending && execution.age_secs() >= ceiling {
                match self.cancel(&execution.id, "stale pending execution").await {
                    Ok(()) => swept.push(execution.id),
                    // lost a race with a concurrent transition; skip it
                    Err(err) => tracing::debug!(execution_id = %execution.id, %err, "Stale sweep skipped execution"),
                }
            }
        }

        Ok(swept)
    }

    /// Load an execution snapshot
    pub async fn execution(&self, execution_id: &ExecutionId) -> WorkflowResult<WorkflowExecution> {
        self.store.load(execution_id).await
    }

    /// Wait for an execution's driver task to finish (test/embedding aid)
    pub async fn await_driver(&self, execution_id: &ExecutionId) {
        let handle = self.tasks.lock().await.remove(execution_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // ── Driver ───────────────────────────────────────────────────────

    /// Walk the execution through its steps. Runs as an independent task.
    async fn drive(self: Arc<Self>, template: WorkflowTemplate, execution_id: ExecutionId) {
        let result = self.drive_steps(&template, &execution_id).await;
        match result {
            Ok(()) => {}
            Err(WorkflowError::AlreadyTerminal { status, .. }) => {
                tracing::warn!(
                    execution_id = %execution_id,
                    %status,
                    "Discarding in-flight step activity for terminal execution"
                );
            }
            Err(err) => {
                tracing::error!(execution_id = %execution_id, %err, "Execution driver failed");
                // Never leave the execution dangling in a non-terminal state.
                let _ = self
                    .with_execution(&execution_id, |state, execution| {
                        execution.error = Some(
                            ExecutionErrorInfo::new(err.to_string()).with_code("driver_error"),
                        );
                        state.transition(execution, ExecutionStatus::Failed)
                    })
                    .await;
            }
        }
        self.release_guard(&execution_id).await;
    }

    async fn drive_steps(
        &self,
        template: &WorkflowTemplate,
        execution_id: &ExecutionId,
    ) -> WorkflowResult<()> {
        for step in &template.steps {
            loop {
                if !self.wait_until_runnable(execution_id).await? {
                    return Ok(()); // reached a terminal status (cancel/timeout)
                }

                self.with_execution(execution_id, |state, execution| {
                    state.apply_step_result(
                        execution,
                        template,
                        &step.id,
                        StepOutcome::Started {
                            input: step.config.clone(),
                        },
                    )
                })
                .await?;

                let context = self.store.load(execution_id).await?.context;
                let outcome = match self.run_step(step, &context).await {
                    Ok(output) => StepOutcome::Succeeded { output },
                    Err(err) => StepOutcome::Failed {
                        error: err.into_error_info(),
                    },
                };

                let disposition = self
                    .with_execution(execution_id, |state, execution| {
                        state.apply_step_result(execution, template, &step.id, outcome)
                    })
                    .await?;

                match disposition {
                    StepDisposition::Advanced => break,
                    StepDisposition::Retry { delay, .. } => {
                        tokio::time::sleep(delay).await;
                    }
                    StepDisposition::ExecutionCompleted | StepDisposition::ExecutionFailed => {
                        return Ok(());
                    }
                    StepDisposition::Running => {
                        // Started outcomes yield Running; Succeeded/Failed never do.
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one step against the external runner, the only await point
    /// that leaves the engine.
    async fn run_step(
        &self,
        step: &WorkflowStep,
        context: &FieldMap,
    ) -> Result<FieldMap, crate::step_runner::StepRunnerError> {
        let Some(loop_config) = &step.loop_config else {
            return self.runner.run(step, &step.config, context).await;
        };

        let items: Vec<FieldValue> = context
            .get(&loop_config.over)
            .and_then(|value| value.as_list())
            .map(<[FieldValue]>::to_vec)
            .unwrap_or_default();
        let concurrency = if loop_config.parallel {
            self.config.loop_fan_out
        } else {
            1
        };

        let inputs: Vec<FieldMap> = items
            .into_iter()
            .map(|item| {
                let mut input = step.config.clone();
                input.insert("item".into(), item);
                input
            })
            .collect();

        // Fan out up to the concurrency limit; the loop step completes only
        // after every iteration finishes (fan-in join).
        let outputs: Vec<FieldMap> = stream::iter(inputs)
            .map(|input| {
                let runner = Arc::clone(&self.runner);
                async move { runner.run(step, &input, context).await }
            })
            .buffered(concurrency.max(1))
            .try_collect()
            .await?;

        let mut output = FieldMap::new();
        output.insert(
            "iterations".into(),
            FieldValue::List(outputs.into_iter().map(FieldValue::Map).collect()),
        );
        Ok(output)
    }

    /// Block while the execution is paused. Returns false once the
    /// execution is terminal, true when it is running.
    async fn wait_until_runnable(&self, execution_id: &ExecutionId) -> WorkflowResult<bool> {
        loop {
            let status = self.store.load(execution_id).await?.status;
            match status {
                ExecutionStatus::Running => return Ok(true),
                ExecutionStatus::Paused => {
                    let gate = self.gate_for(execution_id).await;
                    let resumed = gate.resumed.notified();
                    // re-check after arming the waiter so a resume between
                    // the load and the wait is not lost
                    if self.store.load(execution_id).await?.status != ExecutionStatus::Paused {
                        continue;
                    }
                    resumed.await;
                }
                _ => return Ok(false),
            }
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Load-mutate-save under the per-execution lock
    async fn with_execution<T>(
        &self,
        execution_id: &ExecutionId,
        mutate: impl FnOnce(&ExecutionStateMachine, &mut WorkflowExecution) -> WorkflowResult<T>,
    ) -> WorkflowResult<T> {
        let gate = self.gate_for(execution_id).await;
        let _guard = gate.lock.lock().await;

        let mut execution = self.store.load(execution_id).await?;
        let value = mutate(&self.state, &mut execution)?;
        self.store.save(&mut execution).await?;
        Ok(value)
    }

    async fn gate_for(&self, execution_id: &ExecutionId) -> Arc<ExecutionGate> {
        self.gates
            .lock()
            .await
            .entry(execution_id.clone())
            .or_default()
            .clone()
    }

    /// Free the (card, template) slot once its execution is terminal
    async fn release_guard(&self, execution_id: &ExecutionId) {
        let Ok(execution) = self.store.load(execution_id).await else {
            return;
        };
        if !execution.is_terminal() {
            return;
        }
        if let Some(card_id) = &execution.card_id {
            let key = (card_id.clone(), execution.template_id.clone());
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.get(&key) == Some(&execution.id) {
                in_flight.remove(&key);
            }
        }
    }
}
