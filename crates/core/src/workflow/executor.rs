use super::dag::WorkflowDag;
use super::handler::{HandlerRegistry, StepHandler, StepInvocation};
use crate::config::EngineConfig;
use crate::connection::ConnectionManager;
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::events::Event;
use crate::expression;
use crate::state::StepStateMachine;
use crate::storage::RunLog;
use crate::types::{
    Outputs, RunId, RunStatus, StepDefinition, StepResult, StepStatus, WorkflowResult,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

/// Workflow executor that drives a validated DAG to completion
pub struct WorkflowExecutor {
    registry: Arc<HandlerRegistry>,
    connections: Arc<ConnectionManager>,
    config: EngineConfig,
    run_log: Option<Arc<dyn RunLog>>,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        connections: Arc<ConnectionManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            connections,
            config,
            run_log: None,
        }
    }

    /// Record every finished run with the given log
    pub fn with_run_log(mut self, run_log: Arc<dyn RunLog>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Execute a workflow and return its result.
    ///
    /// Handler resolution happens before any step runs. Step failures are
    /// recorded on the result; only scheduler faults come back as `Err`.
    pub async fn execute(
        &self,
        run_id: RunId,
        dag: &WorkflowDag,
        context: ExecutionContext,
    ) -> EngineResult<WorkflowResult> {
        let handlers = self.registry.resolve(dag)?;
        let order = dag.topological_order();
        let names: Vec<String> = order.iter().map(|s| s.name.clone()).collect();

        tracing::info!(%run_id, steps = names.len(), "Starting workflow execution");

        let mut run = RunState {
            run_id,
            dag,
            handlers,
            context,
            machine: Arc::new(Mutex::new(StepStateMachine::new(names.clone()))),
            gate: Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
            connections: self.connections.clone(),
            default_loop_max: self.config.default_loop_max,
            tasks: JoinSet::new(),
            task_steps: HashMap::new(),
            result: WorkflowResult::new(run_id),
        };

        self.connections
            .broadcast(run_id, Event::workflow_start(run_id, names))
            .await;

        let outcome = run.drive(&order).await;
        let mut result = run.finish().await;
        if outcome.is_err() {
            result.overall_status = RunStatus::Failed;
        }

        let duration_ms = result
            .completed_at
            .map_or(0, |end| (end - result.started_at).num_milliseconds());
        self.connections
            .broadcast(
                run_id,
                Event::workflow_end(run_id, result.overall_status, duration_ms),
            )
            .await;

        match &outcome {
            Ok(()) => tracing::info!(
                %run_id,
                status = %result.overall_status,
                duration_ms,
                "Workflow execution completed"
            ),
            Err(e) => tracing::error!(%run_id, error = %e, "Workflow execution aborted"),
        }

        if let Some(run_log) = &self.run_log {
            if let Err(e) = run_log.record(&result).await {
                tracing::error!(%run_id, error = %e, "Failed to record workflow result");
            }
        }

        outcome.map(|()| result)
    }
}

/// Output of one dispatched attempt
struct Completion {
    step: String,
    attempt: u32,
    input: Value,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    outcome: Result<Outputs, String>,
}

/// Bookkeeping for a single run
struct RunState<'a> {
    run_id: RunId,
    dag: &'a WorkflowDag,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    context: ExecutionContext,
    machine: Arc<Mutex<StepStateMachine>>,
    gate: Arc<Semaphore>,
    connections: Arc<ConnectionManager>,
    default_loop_max: u32,
    tasks: JoinSet<Completion>,
    task_steps: HashMap<tokio::task::Id, String>,
    result: WorkflowResult,
}

impl RunState<'_> {
    /// Schedule, wait for a completion, repeat until every step is terminal
    async fn drive(&mut self, order: &[Arc<StepDefinition>]) -> EngineResult<()> {
        loop {
            self.schedule_ready(order).await?;

            if self.tasks.is_empty() {
                let machine = self.machine.lock().await;
                if machine.all_terminal() {
                    return Ok(());
                }

                let pending = machine.in_state(StepStatus::Pending);
                tracing::error!(run_id = %self.run_id, ?pending, "No runnable steps left");
                debug_assert!(pending.is_empty(), "scheduler stalled on a validated DAG");
                return Err(EngineError::SchedulingStalled { pending });
            }

            match self.tasks.join_next_with_id().await {
                Some(Ok((id, completion))) => {
                    self.task_steps.remove(&id);
                    self.complete(completion).await?;
                }
                Some(Err(e)) => {
                    let step = self.task_steps.remove(&e.id());
                    self.abandon(step, e.to_string()).await?;
                }
                None => {}
            }
        }
    }

    /// One pass over pending steps in topological order, so a skip cascades
    /// to dependents within the same pass
    async fn schedule_ready(&mut self, order: &[Arc<StepDefinition>]) -> EngineResult<()> {
        for step in order {
            let blocked_by = {
                let machine = self.machine.lock().await;
                if machine.status(&step.name) != Some(StepStatus::Pending) {
                    continue;
                }

                let statuses: Vec<(&String, Option<StepStatus>)> = step
                    .dependencies
                    .iter()
                    .map(|dep| (dep, machine.status(dep)))
                    .collect();
                if !statuses
                    .iter()
                    .all(|(_, s)| s.is_some_and(StepStatus::is_terminal))
                {
                    continue;
                }

                statuses
                    .into_iter()
                    .find(|(_, s)| s.is_some_and(StepStatus::blocks_dependents))
                    .map(|(dep, s)| (dep.clone(), s.unwrap_or(StepStatus::Failed)))
            };

            if let Some((dep, status)) = blocked_by {
                if !step.ignore_upstream_failure {
                    self.skip(step, format!("dependency '{dep}' ended {status}"))
                        .await?;
                    continue;
                }
            }

            let snapshot = self.context.snapshot().await;
            if !expression::evaluate_optional(step.when.as_deref(), &snapshot) {
                self.skip(step, "condition evaluated to false".to_string())
                    .await?;
                continue;
            }

            self.machine
                .lock()
                .await
                .transition(&step.name, StepStatus::Ready)?;
            self.dispatch(step.clone(), 1).await;
        }

        Ok(())
    }

    async fn skip(&mut self, step: &StepDefinition, reason: String) -> EngineResult<()> {
        self.machine
            .lock()
            .await
            .transition(&step.name, StepStatus::Skipped)?;
        tracing::info!(run_id = %self.run_id, step = %step.name, %reason, "Skipping step");

        self.record(StepResult::skipped(step.name.clone(), reason))
            .await;
        Ok(())
    }

    /// Submit a step to the worker pool. It becomes RUNNING once a slot frees up.
    async fn dispatch(&mut self, step: Arc<StepDefinition>, attempt: u32) {
        let snapshot = self.context.snapshot().await;
        let input = expression::resolve_value(&step.params, &snapshot);

        let Some(handler) = self.handlers.get(&step.name).cloned() else {
            // Handlers are resolved for every DAG step before the run starts.
            tracing::error!(step = %step.name, "No handler bound to step");
            return;
        };

        let invocation = StepInvocation {
            run_id: self.run_id,
            step: step.clone(),
            input: input.clone(),
            context: self.context.clone(),
            attempt,
        };
        let gate = self.gate.clone();
        let machine = self.machine.clone();
        let connections = self.connections.clone();
        let run_id = self.run_id;
        let name = step.name.clone();

        tracing::debug!(%run_id, step = %name, attempt, "Dispatching step");

        let handle = self.tasks.spawn(async move {
            let mut completion = Completion {
                step: name.clone(),
                attempt,
                input,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                outcome: Err(String::new()),
            };

            let _permit = match gate.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    completion.outcome = Err(format!("admission gate closed: {e}"));
                    return completion;
                }
            };

            if let Err(e) = machine.lock().await.transition(&name, StepStatus::Running) {
                completion.outcome = Err(e.to_string());
                return completion;
            }
            connections
                .broadcast(run_id, Event::step_start(run_id, &name, attempt))
                .await;

            completion.started_at = Utc::now();
            // A panicking handler surfaces as a JoinError here instead of
            // tearing down the scheduler's task.
            let handled = tokio::spawn(async move { handler.execute(invocation).await }).await;
            completion.outcome = match handled {
                Ok(Ok(outputs)) => Ok(outputs),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(e) => Err(format!("step handler panicked: {e}")),
            };
            completion.ended_at = Utc::now();
            completion
        });

        self.task_steps.insert(handle.id(), step.name.clone());
    }

    async fn complete(&mut self, completion: Completion) -> EngineResult<()> {
        let step = self
            .dag
            .step(&completion.step)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStep(completion.step.clone()))?;

        let outputs = match completion.outcome.clone() {
            Ok(outputs) => outputs,
            Err(error) => {
                return self
                    .settle(&step, completion, StepStatus::Failed, Some(error))
                    .await;
            }
        };

        if let Err(e) = self
            .context
            .merge(&step.name, &step.outputs, &outputs)
            .await
        {
            return self
                .settle(&step, completion, StepStatus::Failed, Some(e.to_string()))
                .await;
        }

        let Some(condition) = step.loop_until.as_deref() else {
            return self
                .settle(&step, completion, StepStatus::Success, None)
                .await;
        };

        let snapshot = self.context.snapshot().await;
        if expression::evaluate_condition(condition, &snapshot) {
            return self
                .settle(&step, completion, StepStatus::Success, None)
                .await;
        }

        let loop_max = step.loop_max.unwrap_or(self.default_loop_max).max(1);
        if completion.attempt >= loop_max {
            let error = format!(
                "loop_until condition not met after {} iterations",
                completion.attempt
            );
            return self
                .settle(&step, completion, StepStatus::Failed, Some(error))
                .await;
        }

        let next_attempt = completion.attempt + 1;
        tracing::info!(
            run_id = %self.run_id,
            step = %step.name,
            next_attempt,
            loop_max,
            "loop_until not satisfied, re-running step"
        );
        self.machine
            .lock()
            .await
            .transition(&step.name, StepStatus::Retrying)?;
        self.record(attempt_result(completion, StepStatus::Retrying, None))
            .await;
        self.dispatch(step, next_attempt).await;

        Ok(())
    }

    /// Move a completed attempt to its terminal state and record it
    async fn settle(
        &mut self,
        step: &StepDefinition,
        completion: Completion,
        status: StepStatus,
        error: Option<String>,
    ) -> EngineResult<()> {
        self.machine.lock().await.transition(&step.name, status)?;

        let error = error.map(|message| {
            EngineError::StepExecution {
                step: step.name.clone(),
                message,
            }
            .to_string()
        });
        match (&error, step.optional) {
            (None, _) => {
                tracing::info!(run_id = %self.run_id, step = %step.name, attempt = completion.attempt, "Step completed")
            }
            (Some(e), true) => {
                tracing::warn!(run_id = %self.run_id, step = %step.name, error = %e, "Optional step failed")
            }
            (Some(e), false) => {
                tracing::warn!(run_id = %self.run_id, step = %step.name, error = %e, "Step failed")
            }
        }

        self.record(attempt_result(completion, status, error)).await;
        Ok(())
    }

    /// A dispatched task died without producing a completion
    async fn abandon(&mut self, step: Option<String>, error: String) -> EngineResult<()> {
        let Some(name) = step else {
            tracing::error!(run_id = %self.run_id, %error, "Lost track of a step task");
            return Ok(());
        };

        {
            let mut machine = self.machine.lock().await;
            if matches!(
                machine.status(&name),
                Some(StepStatus::Ready | StepStatus::Retrying)
            ) {
                machine.transition(&name, StepStatus::Running)?;
            }
            machine.transition(&name, StepStatus::Failed)?;
        }

        let now = Utc::now();
        self.record(StepResult {
            step_name: name.clone(),
            status: StepStatus::Failed,
            attempt: 0,
            input_data: Value::Null,
            output_data: Value::Null,
            start_time: Some(now),
            end_time: Some(now),
            error: Some(
                EngineError::StepExecution {
                    step: name,
                    message: format!("step task aborted: {error}"),
                }
                .to_string(),
            ),
        })
        .await;
        Ok(())
    }

    async fn record(&mut self, step_result: StepResult) {
        if step_result.status.is_terminal() {
            let path = format!("steps.{}.status", step_result.step_name);
            if let Err(e) = self
                .context
                .set(&path, Value::String(step_result.status.to_string()))
                .await
            {
                tracing::debug!(%path, error = %e, "Could not publish step status");
            }
        }

        self.connections
            .broadcast(self.run_id, Event::step_complete(self.run_id, &step_result))
            .await;
        self.result.steps.push(step_result);
    }

    /// Freeze the result: overall status and outputs of successful sink steps
    async fn finish(mut self) -> WorkflowResult {
        let machine = self.machine.lock().await;

        let failed = self
            .dag
            .steps()
            .any(|s| !s.optional && machine.status(&s.name) == Some(StepStatus::Failed));
        self.result.overall_status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        let mut final_output = serde_json::Map::new();
        for sink in self.dag.sink_steps() {
            if machine.status(&sink) != Some(StepStatus::Success) {
                continue;
            }
            if let Some(step_result) = self.result.step(&sink) {
                final_output.insert(sink.clone(), step_result.output_data.clone());
            }
        }
        drop(machine);

        self.result.final_output = Value::Object(final_output);
        self.result.completed_at = Some(Utc::now());
        self.result
    }
}

fn attempt_result(completion: Completion, status: StepStatus, error: Option<String>) -> StepResult {
    StepResult {
        step_name: completion.step,
        status,
        attempt: completion.attempt,
        input_data: completion.input,
        output_data: completion
            .outcome
            .map(Value::Object)
            .unwrap_or(Value::Null),
        start_time: Some(completion.started_at),
        end_time: Some(completion.ended_at),
        error,
    }
}
