//! 工作流执行
//!
//! 每个批次前检查停止信号；动作步骤先经 SafetyValidator 与确认，再交给 AutonomousExecutor；
//! 任务步骤交给 TaskExecutor。失败按步骤策略与 RecoveryEngine 决定重试、跳过或中止。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::autonomy::{ActionSpec, AutonomousExecutor, Policy, SafetyValidator};
use crate::core::executor::TaskExecutor;
use crate::core::recovery::{FailurePolicy, RecoveryEngine};
use crate::core::task::send_event;
use crate::core::{EngineError, RecoveryAction, TaskEvent, TaskStatus};
use crate::workflow::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Abort,
    Stop,
}

pub struct WorkflowManager {
    policy: Arc<Policy>,
    executor: Arc<AutonomousExecutor>,
    tasks: Option<Arc<TaskExecutor>>,
    recovery: RecoveryEngine,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl WorkflowManager {
    pub fn new(policy: Arc<Policy>, executor: Arc<AutonomousExecutor>) -> Self {
        Self {
            policy,
            executor,
            tasks: None,
            recovery: RecoveryEngine::new(),
            events: None,
        }
    }

    /// 任务步骤需要 TaskExecutor；未配置时任务步骤直接失败
    pub fn with_task_executor(mut self, tasks: Arc<TaskExecutor>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_events(mut self, events: Option<mpsc::UnboundedSender<TaskEvent>>) -> Self {
        self.events = events;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// 执行工作流直至完成、中止或停止；未执行的步骤记为 NotRun
    pub async fn run(&self, workflow: &Workflow, stop: &CancellationToken) -> WorkflowReport {
        let started_at = Utc::now();
        tracing::info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            steps = workflow.steps.len(),
            "workflow started"
        );

        let mut records: BTreeMap<usize, StepRecord> = BTreeMap::new();
        let mut outputs: BTreeMap<usize, String> = BTreeMap::new();
        let mut status = WorkflowStatus::Running;

        for batch in workflow.batches() {
            if stop.is_cancelled() {
                tracing::info!(workflow_id = %workflow.id, "stop requested, remaining steps not run");
                status = WorkflowStatus::Stopped;
                break;
            }

            let results = join_all(
                batch
                    .iter()
                    .map(|step| self.run_step(step, &records, &outputs, stop)),
            )
            .await;

            for (record, flow) in results {
                tracing::info!(
                    workflow_id = %workflow.id,
                    position = record.position,
                    step = %record.name,
                    status = record.status.as_str(),
                    attempts = record.attempts,
                    "step finished"
                );
                send_event(
                    &self.events,
                    TaskEvent::StepFinished {
                        workflow_id: workflow.id.clone(),
                        position: record.position,
                        status: record.status.as_str().to_string(),
                    },
                );
                if record.status == StepStatus::Succeeded {
                    outputs.insert(record.position, record.output.clone());
                }
                records.insert(record.position, record);
                match flow {
                    Flow::Abort => status = WorkflowStatus::Failed,
                    Flow::Stop if status == WorkflowStatus::Running => {
                        status = WorkflowStatus::Stopped
                    }
                    _ => {}
                }
            }

            if status != WorkflowStatus::Running {
                break;
            }
        }

        if status == WorkflowStatus::Running {
            status = WorkflowStatus::Completed;
        }

        let steps = workflow
            .steps
            .iter()
            .map(|s| {
                records
                    .remove(&s.position)
                    .unwrap_or_else(|| StepRecord::new(s, StepStatus::NotRun))
            })
            .collect();

        tracing::info!(workflow_id = %workflow.id, status = ?status, "workflow finished");
        WorkflowReport {
            workflow_id: workflow.id.clone(),
            name: workflow.name.clone(),
            status,
            steps,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_step(
        &self,
        step: &WorkflowStep,
        records: &BTreeMap<usize, StepRecord>,
        outputs: &BTreeMap<usize, String>,
        stop: &CancellationToken,
    ) -> (StepRecord, Flow) {
        let started = Instant::now();

        if step.depends_on_prev && step.position > 1 {
            let prev_ok = records
                .get(&(step.position - 1))
                .is_some_and(|r| r.status == StepStatus::Succeeded);
            if !prev_ok {
                let record = StepRecord::new(step, StepStatus::Skipped)
                    .with_error("previous step did not succeed");
                return (record, Flow::Continue);
            }
        }

        let render = |s: &str| render_template(s, step.position, outputs);
        let (mut record, flow) = match &step.target {
            StepTarget::Action(spec) => self.run_action(step, spec.resolve(render), stop).await,
            StepTarget::Task(spec) => {
                let spec = TaskSpec {
                    description: render(&spec.description),
                    ..spec.clone()
                };
                self.run_task(step, spec, stop).await
            }
        };
        record.duration_ms = started.elapsed().as_millis() as u64;
        (record, flow)
    }

    async fn run_action(
        &self,
        step: &WorkflowStep,
        spec: ActionSpec,
        stop: &CancellationToken,
    ) -> (StepRecord, Flow) {
        let mut record = StepRecord::new(step, StepStatus::Failed);

        let mut action = match spec.into_action() {
            Ok(a) => a,
            Err(e) => {
                record.error = Some(format!("invalid action: {}", e));
                let flow = if step.failure_policy == FailurePolicy::Abort {
                    Flow::Abort
                } else {
                    Flow::Continue
                };
                return (record, flow);
            }
        };
        record.action_id = Some(action.id.clone());

        let decision = SafetyValidator::validate(&action, &self.policy);
        tracing::debug!(
            action_id = %action.id,
            verdict = ?decision.verdict,
            reason = decision.reason_text(),
            "safety decision"
        );
        let decision = match self.executor.authorize(&action, decision).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(action_id = %action.id, error = %e, "action denied");
                return self.denied(record, &e, step.failure_policy);
            }
        };
        action.validated = true;

        let limits = self.executor.limits();
        let deadline = Instant::now() + limits.step_budget;
        let max_attempts = limits.max_attempts_per_step.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            record.attempts = attempts;
            let err = match self
                .executor
                .execute_with_deadline(&action, &decision, deadline)
                .await
            {
                Ok(result) if result.success => {
                    record.status = StepStatus::Succeeded;
                    record.output = result.output;
                    record.state_delta = Some(result.state_delta);
                    record.error = None;
                    return (record, Flow::Continue);
                }
                Ok(result) => {
                    record.output = result.output;
                    record.state_delta = Some(result.state_delta);
                    EngineError::ActionFailed(
                        result.error.unwrap_or_else(|| "action failed".to_string()),
                    )
                }
                Err(e) => e,
            };

            if err.is_safety_denial() {
                return self.denied(record, &err, step.failure_policy);
            }

            let recovery = self.recovery.handle(&err, step.failure_policy, attempts);
            let can_retry = attempts < max_attempts && Instant::now() < deadline;
            if recovery == RecoveryAction::Retry && can_retry {
                if stop.is_cancelled() {
                    record.status = StepStatus::Stopped;
                    record.error = Some(err.to_string());
                    return (record, Flow::Stop);
                }
                tracing::debug!(action_id = %action.id, attempts, error = %err, "retrying step");
                continue;
            }

            record.error = Some(err.to_string());
            let flow = match recovery {
                RecoveryAction::Abort => Flow::Abort,
                _ => Flow::Continue,
            };
            return (record, flow);
        }
    }

    fn denied(
        &self,
        mut record: StepRecord,
        err: &EngineError,
        policy: FailurePolicy,
    ) -> (StepRecord, Flow) {
        record.status = StepStatus::Denied;
        record.denial_reason = Some(match err {
            EngineError::SafetyDenied(r) | EngineError::ConfirmationTimeout(r) => r.clone(),
            other => other.to_string(),
        });
        record.error = Some(err.to_string());
        let flow = match self.recovery.handle(err, policy, record.attempts.max(1)) {
            RecoveryAction::Abort => Flow::Abort,
            _ => Flow::Continue,
        };
        (record, flow)
    }

    async fn run_task(
        &self,
        step: &WorkflowStep,
        spec: TaskSpec,
        stop: &CancellationToken,
    ) -> (StepRecord, Flow) {
        let mut record = StepRecord::new(step, StepStatus::Failed);
        record.attempts = 1;

        let Some(tasks) = &self.tasks else {
            record.error = Some("no task executor configured".to_string());
            return (record, Flow::Abort);
        };

        let task = spec.into_submission().into_task();
        record.task_id = Some(task.id.clone());
        let task = tasks.run(task, &stop.child_token()).await;
        record.output = task.combined_output();

        match task.status {
            TaskStatus::Completed => {
                record.status = StepStatus::Succeeded;
                (record, Flow::Continue)
            }
            TaskStatus::Stopped => {
                record.status = StepStatus::Stopped;
                (record, Flow::Stop)
            }
            _ => {
                let err = EngineError::ProviderExhausted(
                    task.error.unwrap_or_else(|| format!("task ended {}", task.status)),
                );
                record.error = Some(err.to_string());
                let flow = match self.recovery.handle(&err, step.failure_policy, 1) {
                    RecoveryAction::Abort => Flow::Abort,
                    _ => Flow::Continue,
                };
                (record, flow)
            }
        }
    }
}
