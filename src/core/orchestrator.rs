//! 引擎：任务与工作流的提交入口
//!
//! 每个任务/工作流各起一个 tokio 工作协程，互不阻塞；停止信号按 ID 经 StopRegistry 广播。
//! 自主模式下，任务完成后从输出中解析动作提案，生成工作流交给 WorkflowManager 执行。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::autonomy::parse_action_proposals;
use crate::config::{BackendSection, LlmSection};
use crate::core::executor::TaskExecutor;
use crate::core::shutdown::{ShutdownManager, StopGuard, StopRegistry};
use crate::core::{EngineError, Task, TaskId, TaskStatus, TaskSubmission};
use crate::llm::{LlmBackend, LocalBackend, MockBackend, RemoteBackend};
use crate::memory::{TaskRecord, TaskRecordStore};
use crate::workflow::{Workflow, WorkflowId, WorkflowManager, WorkflowReport};

/// 根据一段后端配置创建后端；openai 缺少 API Key 时退回 Mock
fn create_backend(
    section: &BackendSection,
    timeout: Duration,
) -> Result<Arc<dyn LlmBackend>, EngineError> {
    match section.provider.to_lowercase().as_str() {
        "openai" | "remote" => match section.api_key() {
            Some(key) => {
                tracing::info!("Using remote LLM ({})", section.model);
                Ok(Arc::new(RemoteBackend::new(
                    section.base_url.as_deref(),
                    &section.model,
                    Some(&key),
                )))
            }
            None => {
                tracing::warn!("No API key in {}, using Mock LLM", section.api_key_env);
                Ok(Arc::new(MockBackend))
            }
        },
        "local" | "ollama" => {
            tracing::info!("Using local LLM ({})", section.model);
            let backend = LocalBackend::new(section.base_url.as_deref(), &section.model, timeout)
                .map_err(|e| EngineError::Config(format!("local backend: {}", e)))?;
            Ok(Arc::new(backend))
        }
        "mock" => Ok(Arc::new(MockBackend)),
        other => Err(EngineError::Config(format!("unknown llm provider: {}", other))),
    }
}

/// 根据配置选择主/备后端
pub fn create_backends_from_config(
    cfg: &LlmSection,
) -> Result<(Arc<dyn LlmBackend>, Option<Arc<dyn LlmBackend>>), EngineError> {
    let timeout = Duration::from_secs(cfg.timeouts.request.max(1));
    let primary = create_backend(&cfg.primary, timeout)?;
    let secondary = cfg
        .secondary
        .as_ref()
        .map(|s| create_backend(s, timeout))
        .transpose()?;
    Ok((primary, secondary))
}

/// 一次提交的最终结果：任务本身，以及自主模式下执行的提案工作流
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub task: Task,
    pub workflow: Option<WorkflowReport>,
}

pub struct TaskHandle {
    id: TaskId,
    handle: JoinHandle<SubmissionOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<SubmissionOutcome, EngineError> {
        self.handle
            .await
            .map_err(|e| EngineError::Worker(format!("task {} worker: {}", self.id, e)))
    }
}

pub struct WorkflowHandle {
    id: WorkflowId,
    handle: JoinHandle<WorkflowReport>,
}

impl WorkflowHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<WorkflowReport, EngineError> {
        self.handle
            .await
            .map_err(|e| EngineError::Worker(format!("workflow {} worker: {}", self.id, e)))
    }
}

pub struct Engine {
    tasks: Arc<TaskExecutor>,
    workflows: Arc<WorkflowManager>,
    records: Arc<dyn TaskRecordStore>,
    stops: Arc<StopRegistry>,
    shutdown: Arc<ShutdownManager>,
}

impl Engine {
    pub fn new(
        tasks: Arc<TaskExecutor>,
        workflows: Arc<WorkflowManager>,
        records: Arc<dyn TaskRecordStore>,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        Self {
            stops: Arc::new(StopRegistry::new(shutdown.token())),
            tasks,
            workflows,
            records,
            shutdown,
        }
    }

    /// 提交任务；立即返回句柄，任务在独立协程中执行
    pub fn submit(&self, submission: TaskSubmission) -> TaskHandle {
        let task = submission.into_task();
        let id = task.id.clone();
        let stop = self.stops.register(&id);
        let tasks = Arc::clone(&self.tasks);
        let workflows = Arc::clone(&self.workflows);
        tracing::info!(task_id = %id, autonomous = task.autonomous_mode, "task submitted");

        let guard = StopGuard::new(Arc::clone(&self.stops), id.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let mut task = tasks.run(task, &stop).await;
            let workflow = if task.autonomous_mode
                && task.status == TaskStatus::Completed
                && !stop.is_cancelled()
            {
                let specs = parse_action_proposals(&task.combined_output());
                if specs.is_empty() {
                    tracing::info!(task_id = %task.id, "no action proposals in output");
                    None
                } else {
                    match Workflow::from_proposals(format!("proposals:{}", task.id), specs) {
                        Ok(wf) => Some(workflows.run(&wf, &stop).await),
                        Err(e) => {
                            tracing::warn!(task_id = %task.id, error = %e, "action proposals rejected");
                            task.annotate(format!("action proposals rejected: {}", e));
                            None
                        }
                    }
                }
            } else {
                None
            };
            SubmissionOutcome { task, workflow }
        });

        TaskHandle { id, handle }
    }

    /// 提交预先构建的工作流
    pub fn submit_workflow(&self, workflow: Workflow) -> WorkflowHandle {
        let id = workflow.id.clone();
        let stop = self.stops.register(&id);
        let workflows = Arc::clone(&self.workflows);
        let guard = StopGuard::new(Arc::clone(&self.stops), id.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            workflows.run(&workflow, &stop).await
        });
        WorkflowHandle { id, handle }
    }

    /// 请求停止；返回 false 表示该 ID 不在运行
    pub fn stop(&self, id: &str) -> bool {
        self.stops.stop(id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.stops.active_ids()
    }

    /// 读取持久化的任务记录（每轮续写后都会更新）
    pub async fn record(&self, id: &str) -> Result<Option<TaskRecord>, EngineError> {
        self.records.load(id).await
    }

    pub fn shutdown_manager(&self) -> Arc<ShutdownManager> {
        Arc::clone(&self.shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_openai_without_key_falls_back_to_mock() {
        let mut cfg = AppConfig::default();
        cfg.llm.primary.api_key_env = "TASKPILOT_TEST_MISSING_KEY".to_string();
        cfg.llm.secondary = None;
        let (primary, secondary) = create_backends_from_config(&cfg.llm).unwrap();
        assert_eq!(primary.name(), "mock");
        assert!(secondary.is_none());
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let mut cfg = AppConfig::default();
        cfg.llm.primary.provider = "carrier-pigeon".to_string();
        assert!(matches!(
            create_backends_from_config(&cfg.llm),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_local_secondary() {
        let mut cfg = AppConfig::default();
        cfg.llm.primary.provider = "mock".to_string();
        let (_, secondary) = create_backends_from_config(&cfg.llm).unwrap();
        assert!(secondary.unwrap().name().starts_with("local"));
    }
}
