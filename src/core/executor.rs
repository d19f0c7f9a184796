//! 单任务协调：分类 → 检索上下文 → 续写循环 → 归档写回
//!
//! 记忆库读写失败不会让任务失败：以空上下文继续并标记 degraded。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::classifier::{Classification, TaskClassifier};
use crate::core::continuation::{ContinuationConfig, ContinuationController};
use crate::core::handler::handler_for;
use crate::core::task::send_event;
use crate::core::{EngineError, Task, TaskCategory, TaskEvent, TaskStatus};
use crate::llm::ProviderGateway;
use crate::memory::{MemoryStore, TaskRecord, TaskRecordStore};

pub const DEFAULT_TOP_K: usize = 5;

pub struct TaskExecutor {
    gateway: Arc<ProviderGateway>,
    classifier: TaskClassifier,
    memory: Arc<dyn MemoryStore>,
    continuation: ContinuationConfig,
    records: Option<Arc<dyn TaskRecordStore>>,
    default_category: TaskCategory,
    top_k: usize,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl TaskExecutor {
    /// 默认分类器会在规则置信度不足时借用同一网关做模型辅助分类
    pub fn new(gateway: Arc<ProviderGateway>, memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            classifier: TaskClassifier::default().with_model(gateway.clone()),
            gateway,
            memory,
            continuation: ContinuationConfig::default(),
            records: None,
            default_category: TaskCategory::Code,
            top_k: DEFAULT_TOP_K,
            events: None,
        }
    }

    pub fn with_classifier(mut self, classifier: TaskClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_continuation(mut self, config: ContinuationConfig) -> Self {
        self.continuation = config;
        self
    }

    pub fn with_records(mut self, records: Arc<dyn TaskRecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn with_default_category(mut self, category: TaskCategory) -> Self {
        if category != TaskCategory::Unknown {
            self.default_category = category;
        }
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_events(mut self, events: Option<mpsc::UnboundedSender<TaskEvent>>) -> Self {
        self.events = events;
        self
    }

    pub fn gateway(&self) -> &Arc<ProviderGateway> {
        &self.gateway
    }

    fn mark_degraded(&self, task: &mut Task, err: EngineError) {
        tracing::warn!(task_id = %task.id, error = %err, "running in degraded mode");
        task.degraded = true;
        task.annotate(err.to_string());
        send_event(
            &self.events,
            TaskEvent::Degraded {
                task_id: task.id.clone(),
                reason: err.to_string(),
            },
        );
    }

    async fn classify(&self, task: &mut Task, stop: &CancellationToken) {
        let classification = if task.category != TaskCategory::Unknown {
            Classification::hinted(task.category)
        } else if stop.is_cancelled() {
            // 已请求停止：不再发起模型调用
            self.classifier.classify_rules(&task.description, &task.files)
        } else {
            self.classifier
                .classify(&task.description, &task.files)
                .await
        };

        let category = if classification.category == TaskCategory::Unknown {
            let note = EngineError::ClassificationAmbiguous {
                confidence: classification.confidence,
                applied: self.default_category,
            };
            tracing::info!(task_id = %task.id, "{}", note);
            task.annotate(note.to_string());
            self.default_category
        } else {
            classification.category
        };
        task.category = category;
        send_event(
            &self.events,
            TaskEvent::Classified {
                task_id: task.id.clone(),
                category,
                confidence: classification.confidence,
            },
        );
    }

    async fn retrieve_context(&self, task: &mut Task) -> Vec<String> {
        if !task.memory_enabled || !self.memory.enabled() || self.top_k == 0 {
            return Vec::new();
        }
        match self.memory.retrieve(&task.description, self.top_k).await {
            Ok(items) => items.into_iter().map(|i| i.text).collect(),
            Err(e) => {
                self.mark_degraded(task, e.into());
                Vec::new()
            }
        }
    }

    async fn archive(&self, task: &mut Task) {
        if !task.memory_enabled || !self.memory.enabled() || task.accumulated_outputs.is_empty() {
            return;
        }
        let mut metadata = HashMap::new();
        metadata.insert("category".to_string(), task.category.to_string());
        metadata.insert("status".to_string(), task.status.to_string());
        let text = format!("{}\n{}", task.description, task.combined_output());
        if let Err(e) = self.memory.store(&task.id, &text, metadata).await {
            self.mark_degraded(task, e.into());
        }
    }

    /// 执行一个任务直至终态；部分输出在 Stopped / Failed 时同样保留
    pub async fn run(&self, mut task: Task, stop: &CancellationToken) -> Task {
        self.classify(&mut task, stop).await;
        let context = self.retrieve_context(&mut task).await;
        let prompt = handler_for(task.category).build_prompt(&task);

        let mut controller =
            ContinuationController::new(self.gateway.clone(), self.continuation.clone())
                .with_events(self.events.clone());
        if let Some(records) = &self.records {
            controller = controller.with_records(records.clone());
        }

        match controller.run(&mut task, &prompt, &context, stop).await {
            Ok(report) => {
                tracing::info!(
                    task_id = %task.id,
                    status = %task.status,
                    iterations = task.iteration_count,
                    tokens = report.usage.total_tokens,
                    "task finished"
                );
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "task loop error");
                task.error = Some(e.to_string());
                if !task.status.is_terminal() {
                    let _ = task.transition(TaskStatus::Failed);
                }
            }
        }

        self.archive(&mut task).await;
        if let Some(records) = &self.records {
            if let Err(e) = records.save(&TaskRecord::from(&task)).await {
                tracing::warn!(task_id = %task.id, error = %e, "final task record save failed");
            }
        }
        task
    }
}
