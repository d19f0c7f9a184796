//! 自动续写循环
//!
//! 每轮调用网关后判断是否继续：出现续写标记或检测到截断，且未达迭代上限、未请求停止。
//! 停止标志只在检查点（发起新调用之前）读取；进行中的调用可在宽限期内完成并保留结果，
//! 超过宽限期则放弃该调用，结果丢弃。每轮结束都会把任务快照写入 TaskRecordStore。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::task::send_event;
use crate::core::{EngineError, Task, TaskEvent, TaskStatus};
use crate::llm::{FinishReason, ProviderGateway, TokenUsage};
use crate::memory::{TaskRecord, TaskRecordStore};

/// 单任务迭代次数硬上限
pub const MAX_ITERATIONS: u32 = 10;

pub const MAX_ITERATIONS_NOTE: &str = "max iterations reached";

const CONTINUE_INSTRUCTION: &str =
    "Continue exactly from where your previous output stopped. Do not repeat earlier content.";

/// 响应信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerSignal {
    Complete,
    Continue,
    Truncated,
    /// 无标记且未截断：视为一次性答完
    None,
}

impl MarkerSignal {
    pub fn wants_continuation(self) -> bool {
        matches!(self, MarkerSignal::Continue | MarkerSignal::Truncated)
    }
}

/// 完成/续写标记规则：独占一行的标记文本
#[derive(Debug, Clone)]
pub struct MarkerRule {
    pub completion: String,
    pub continuation: String,
}

impl Default for MarkerRule {
    fn default() -> Self {
        Self {
            completion: "[[DONE]]".to_string(),
            continuation: "[[CONTINUE]]".to_string(),
        }
    }
}

impl MarkerRule {
    pub fn new(completion: impl Into<String>, continuation: impl Into<String>) -> Self {
        Self {
            completion: completion.into(),
            continuation: continuation.into(),
        }
    }

    /// 完成标记优先于续写标记
    pub fn detect(&self, text: &str, finish_reason: FinishReason) -> MarkerSignal {
        let mut complete = false;
        let mut cont = false;
        let mut fences = 0usize;
        for line in text.lines() {
            let line = line.trim();
            if line == self.completion {
                complete = true;
            } else if line == self.continuation {
                cont = true;
            } else if line.starts_with("```") {
                fences += 1;
            }
        }
        if complete {
            MarkerSignal::Complete
        } else if cont {
            MarkerSignal::Continue
        } else if finish_reason == FinishReason::Length || fences % 2 == 1 {
            MarkerSignal::Truncated
        } else {
            MarkerSignal::None
        }
    }

    /// 去掉标记行，保留其余文本
    pub fn strip(&self, text: &str) -> String {
        text.lines()
            .filter(|l| {
                let t = l.trim();
                t != self.completion && t != self.continuation
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim_end()
            .to_string()
    }

    pub fn protocol_instruction(&self) -> String {
        format!(
            "When your answer is complete, end with a line containing only {}. \
             If you have to stop before finishing, end with a line containing only {}.",
            self.completion, self.continuation
        )
    }
}

#[derive(Debug, Clone)]
pub struct ContinuationConfig {
    pub max_iterations: u32,
    /// 两轮之间的等待（可被停止打断）
    pub inter_iteration_delay: Duration,
    /// 停止后允许进行中调用完成的宽限期
    pub stop_grace: Duration,
    pub markers: MarkerRule,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            max_iterations: MAX_ITERATIONS,
            inter_iteration_delay: Duration::ZERO,
            stop_grace: Duration::from_secs(30),
            markers: MarkerRule::default(),
        }
    }
}

/// 单次 run 的汇总
#[derive(Debug, Clone, Default)]
pub struct ContinuationReport {
    pub usage: TokenUsage,
    /// 每轮实际服务请求的后端
    pub providers: Vec<String>,
}

pub struct ContinuationController {
    gateway: Arc<ProviderGateway>,
    records: Option<Arc<dyn TaskRecordStore>>,
    config: ContinuationConfig,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl ContinuationController {
    pub fn new(gateway: Arc<ProviderGateway>, mut config: ContinuationConfig) -> Self {
        config.max_iterations = config.max_iterations.clamp(1, MAX_ITERATIONS);
        Self {
            gateway,
            records: None,
            config,
            events: None,
        }
    }

    pub fn with_records(mut self, records: Arc<dyn TaskRecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn with_events(mut self, events: Option<mpsc::UnboundedSender<TaskEvent>>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &ContinuationConfig {
        &self.config
    }

    fn set_status(&self, task: &mut Task, status: TaskStatus) -> Result<(), EngineError> {
        task.transition(status)?;
        send_event(
            &self.events,
            TaskEvent::StatusChanged {
                task_id: task.id.clone(),
                status,
            },
        );
        Ok(())
    }

    async fn checkpoint(&self, task: &Task) {
        if let Some(records) = &self.records {
            if let Err(e) = records.save(&TaskRecord::from(task)).await {
                tracing::warn!(task_id = %task.id, error = %e, "task checkpoint failed");
            }
        }
    }

    fn continuation_prompt(&self, prompt: &str, task: &Task) -> String {
        format!(
            "{}\n\nYour output so far:\n{}\n\n{}\n{}",
            prompt,
            task.combined_output(),
            CONTINUE_INSTRUCTION,
            self.config.markers.protocol_instruction()
        )
    }

    /// 驱动任务直至终态（结果写回 task.status）
    pub async fn run(
        &self,
        task: &mut Task,
        prompt: &str,
        context: &[String],
        stop: &CancellationToken,
    ) -> Result<ContinuationReport, EngineError> {
        let mut report = ContinuationReport::default();
        if task.status == TaskStatus::Pending {
            self.set_status(task, TaskStatus::Running)?;
        }

        loop {
            // 检查点：发起新调用之前
            if stop.is_cancelled() {
                self.set_status(task, TaskStatus::Stopped)?;
                break;
            }

            let request_prompt = if task.accumulated_outputs.is_empty() {
                format!("{}\n\n{}", prompt, self.config.markers.protocol_instruction())
            } else {
                self.continuation_prompt(prompt, task)
            };

            let call = self.gateway.invoke(&request_prompt, context, task.category);
            tokio::pin!(call);
            let outcome = tokio::select! {
                biased;
                r = &mut call => Some(r),
                _ = stop.cancelled() => {
                    tracing::info!(task_id = %task.id, "stop requested while a provider call is in flight");
                    tokio::time::timeout(self.config.stop_grace, &mut call).await.ok()
                }
            };

            let result = match outcome {
                Some(Ok(result)) => result,
                Some(Err(e)) => {
                    let err = EngineError::from(e);
                    tracing::warn!(task_id = %task.id, error = %err, "provider exhausted");
                    task.error = Some(err.to_string());
                    self.set_status(task, TaskStatus::Failed)?;
                    break;
                }
                None => {
                    task.annotate("in-flight call abandoned after stop grace period");
                    self.set_status(task, TaskStatus::Stopped)?;
                    break;
                }
            };

            task.iteration_count += 1;
            let signal = self
                .config
                .markers
                .detect(&result.text, result.finish_reason);
            task.push_output(self.config.markers.strip(&result.text));
            report.usage.add(&result.usage);
            report.providers.push(result.provider.clone());
            tracing::debug!(
                task_id = %task.id,
                iteration = task.iteration_count,
                provider = %result.provider,
                signal = ?signal,
                "iteration finished"
            );
            send_event(
                &self.events,
                TaskEvent::Iteration {
                    task_id: task.id.clone(),
                    iteration: task.iteration_count,
                    provider: result.provider.clone(),
                },
            );
            self.checkpoint(task).await;

            if !signal.wants_continuation() {
                self.set_status(task, TaskStatus::Completed)?;
                break;
            }
            if stop.is_cancelled() {
                self.set_status(task, TaskStatus::Stopped)?;
                break;
            }
            if task.iteration_count >= self.config.max_iterations {
                task.annotate(MAX_ITERATIONS_NOTE);
                self.set_status(task, TaskStatus::Completed)?;
                break;
            }

            self.set_status(task, TaskStatus::Continuing)?;
            if !self.config.inter_iteration_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.inter_iteration_delay) => {}
                    _ = stop.cancelled() => {}
                }
            }
            if stop.is_cancelled() {
                self.set_status(task, TaskStatus::Stopped)?;
                break;
            }
            self.set_status(task, TaskStatus::Running)?;
        }

        self.checkpoint(task).await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskCategory;
    use crate::llm::{BackendError, BackendResponse, ScriptedBackend};
    use crate::memory::InMemoryTaskRecords;

    fn controller(backend: Arc<ScriptedBackend>) -> ContinuationController {
        let gateway = Arc::new(ProviderGateway::new(backend, None));
        ContinuationController::new(gateway, ContinuationConfig::default())
    }

    fn running_task() -> Task {
        let mut task = Task::new("write a long essay", vec![]);
        task.category = TaskCategory::Rag;
        task
    }

    #[test]
    fn test_marker_detection() {
        let rule = MarkerRule::default();
        assert_eq!(rule.detect("text\n[[DONE]]", FinishReason::Stop), MarkerSignal::Complete);
        assert_eq!(rule.detect("text\n[[CONTINUE]]", FinishReason::Stop), MarkerSignal::Continue);
        assert_eq!(
            rule.detect("[[CONTINUE]]\n[[DONE]]", FinishReason::Stop),
            MarkerSignal::Complete
        );
        assert_eq!(rule.detect("text", FinishReason::Length), MarkerSignal::Truncated);
        assert_eq!(rule.detect("```rust\nfn main() {", FinishReason::Stop), MarkerSignal::Truncated);
        assert_eq!(rule.detect("```\ncode\n```", FinishReason::Stop), MarkerSignal::None);
        // inline mention is not a marker
        assert_eq!(rule.detect("say [[DONE]] when done", FinishReason::Stop), MarkerSignal::None);
    }

    #[test]
    fn test_strip_removes_marker_lines() {
        let rule = MarkerRule::default();
        assert_eq!(rule.strip("part one\n[[CONTINUE]]\n"), "part one");
    }

    #[tokio::test]
    async fn test_completes_after_third_response() {
        let backend = Arc::new(ScriptedBackend::with_responses(
            "p",
            ["one\n[[CONTINUE]]", "two\n[[CONTINUE]]", "three\n[[DONE]]"],
        ));
        let records = Arc::new(InMemoryTaskRecords::new());
        let ctl = controller(backend.clone()).with_records(records.clone());
        let mut task = running_task();

        ctl.run(&mut task, "essay", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.iteration_count, 3);
        assert_eq!(task.accumulated_outputs, vec!["one", "two", "three"]);
        assert_eq!(backend.call_count(), 3);

        let prompts = backend.prompts();
        assert!(prompts[2].contains("one\ntwo"));
        let saved = records.load(&task.id).await.unwrap().unwrap();
        assert_eq!(saved.accumulated_outputs.len(), 3);
        assert_eq!(saved.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_iteration_cap_completes_with_note() {
        let backend = Arc::new(ScriptedBackend::with_responses(
            "p",
            std::iter::repeat("more\n[[CONTINUE]]").take(15),
        ));
        let ctl = controller(backend.clone());
        let mut task = running_task();

        ctl.run(&mut task, "essay", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.iteration_count, MAX_ITERATIONS);
        assert_eq!(backend.call_count(), MAX_ITERATIONS as usize);
        assert!(task.annotations.iter().any(|a| a == MAX_ITERATIONS_NOTE));
    }

    #[tokio::test]
    async fn test_stop_before_start_issues_no_call() {
        let backend = Arc::new(ScriptedBackend::with_responses("p", ["x\n[[DONE]]"]));
        let ctl = controller(backend.clone());
        let mut task = running_task();
        let stop = CancellationToken::new();
        stop.cancel();

        ctl.run(&mut task, "essay", &[], &stop).await.unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_during_call_keeps_output_within_grace() {
        let backend = Arc::new(
            ScriptedBackend::with_responses("p", ["partial\n[[CONTINUE]]", "never"])
                .with_delay(Duration::from_millis(50)),
        );
        let ctl = controller(backend.clone());
        let mut task = running_task();
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        ctl.run(&mut task, "essay", &[], &stop).await.unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
        assert_eq!(task.accumulated_outputs, vec!["partial"]);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_with_completion_marker_completes() {
        let backend = Arc::new(
            ScriptedBackend::with_responses("p", ["all\n[[DONE]]"])
                .with_delay(Duration::from_millis(30)),
        );
        let ctl = controller(backend);
        let mut task = running_task();
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        ctl.run(&mut task, "essay", &[], &stop).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_grace_expiry_abandons_call() {
        let backend = Arc::new(
            ScriptedBackend::with_responses("p", ["late\n[[DONE]]"])
                .with_delay(Duration::from_millis(500)),
        );
        let gateway = Arc::new(ProviderGateway::new(backend, None));
        let ctl = ContinuationController::new(
            gateway,
            ContinuationConfig {
                stop_grace: Duration::from_millis(20),
                ..ContinuationConfig::default()
            },
        );
        let mut task = running_task();
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        ctl.run(&mut task, "essay", &[], &stop).await.unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
        assert!(task.accumulated_outputs.is_empty());
        assert_eq!(task.iteration_count, 0);
    }

    #[tokio::test]
    async fn test_exhausted_provider_fails_and_keeps_outputs() {
        let backend = Arc::new(ScriptedBackend::with_responses("p", ["first\n[[CONTINUE]]"]));
        backend.push_err(BackendError::Network("gone".into()));
        let ctl = controller(backend);
        let mut task = running_task();

        ctl.run(&mut task, "essay", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.accumulated_outputs, vec!["first"]);
        assert!(task.error.as_deref().unwrap_or("").contains("gone"));
    }

    #[tokio::test]
    async fn test_length_truncation_continues() {
        let backend = Arc::new(ScriptedBackend::new("p"));
        backend.push(Ok(BackendResponse {
            text: "cut off".into(),
            usage: TokenUsage::new(5, 5),
            finish_reason: FinishReason::Length,
        }));
        backend.push_ok("rest");
        let ctl = controller(backend.clone());
        let mut task = running_task();

        let report = ctl
            .run(&mut task, "essay", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.iteration_count, 2);
        assert_eq!(report.providers, vec!["p", "p"]);
        assert_eq!(report.usage.total_tokens, 40);
    }
}
