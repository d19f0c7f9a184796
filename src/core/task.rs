//! 任务数据模型与状态机
//!
//! 状态转换：Pending → Running → (Continuing ⇄ Running) → {Completed | Failed | Stopped}。
//! Task 只由 TaskExecutor / ContinuationController 修改，终态时归档进 MemoryStore。

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::EngineError;

pub type TaskId = String;

/// 任务类别；Unknown 仅作为分类器输出，由调用方替换为默认类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Code,
    Multimedia,
    Rag,
    Automation,
    Analytics,
    Unknown,
}

impl TaskCategory {
    /// 可分派的五个类别（不含 Unknown）
    pub const ALL: [TaskCategory; 5] = [
        TaskCategory::Code,
        TaskCategory::Multimedia,
        TaskCategory::Rag,
        TaskCategory::Automation,
        TaskCategory::Analytics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Code => "code",
            TaskCategory::Multimedia => "multimedia",
            TaskCategory::Rag => "rag",
            TaskCategory::Automation => "automation",
            TaskCategory::Analytics => "analytics",
            TaskCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "code" => Ok(TaskCategory::Code),
            "multimedia" => Ok(TaskCategory::Multimedia),
            "rag" => Ok(TaskCategory::Rag),
            "automation" => Ok(TaskCategory::Automation),
            "analytics" => Ok(TaskCategory::Analytics),
            "unknown" => Ok(TaskCategory::Unknown),
            other => Err(format!("unknown task category: {other}")),
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Continuing,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }

    /// 状态机允许的转换；终态之后不再变化
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Stopped)
                | (Running, Continuing)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
                | (Continuing, Running)
                | (Continuing, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Continuing => "continuing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "continuing" => Ok(TaskStatus::Continuing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "stopped" => Ok(TaskStatus::Stopped),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// 单个任务：描述、类别、附件、状态与按序累积的输出
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub category: TaskCategory,
    pub files: Vec<PathBuf>,
    pub status: TaskStatus,
    pub iteration_count: u32,
    pub accumulated_outputs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub memory_enabled: bool,
    pub autonomous_mode: bool,
    /// 记忆库不可用等情况下以降级模式运行
    pub degraded: bool,
    /// 非错误性附注，如 "max iterations reached"
    pub annotations: Vec<String>,
    /// 失败时的聚合错误信息
    pub error: Option<String>,
}

impl Task {
    pub fn new(description: impl Into<String>, files: Vec<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            description: description.into(),
            category: TaskCategory::Unknown,
            files,
            status: TaskStatus::Pending,
            iteration_count: 0,
            accumulated_outputs: Vec::new(),
            created_at: now,
            updated_at: now,
            memory_enabled: true,
            autonomous_mode: false,
            degraded: false,
            annotations: Vec::new(),
            error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 状态转换；非法转换返回 InvalidTransition 且不修改状态
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn push_output(&mut self, text: impl Into<String>) {
        self.accumulated_outputs.push(text.into());
        self.updated_at = Utc::now();
    }

    pub fn annotate(&mut self, note: impl Into<String>) {
        self.annotations.push(note.into());
    }

    /// 按顺序拼接所有输出
    pub fn combined_output(&self) -> String {
        self.accumulated_outputs.join("\n")
    }
}

/// 外部提交面：submit(description, files, category_hint, memory_enabled, autonomous_mode)
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub description: String,
    pub files: Vec<PathBuf>,
    pub category_hint: Option<TaskCategory>,
    pub memory_enabled: bool,
    pub autonomous_mode: bool,
}

impl TaskSubmission {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            files: Vec::new(),
            category_hint: None,
            memory_enabled: true,
            autonomous_mode: false,
        }
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category_hint = Some(category);
        self
    }

    pub fn with_memory(mut self, enabled: bool) -> Self {
        self.memory_enabled = enabled;
        self
    }

    pub fn autonomous(mut self, enabled: bool) -> Self {
        self.autonomous_mode = enabled;
        self
    }

    /// 生成待执行的 Task（状态 Pending）
    pub fn into_task(self) -> Task {
        let mut task = Task::new(self.description, self.files);
        task.memory_enabled = self.memory_enabled;
        task.autonomous_mode = self.autonomous_mode;
        if let Some(category) = self.category_hint {
            task.category = category;
        }
        task
    }
}

/// 任务/工作流过程事件（可序列化为 JSON 推送给前端）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    StatusChanged {
        task_id: TaskId,
        status: TaskStatus,
    },
    Classified {
        task_id: TaskId,
        category: TaskCategory,
        confidence: f32,
    },
    Iteration {
        task_id: TaskId,
        iteration: u32,
        provider: String,
    },
    Degraded {
        task_id: TaskId,
        reason: String,
    },
    StepFinished {
        workflow_id: String,
        position: usize,
        status: String,
    },
}

pub(crate) fn send_event(
    tx: &Option<tokio::sync::mpsc::UnboundedSender<TaskEvent>>,
    ev: TaskEvent,
) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_lifecycle() {
        let mut task = Task::new("write a parser", vec![]);
        assert_eq!(task.status, TaskStatus::Pending);
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Continuing).unwrap();
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut task = Task::new("x", vec![]);
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Failed).unwrap();
        let err = task.transition(TaskStatus::Running).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let mut task = Task::new("x", vec![]);
        assert!(task.transition(TaskStatus::Completed).is_err());
        assert!(task.transition(TaskStatus::Stopped).is_ok());
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("RAG".parse::<TaskCategory>().unwrap(), TaskCategory::Rag);
        assert_eq!(
            " analytics ".parse::<TaskCategory>().unwrap(),
            TaskCategory::Analytics
        );
        assert!("poetry".parse::<TaskCategory>().is_err());
    }

    #[test]
    fn test_submission_into_task() {
        let task = TaskSubmission::new("summarize report")
            .with_category(TaskCategory::Rag)
            .with_memory(false)
            .autonomous(true)
            .into_task();
        assert_eq!(task.category, TaskCategory::Rag);
        assert!(!task.memory_enabled);
        assert!(task.autonomous_mode);
        assert!(task.id.starts_with("task_"));
    }
}
