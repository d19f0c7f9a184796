//! 工作流构建器
//!
//! 提供流畅的API来构建工作流；步骤修饰方法作用于最近添加的一步

use crate::autonomy::ActionSpec;
use crate::core::recovery::FailurePolicy;
use crate::workflow::types::*;

/// 工作流构建器
pub struct WorkflowBuilder {
    id: WorkflowId,
    name: String,
    steps: Vec<WorkflowStep>,
}

impl WorkflowBuilder {
    /// 创建新的工作流构建器
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("wf_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// 添加动作步骤（ActionSpec 上的 parallel_safe / depends_on_prev 一并带入）
    pub fn action(mut self, name: impl Into<String>, spec: ActionSpec) -> Self {
        let step = WorkflowStep {
            position: self.steps.len() + 1,
            name: name.into(),
            depends_on_prev: spec.depends_on_prev,
            parallel_safe: spec.parallel_safe,
            failure_policy: FailurePolicy::default(),
            target: StepTarget::Action(spec),
        };
        self.steps.push(step);
        self
    }

    /// 添加任务步骤
    pub fn task(mut self, name: impl Into<String>, spec: TaskSpec) -> Self {
        let step = WorkflowStep {
            position: self.steps.len() + 1,
            name: name.into(),
            target: StepTarget::Task(spec),
            depends_on_prev: false,
            parallel_safe: false,
            failure_policy: FailurePolicy::default(),
        };
        self.steps.push(step);
        self
    }

    /// 上一步未成功时跳过
    pub fn depends_on_prev(mut self) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.depends_on_prev = true;
        }
        self
    }

    /// 可与相邻的 parallel_safe 步骤并发
    pub fn parallel_safe(mut self) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.parallel_safe = true;
        }
        self
    }

    /// 设置失败策略
    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.failure_policy = policy;
        }
        self
    }

    /// 构建工作流
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let workflow = Workflow {
            id: self.id,
            name: self.name,
            steps: self.steps,
            created_at: chrono::Utc::now(),
        };
        workflow.validate()?;
        Ok(workflow)
    }
}
